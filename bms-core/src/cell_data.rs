//! Cell characteristics and operating limits

pub const MAX_BRICK_WARNING_VOLTAGE: f32 = 4.225;
pub const MAX_BRICK_FAULT_VOLTAGE: f32 = 4.25;
pub const MAX_BRICK_VOLTAGE: f32 = 4.2;
pub const MIN_BRICK_WARNING_VOLTAGE: f32 = 2.7;
pub const MIN_BRICK_FAULT_VOLTAGE: f32 = 2.5;
pub const NOMINAL_BRICK_VOLTAGE: f32 = 3.6;

pub const MAX_BRICK_TEMP_WARNING_C: f32 = 55.0;
pub const MAX_BRICK_TEMP_FAULT_C: f32 = 60.0;

pub const CELL_CAPACITY_AH: f32 = 3.0;
pub const NUM_PARALLEL_CELLS_PER_BRICK: usize = 4;
pub const MAX_CHARGE_C_RATING: f32 = 1.0;

/// Usable charge of one brick (a parallel cell group), in amp hours.
pub const BRICK_CAPACITY_AH: f32 = CELL_CAPACITY_AH * NUM_PARALLEL_CELLS_PER_BRICK as f32;

/// Pack charge capacity in milli-coulombs, for the coulomb counter.
pub const PACK_CAPACITY_MILLICOULOMBS: f32 = BRICK_CAPACITY_AH * 3600.0 * 1000.0;

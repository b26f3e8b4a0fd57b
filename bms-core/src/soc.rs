//! State of charge and energy tracking

#[allow(unused_imports)]
use micromath::F32Ext;

use crate::cell_data::PACK_CAPACITY_MILLICOULOMBS;
use crate::lookup::LookupTable;
use crate::timer::Timer;

/// Below this magnitude the pack is considered at rest.
pub const RESTING_CURRENT_THRESHOLD_A: f32 = 1.0;
/// How long the pack must rest before the OCV anchor is trusted.
pub const OCV_REST_QUALIFY_TIME_MS: u32 = 60_000;

#[rustfmt::skip]
const OCV_VOLTAGE: [f32; 14] = [
    2.50, 3.00, 3.20, 3.30, 3.45, 3.55, 3.65,
    3.75, 3.85, 3.95, 4.05, 4.10, 4.15, 4.20,
];

#[rustfmt::skip]
const OCV_SOC_PERCENT: [f32; 14] = [
    0.0, 2.0, 5.0, 8.0, 15.0, 25.0, 40.0,
    55.0, 68.0, 78.0, 88.0, 92.0, 96.0, 100.0,
];

/// Open-circuit voltage to state of charge, for a rested cell.
pub const OCV_SOC_TABLE: LookupTable<'static> = LookupTable {
    x: &OCV_VOLTAGE,
    y: &OCV_SOC_PERCENT,
};

// Energy lags charge at the bottom of the window because the cell voltage
// is lower there.
#[rustfmt::skip]
const SOE_SOC_PERCENT: [f32; 11] = [
    0.0, 10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0,
];

#[rustfmt::skip]
const SOE_ENERGY_PERCENT: [f32; 11] = [
    0.0, 7.0, 15.0, 24.0, 33.0, 43.0, 53.0, 64.0, 75.0, 87.0, 100.0,
];

pub const SOE_TABLE: LookupTable<'static> = LookupTable {
    x: &SOE_SOC_PERCENT,
    y: &SOE_ENERGY_PERCENT,
};

pub fn soc_from_cell_voltage(cell_voltage: f32) -> f32 {
    OCV_SOC_TABLE.lookup(cell_voltage)
}

pub fn soe_from_soc(soc_percent: f32) -> f32 {
    SOE_TABLE.lookup(soc_percent)
}

/// Blends the OCV map with coulomb counting.
///
/// While the pack has rested long enough for the cell voltage to approach
/// open-circuit, the OCV map is authoritative and re-anchors the coulomb
/// counter. Under load the reported value is the last anchored SoC plus the
/// integrated charge delta.
pub struct StateOfCharge {
    ocv_good_timer: Timer,
    ocv_good: bool,
    accumulated_millicoulombs: f32,
    last_good_soc: f32,
    soc_by_ocv: f32,
    soc_by_counting: f32,
    reported_soc: f32,
    reported_soe: f32,
}

impl Default for StateOfCharge {
    fn default() -> Self {
        Self::new()
    }
}

impl StateOfCharge {
    pub const fn new() -> Self {
        Self {
            ocv_good_timer: Timer::new(OCV_REST_QUALIFY_TIME_MS),
            ocv_good: false,
            accumulated_millicoulombs: 0.0,
            last_good_soc: 0.0,
            soc_by_ocv: 0.0,
            soc_by_counting: 0.0,
            reported_soc: 0.0,
            reported_soe: 0.0,
        }
    }

    /// Advance the estimate by one tick.
    ///
    /// `current_a` is positive out of the pack.
    pub fn update(&mut self, min_cell_voltage: f32, current_a: f32, dt_ms: u32) {
        self.soc_by_ocv = soc_from_cell_voltage(min_cell_voltage);

        if current_a.abs() < RESTING_CURRENT_THRESHOLD_A {
            self.ocv_good_timer.update(dt_ms);
        } else {
            self.ocv_good_timer.clear();
        }
        self.ocv_good = self.ocv_good_timer.expired();

        // amps times milliseconds is exactly millicoulombs
        self.accumulated_millicoulombs += current_a * dt_ms as f32;

        if self.ocv_good {
            self.last_good_soc = self.soc_by_ocv;
            self.accumulated_millicoulombs = 0.0;
            self.soc_by_counting = self.soc_by_ocv;
            self.reported_soc = self.soc_by_ocv;
        } else {
            let delta_percent =
                self.accumulated_millicoulombs / PACK_CAPACITY_MILLICOULOMBS * 100.0;
            self.soc_by_counting = (self.last_good_soc - delta_percent).clamp(0.0, 100.0);
            self.reported_soc = self.soc_by_counting;
        }

        self.reported_soe = soe_from_soc(self.reported_soc);
    }

    pub fn soc_percent(&self) -> f32 {
        self.reported_soc
    }

    pub fn soe_percent(&self) -> f32 {
        self.reported_soe
    }

    pub fn ocv_anchored(&self) -> bool {
        self.ocv_good
    }
}

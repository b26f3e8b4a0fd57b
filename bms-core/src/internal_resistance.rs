//! Windowed dV/dI internal-resistance estimation

#[allow(unused_imports)]
use micromath::F32Ext;

use crate::current_sense::CURRENT_LOW_TO_HIGH_SWITCH_THRESHOLD_A;
use crate::pack::{Pack, NUM_BMBS_PER_PACK, NUM_BRICKS_PER_BMB};

// Sliding estimation window of 5 s, split into 10 averaged slots. Current is
// sampled every 50 ms, brick voltages every 100 ms acquisition refresh.
pub const AVERAGE_BUFFER_SIZE: usize = 10;
pub const DISCRETE_CURRENT_BUFFER_SIZE: usize = 10;
pub const DISCRETE_VOLTAGE_BUFFER_SIZE: usize = 5;

/// Placeholder stored where a window contained bad sensor data.
pub const IR_INVALID: f32 = -1000.0;
// Everything above this is treated as a real sample.
const IR_VALID_LIMIT: f32 = -900.0;

/// Minimum current swing needed for a meaningful estimate.
pub const IR_MIN_CURRENT_DELTA_A: f32 = 1.0;

/// Builds per-brick resistance estimates from synchronized current and
/// voltage averages.
///
/// Discrete buffers collect consecutive samples; each time one fills, its
/// mean is emitted into a circular average buffer. A window that saw any
/// suspect or missing sample emits [`IR_INVALID`] instead, which excludes
/// that slot from the extrema search below.
pub struct InternalResistanceEstimator {
    current_window: [f32; DISCRETE_CURRENT_BUFFER_SIZE],
    current_index: usize,
    current_good: bool,
    current_ready: bool,

    voltage_window:
        [[[f32; DISCRETE_VOLTAGE_BUFFER_SIZE]; NUM_BRICKS_PER_BMB]; NUM_BMBS_PER_PACK],
    voltage_index: usize,
    voltage_good: [[bool; NUM_BRICKS_PER_BMB]; NUM_BMBS_PER_PACK],
    voltage_ready: bool,

    current_avg: [f32; AVERAGE_BUFFER_SIZE],
    voltage_avg: [[[f32; AVERAGE_BUFFER_SIZE]; NUM_BRICKS_PER_BMB]; NUM_BMBS_PER_PACK],
    avg_index: usize,
}

impl Default for InternalResistanceEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl InternalResistanceEstimator {
    pub const fn new() -> Self {
        Self {
            current_window: [IR_INVALID; DISCRETE_CURRENT_BUFFER_SIZE],
            current_index: 0,
            current_good: true,
            current_ready: false,
            voltage_window: [[[IR_INVALID; DISCRETE_VOLTAGE_BUFFER_SIZE]; NUM_BRICKS_PER_BMB];
                NUM_BMBS_PER_PACK],
            voltage_index: 0,
            voltage_good: [[true; NUM_BRICKS_PER_BMB]; NUM_BMBS_PER_PACK],
            voltage_ready: false,
            current_avg: [IR_INVALID; AVERAGE_BUFFER_SIZE],
            voltage_avg: [[[IR_INVALID; AVERAGE_BUFFER_SIZE]; NUM_BRICKS_PER_BMB];
                NUM_BMBS_PER_PACK],
            avg_index: 0,
        }
    }

    /// Push the latest tractive current sample.
    pub fn push_current(&mut self, pack: &mut Pack) {
        if pack.current_status_hi.is_good() || pack.current_status_lo.is_good() {
            self.current_window[self.current_index] = pack.tractive_current;
        } else {
            self.current_good = false;
        }

        self.current_index += 1;
        if self.current_index >= DISCRETE_CURRENT_BUFFER_SIZE {
            self.current_index = 0;
            self.current_ready = true;
            if self.voltage_ready {
                self.calculate(pack);
            }
        }
    }

    /// Push the latest brick voltage scan.
    pub fn push_voltage(&mut self, pack: &mut Pack) {
        for i in 0..NUM_BMBS_PER_PACK {
            for j in 0..NUM_BRICKS_PER_BMB {
                if pack.bmb[i].brick_v_status[j].is_good() {
                    self.voltage_window[i][j][self.voltage_index] = pack.bmb[i].brick_v[j];
                } else {
                    self.voltage_good[i][j] = false;
                }
            }
        }

        self.voltage_index += 1;
        if self.voltage_index >= DISCRETE_VOLTAGE_BUFFER_SIZE {
            self.voltage_index = 0;
            self.voltage_ready = true;
            if self.current_ready {
                self.calculate(pack);
            }
        }
    }

    fn calculate(&mut self, pack: &mut Pack) {
        // Emit this window's averages, or the invalid placeholder for any
        // channel that saw bad data. The good-flags rearm for the next
        // window either way.
        if self.current_good {
            let sum: f32 = self.current_window.iter().sum();
            self.current_avg[self.avg_index] = sum / DISCRETE_CURRENT_BUFFER_SIZE as f32;
        } else {
            self.current_avg[self.avg_index] = IR_INVALID;
            self.current_good = true;
        }

        for i in 0..NUM_BMBS_PER_PACK {
            for j in 0..NUM_BRICKS_PER_BMB {
                if self.voltage_good[i][j] {
                    let sum: f32 = self.voltage_window[i][j].iter().sum();
                    self.voltage_avg[i][j][self.avg_index] =
                        sum / DISCRETE_VOLTAGE_BUFFER_SIZE as f32;
                } else {
                    self.voltage_avg[i][j][self.avg_index] = IR_INVALID;
                    self.voltage_good[i][j] = true;
                }
            }
        }

        self.avg_index += 1;
        if self.avg_index >= AVERAGE_BUFFER_SIZE {
            self.avg_index = 0;
        }

        self.current_ready = false;
        self.voltage_ready = false;
        self.current_index = 0;
        self.voltage_index = 0;

        let Some((max_index, min_index)) = self.current_extrema() else {
            return;
        };

        let delta_current = self.current_avg[max_index] - self.current_avg[min_index];
        if delta_current.abs() < IR_MIN_CURRENT_DELTA_A
            || delta_current.abs() > CURRENT_LOW_TO_HIGH_SWITCH_THRESHOLD_A
        {
            return;
        }

        for i in 0..NUM_BMBS_PER_PACK {
            for j in 0..NUM_BRICKS_PER_BMB {
                let v_at_max = self.voltage_avg[i][j][max_index];
                let v_at_min = self.voltage_avg[i][j][min_index];
                if v_at_max > IR_VALID_LIMIT && v_at_min > IR_VALID_LIMIT {
                    pack.brick_resistance[i][j] = (v_at_max - v_at_min) / delta_current;
                }
            }
        }
    }

    // Indices of the largest and smallest valid current averages.
    fn current_extrema(&self) -> Option<(usize, usize)> {
        let mut max_index = None;
        let mut min_index = None;

        for (i, &value) in self.current_avg.iter().enumerate() {
            if value <= IR_VALID_LIMIT {
                continue;
            }
            match max_index {
                Some(m) if value <= self.current_avg[m] => {}
                _ => max_index = Some(i),
            }
            match min_index {
                Some(m) if value >= self.current_avg[m] => {}
                _ => min_index = Some(i),
            }
        }

        max_index.zip(min_index)
    }
}

//! Dual-range tractive current arbitration

#[allow(unused_imports)]
use micromath::F32Ext;

use crate::pack::{Pack, SensorStatus};

/// Sampling period of the current sensor inputs.
pub const CURRENT_SENSOR_UPDATE_PERIOD_MS: u32 = 50;

// A channel reading beyond its rail threshold means the sensor input has
// saturated to a supply rail and carries no information.
pub const CURRENT_HIGH_RAIL_THRESHOLD_A: f32 = 590.0;
pub const CURRENT_LOW_RAIL_THRESHOLD_A: f32 = 87.0;

/// Above this the low-range channel is out of its measuring range and the
/// high-range channel takes over.
pub const CURRENT_LOW_TO_HIGH_SWITCH_THRESHOLD_A: f32 = 75.0;

/// Fold the two current-sensor channels into `pack.tractive_current`.
///
/// The low-range channel is preferred for resolution; the high-range channel
/// is used when the reading exceeds the low channel's span or the low channel
/// has failed. A railed channel is marked [`SensorStatus::Missing`].
pub fn update_tractive_current(pack: &mut Pack, current_hi: f32, current_lo: f32) {
    pack.current_status_hi = if current_hi.abs() < CURRENT_HIGH_RAIL_THRESHOLD_A {
        SensorStatus::Good
    } else {
        log::warn!("current sensor high channel has railed");
        SensorStatus::Missing
    };

    pack.current_status_lo = if current_lo.abs() < CURRENT_LOW_RAIL_THRESHOLD_A {
        SensorStatus::Good
    } else {
        log::warn!("current sensor low channel has railed");
        SensorStatus::Missing
    };

    if pack.current_status_hi.is_good()
        && (current_hi.abs() > CURRENT_LOW_TO_HIGH_SWITCH_THRESHOLD_A
            || !pack.current_status_lo.is_good())
    {
        pack.tractive_current = current_hi;
    } else if pack.current_status_lo.is_good() {
        pack.tractive_current = current_lo;
    } else {
        // Both channels dead; the last plausible reading stands and the
        // current-sensor alert picks this up.
        log::error!("no usable current sensor channel");
    }
}

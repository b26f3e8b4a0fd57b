//! Charger request logic and CAN frame codec

#[allow(unused_imports)]
use micromath::F32Ext;

use crate::cell_data::{BRICK_CAPACITY_AH, MAX_CHARGE_C_RATING};

/// Extended frame identifiers for the charger link. Configuration, not
/// protocol.
pub const CHARGER_CAN_ID_TX: u32 = 0x1806E5F4;
pub const CHARGER_CAN_ID_RX: u32 = 0x18FF50E5;

/// The charger faults if it sees no request for 5 s; requests go out well
/// inside that.
pub const CHARGER_UPDATE_PERIOD_MS: u32 = 10;
/// After this long without telemetry the charger is treated as disconnected.
pub const CHARGER_RX_TIMEOUT_MS: u32 = 5000;

// Hysteresis bounds for pack imbalance and max cell voltage. Charging stops
// at the high bounds and resumes only below both low bounds, so balancing
// has room to work between the two.
pub const MAX_CELL_IMBALANCE_THRES_HIGH: f32 = 0.10;
pub const MAX_CELL_IMBALANCE_THRES_LOW: f32 = 0.05;
pub const MAX_CELL_VOLTAGE_THRES_HIGH: f32 = 4.21;
pub const MAX_CELL_VOLTAGE_THRES_LOW: f32 = 4.195;

// Allowed disagreement between charger telemetry and our own measurements.
pub const CHARGER_VOLTAGE_MISMATCH_THRESHOLD_V: f32 = 15.0;
pub const CHARGER_CURRENT_MISMATCH_THRESHOLD_A: f32 = 5.0;

pub const MAX_CHARGE_CURRENT_A: f32 = BRICK_CAPACITY_AH * MAX_CHARGE_C_RATING;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChargerRequest {
    Enable,
    Disable,
}

/// Observed charger condition, decoded from telemetry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChargerStatus {
    /// No telemetry inside the RX timeout.
    Disconnected,
    Nominal,
    /// Charger output voltage disagrees with the measured pack voltage.
    VoltageMismatch,
    /// Charger output current disagrees with the measured pack current.
    CurrentMismatch,
    HardwareFailure,
    OverTemperature,
    InputVoltage,
    BatteryDisconnected,
    CommsTimeout,
}

// Status byte flags, MSB first.
const STATUS_BIT_FAULTS: [ChargerStatus; 5] = [
    ChargerStatus::HardwareFailure,
    ChargerStatus::OverTemperature,
    ChargerStatus::InputVoltage,
    ChargerStatus::BatteryDisconnected,
    ChargerStatus::CommsTimeout,
];

/// Build the 8-byte request payload.
///
/// Bytes 0..4 carry the requested voltage and current in tenths, big-endian.
/// Byte 4 set to 1 tells the charger to shut its output down.
pub fn encode_request(request: ChargerRequest, voltage_v: f32, current_a: f32) -> [u8; 8] {
    let mut frame = [0; 8];

    match request {
        ChargerRequest::Enable => {
            let deci_volts = (voltage_v * 10.0) as u16;
            let deci_amps = (current_a * 10.0) as u16;

            frame[0..2].copy_from_slice(&deci_volts.to_be_bytes());
            frame[2..4].copy_from_slice(&deci_amps.to_be_bytes());
        }
        ChargerRequest::Disable => {
            frame[4] = 1;
        }
    }

    frame
}

/// Telemetry decoded from a charger status frame.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChargerTelemetry {
    pub voltage_v: f32,
    pub current_a: f32,
    pub status_bits: u8,
}

pub fn decode_telemetry(frame: &[u8; 8]) -> ChargerTelemetry {
    let deci_volts = u16::from_be_bytes([frame[0], frame[1]]);
    let deci_amps = u16::from_be_bytes([frame[2], frame[3]]);

    ChargerTelemetry {
        voltage_v: deci_volts as f32 / 10.0,
        current_a: deci_amps as f32 / 10.0,
        status_bits: frame[4],
    }
}

/// Decide whether charging should run, with hysteresis.
///
/// Inside the band between the low and high bounds the previous decision
/// stands, so the charger does not chatter while balancing pulls the
/// imbalance down.
pub fn update_request(
    max_brick_v: f32,
    min_brick_v: f32,
    previous: ChargerRequest,
) -> ChargerRequest {
    let imbalance = max_brick_v - min_brick_v;

    if imbalance >= MAX_CELL_IMBALANCE_THRES_HIGH || max_brick_v >= MAX_CELL_VOLTAGE_THRES_HIGH {
        ChargerRequest::Disable
    } else if imbalance <= MAX_CELL_IMBALANCE_THRES_LOW
        && max_brick_v <= MAX_CELL_VOLTAGE_THRES_LOW
    {
        ChargerRequest::Enable
    } else {
        previous
    }
}

/// Check charger telemetry against our own pack measurements, then scan the
/// status byte MSB-first for the charger's self-reported faults.
pub fn validate(
    telemetry: &ChargerTelemetry,
    pack_voltage_estimate: f32,
    measured_current: f32,
) -> ChargerStatus {
    if (pack_voltage_estimate - telemetry.voltage_v).abs() > CHARGER_VOLTAGE_MISMATCH_THRESHOLD_V {
        return ChargerStatus::VoltageMismatch;
    }

    if (measured_current - telemetry.current_a).abs() > CHARGER_CURRENT_MISMATCH_THRESHOLD_A {
        return ChargerStatus::CurrentMismatch;
    }

    let mut mask = 0x80;
    for &fault in STATUS_BIT_FAULTS.iter() {
        if telemetry.status_bits & mask != 0 {
            return fault;
        }
        mask >>= 1;
    }

    ChargerStatus::Nominal
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hysteresis_walk() {
        // 40 mV of imbalance throughout, inside both bounds.
        let mut request = ChargerRequest::Enable;

        request = update_request(4.215, 4.175, request);
        assert_eq!(request, ChargerRequest::Disable);

        // Back below the high bound but above the low bound: hold.
        request = update_request(4.199, 4.159, request);
        assert_eq!(request, ChargerRequest::Disable);

        request = update_request(4.195, 4.155, request);
        assert_eq!(request, ChargerRequest::Enable);
    }

    #[test]
    fn imbalance_alone_disables() {
        let request = update_request(4.10, 3.99, ChargerRequest::Enable);
        assert_eq!(request, ChargerRequest::Disable);
    }

    #[test]
    fn enable_frame_layout() {
        let frame = encode_request(ChargerRequest::Enable, 50.4, 12.0);
        assert_eq!(frame, [0x01, 0xF8, 0x00, 0x78, 0, 0, 0, 0]);
    }

    #[test]
    fn disable_frame_layout() {
        let frame = encode_request(ChargerRequest::Disable, 50.4, 12.0);
        assert_eq!(frame, [0, 0, 0, 0, 1, 0, 0, 0]);
    }

    #[test]
    fn telemetry_decode() {
        let telemetry = decode_telemetry(&[0x01, 0xF8, 0x00, 0x78, 0x00, 0, 0, 0]);
        assert!((telemetry.voltage_v - 50.4).abs() < 1e-3);
        assert!((telemetry.current_a - 12.0).abs() < 1e-3);
    }

    #[test]
    fn validation_order_and_faults() {
        let telemetry = ChargerTelemetry {
            voltage_v: 50.0,
            current_a: 12.0,
            status_bits: 0,
        };

        assert_eq!(validate(&telemetry, 50.4, 11.0), ChargerStatus::Nominal);
        assert_eq!(validate(&telemetry, 70.0, 11.0), ChargerStatus::VoltageMismatch);
        assert_eq!(validate(&telemetry, 50.4, 20.0), ChargerStatus::CurrentMismatch);

        let faulted = ChargerTelemetry {
            status_bits: 0b0011_0000,
            ..telemetry
        };
        // MSB-first: input voltage outranks battery-disconnected.
        assert_eq!(validate(&faulted, 50.4, 11.0), ChargerStatus::InputVoltage);
    }
}

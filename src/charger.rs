//! Charger request loop and telemetry validation

use bms_core::charger::{
    decode_telemetry, encode_request, update_request, validate, ChargerRequest, ChargerStatus,
    CHARGER_CAN_ID_TX, CHARGER_RX_TIMEOUT_MS, MAX_CELL_VOLTAGE_THRES_LOW, MAX_CHARGE_CURRENT_A,
};
use bms_core::pack::Pack;
use bms_core::timer::Timer;

/// Frame-level primitive to the charger bus. The CAN driver itself is board
/// integration; this core only needs to hand frames over and pick up the
/// latest one received.
pub trait ChargerBus {
    type Error;

    async fn send(&mut self, id: u32, frame: &[u8; 8]) -> Result<(), Self::Error>;

    /// Latest frame received since the previous call, if any.
    fn try_receive(&mut self) -> Option<[u8; 8]>;
}

/// Periodic charger control: hysteresis request, telemetry validation, and
/// the disconnect timeout.
pub struct ChargerController<C> {
    bus: C,
    rx_timeout: Timer,
}

impl<C: ChargerBus> ChargerController<C> {
    pub fn new(bus: C) -> Self {
        Self {
            bus,
            rx_timeout: Timer::new(CHARGER_RX_TIMEOUT_MS),
        }
    }

    /// Run one charger period: consume telemetry, decide the request, and
    /// send it. `inhibit` forces a disable request regardless of the pack
    /// state.
    pub async fn update(&mut self, pack: &mut Pack, dt_ms: u32, inhibit: bool) {
        if let Some(frame) = self.bus.try_receive() {
            self.rx_timeout.clear();

            let telemetry = decode_telemetry(&frame);
            let pack_voltage_estimate = pack.avg_brick_v * Pack::cells_in_series() as f32;
            pack.charger_status =
                validate(&telemetry, pack_voltage_estimate, pack.tractive_current);

            if pack.charger_status != ChargerStatus::Nominal {
                log::warn!("charger fault: {:?}", pack.charger_status);
            }
        } else {
            self.rx_timeout.update(dt_ms);
            if self.rx_timeout.expired() {
                pack.charger_status = ChargerStatus::Disconnected;
            }
        }

        let mut request = update_request(pack.max_brick_v, pack.min_brick_v, pack.charger_request);

        let faulted = !matches!(
            pack.charger_status,
            ChargerStatus::Nominal | ChargerStatus::Disconnected
        );
        if inhibit || faulted {
            request = ChargerRequest::Disable;
        }
        pack.charger_request = request;

        let frame = encode_request(
            request,
            MAX_CELL_VOLTAGE_THRES_LOW * Pack::cells_in_series() as f32,
            MAX_CHARGE_CURRENT_A,
        );
        if self.bus.send(CHARGER_CAN_ID_TX, &frame).await.is_err() {
            log::warn!("failed to send charger request");
        }
    }
}

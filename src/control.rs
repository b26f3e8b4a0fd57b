//! Main-context scheduler

use embassy_time::{Duration, Ticker};
use embedded_hal::digital::OutputPin;
use enumset::EnumSet;

use bms_core::aggregate::aggregate_pack;
use bms_core::alerts::{AlertMonitor, AlertResponse};
use bms_core::balancing::{
    set_bleed_requests, set_bleed_requests_to_voltage, MIN_BLEED_TARGET_VOLTAGE,
};
use bms_core::charger::CHARGER_UPDATE_PERIOD_MS;
use bms_core::current_sense::{update_tractive_current, CURRENT_SENSOR_UPDATE_PERIOD_MS};
use bms_core::internal_resistance::InternalResistanceEstimator;
use bms_core::pack::{BmsHwState, Pack, NUM_BMBS_PER_PACK};
use bms_core::soc::StateOfCharge;
use bms_core::timer::Timer;
use max17823::{ChainBus, Max17823Chain};

use crate::charger::{ChargerBus, ChargerController};
use crate::display::{build_summary, SummaryMailbox, DISPLAY_UPDATE_PERIOD_MS};
use crate::inputs::SystemInputs;

pub const MAIN_LOOP_PERIOD_MS: u32 = 1;

/// How often the bleed selection is re-run and the BMB watchdogs re-armed.
const BALANCE_UPDATE_PERIOD_MS: u32 = 1000;

/// Startup attempts before the pack is declared unusable.
const INIT_ATTEMPTS: u32 = 5;

/// The whole pack-supervision loop: acquisition, aggregation, balancing,
/// alerts, charger control, SoC, and the display feed, strictly sequenced on
/// one task.
pub struct Bms<B, C, I, FAULT> {
    chain: Max17823Chain<B>,
    charger: ChargerController<C>,
    inputs: I,
    fault_out: FAULT,
    mailbox: &'static SummaryMailbox,

    pack: Pack,
    alerts: AlertMonitor,
    ir: InternalResistanceEstimator,
    soc: StateOfCharge,
    responses: EnumSet<AlertResponse>,

    current_timer: Timer,
    balance_timer: Timer,
    charger_timer: Timer,
    display_timer: Timer,
}

impl<B, C, I, FAULT> Bms<B, C, I, FAULT>
where
    B: ChainBus,
    C: ChargerBus,
    I: SystemInputs,
    FAULT: OutputPin,
{
    pub fn new(
        chain_bus: B,
        charger_bus: C,
        inputs: I,
        fault_out: FAULT,
        mailbox: &'static SummaryMailbox,
    ) -> Self {
        Self {
            chain: Max17823Chain::new(chain_bus),
            charger: ChargerController::new(charger_bus),
            inputs,
            fault_out,
            mailbox,
            pack: Pack::new(),
            alerts: AlertMonitor::new(),
            ir: InternalResistanceEstimator::new(),
            soc: StateOfCharge::new(),
            responses: EnumSet::empty(),
            current_timer: Timer::new(CURRENT_SENSOR_UPDATE_PERIOD_MS),
            balance_timer: Timer::new(BALANCE_UPDATE_PERIOD_MS),
            charger_timer: Timer::new(CHARGER_UPDATE_PERIOD_MS),
            display_timer: Timer::new(DISPLAY_UPDATE_PERIOD_MS),
        }
    }

    pub fn pack(&self) -> &Pack {
        &self.pack
    }

    /// Bring the link up, enumerate the chain, and program the BMBs.
    pub async fn init(&mut self) -> bool {
        for attempt in 1..=INIT_ATTEMPTS {
            log::info!("initializing BMB chain, attempt {}", attempt);

            if self.chain.init_link().await.is_err() {
                continue;
            }

            let count = match self.chain.enumerate().await {
                Ok(count) => count,
                Err(_) => continue,
            };
            if count != NUM_BMBS_PER_PACK {
                log::error!(
                    "number of BMBs detected ({}) doesn't match expectation ({})",
                    count,
                    NUM_BMBS_PER_PACK
                );
                continue;
            }

            if self.chain.init().await.is_err() {
                continue;
            }

            log::info!("BMB chain up with {} devices", count);
            self.pack.hw_state = BmsHwState::Nominal;
            return true;
        }

        self.pack.hw_state = BmsHwState::SensorFailure;
        false
    }

    /// Run forever at the main loop period.
    pub async fn run(&mut self) -> ! {
        if !self.init().await {
            log::error!("battery pack initialization failed");
        }

        let mut ticker = Ticker::every(Duration::from_millis(MAIN_LOOP_PERIOD_MS as u64));
        loop {
            ticker.next().await;
            self.tick().await;
        }
    }

    // One main-loop step. Sub-steps are strictly sequenced: transport, then
    // aggregation, then the alert monitor, then everything downstream of it.
    async fn tick(&mut self) {
        let dt = MAIN_LOOP_PERIOD_MS;

        if self.pack.hw_state == BmsHwState::Nominal {
            if self.chain.update(&mut self.pack).await {
                aggregate_pack(&mut self.pack);
                self.ir.push_voltage(&mut self.pack);
            }

            self.current_timer.update(dt);
            if self.current_timer.expired() {
                self.current_timer.clear();
                let reading = self.inputs.tractive_current();
                update_tractive_current(&mut self.pack, reading.high_a, reading.low_a);
                self.ir.push_current(&mut self.pack);
            }

            self.pack.comms_bucket_filled = self.chain.bus().link_filled();
        }

        let latches = self.inputs.sdc_latches();
        self.pack.ams_fault_latched = latches.ams;
        self.pack.imd_fault_latched = latches.imd;
        self.pack.bspd_fault_latched = latches.bspd;

        let imd = self.inputs.imd();
        self.pack.imd_frequency_hz = imd.frequency_hz;
        self.pack.imd_duty_percent = imd.duty_percent;

        self.responses = self.alerts.update(&self.pack, dt);

        self.pack.balancing_requested = self.inputs.balancing_enabled()
            && !self.responses.contains(AlertResponse::DisableBalancing);
        self.pack.limp_requested = self.responses.contains(AlertResponse::LimpMode);

        if self.responses.contains(AlertResponse::AmsFault) {
            self.fault_out.set_high().unwrap();
        } else {
            self.fault_out.set_low().unwrap();
        }

        if self.pack.hw_state == BmsHwState::Nominal {
            self.balance_timer.update(dt);
            if self.balance_timer.expired() {
                self.balance_timer.clear();

                if self.responses.contains(AlertResponse::EmergencyBleed) {
                    set_bleed_requests_to_voltage(&mut self.pack, MIN_BLEED_TARGET_VOLTAGE);
                } else {
                    let balance = self.pack.balancing_requested;
                    set_bleed_requests(&mut self.pack, balance);
                }
                self.chain.balance(&mut self.pack).await;
            }
        }

        self.soc
            .update(self.pack.min_brick_v, self.pack.tractive_current, dt);
        self.pack.soc_percent = self.soc.soc_percent();
        self.pack.soe_percent = self.soc.soe_percent();

        self.charger_timer.update(dt);
        if self.charger_timer.expired() {
            self.charger_timer.clear();
            let inhibit = self.responses.contains(AlertResponse::StopCharging);
            self.charger
                .update(&mut self.pack, CHARGER_UPDATE_PERIOD_MS, inhibit)
                .await;
        }

        self.display_timer.update(dt);
        if self.display_timer.expired() {
            self.display_timer.clear();
            self.mailbox
                .signal(build_summary(&self.pack, self.alerts.first_set()));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::charger::ChargerBus;
    use crate::inputs::{CurrentSenseReading, ImdReading, SdcLatches, SystemInputs};
    use bms_core::charger::ChargerRequest;
    use bms_core::pack::SensorStatus;
    use core::convert::Infallible;
    use embassy_futures::block_on;
    use std::cell::Cell;
    use std::rc::Rc;

    struct FakeChainBus {
        hello_count: u8,
        init_link_calls: u32,
        filled: bool,
        scan_done: bool,
    }

    impl FakeChainBus {
        fn new(hello_count: u8) -> Self {
            Self {
                hello_count,
                init_link_calls: 0,
                filled: false,
                scan_done: false,
            }
        }
    }

    impl ChainBus for FakeChainBus {
        type Error = ();

        async fn init_link(&mut self) -> Result<(), ()> {
            self.init_link_calls += 1;
            Ok(())
        }

        async fn hello_all(&mut self) -> Result<u8, ()> {
            Ok(self.hello_count)
        }

        async fn write_all(&mut self, _reg: u8, _value: u16, _expected: u8) -> Result<(), ()> {
            Ok(())
        }

        async fn write_device(&mut self, _index: usize, _reg: u8, _value: u16) -> Result<(), ()> {
            Ok(())
        }

        async fn read_all(&mut self, reg: u8, out: &mut [u16]) -> Result<(), ()> {
            if reg == max17823::registers::SCANCTRL && self.scan_done {
                out.fill(max17823::registers::SCANCTRL_DONE_MASK);
            } else {
                out.fill(0);
            }
            Ok(())
        }

        async fn read_device(&mut self, _index: usize, _reg: u8) -> Result<u16, ()> {
            Ok(0)
        }

        fn link_filled(&self) -> bool {
            self.filled
        }
    }

    struct FakeChargerBus;

    impl ChargerBus for FakeChargerBus {
        type Error = ();

        async fn send(&mut self, _id: u32, _frame: &[u8; 8]) -> Result<(), ()> {
            Ok(())
        }

        fn try_receive(&mut self) -> Option<[u8; 8]> {
            None
        }
    }

    struct FakeInputs {
        balancing: bool,
    }

    impl SystemInputs for FakeInputs {
        fn tractive_current(&mut self) -> CurrentSenseReading {
            CurrentSenseReading {
                high_a: 0.0,
                low_a: 0.0,
            }
        }

        fn imd(&mut self) -> ImdReading {
            ImdReading::default()
        }

        fn sdc_latches(&mut self) -> SdcLatches {
            SdcLatches::default()
        }

        fn balancing_enabled(&mut self) -> bool {
            self.balancing
        }
    }

    #[derive(Clone)]
    struct FaultPin(Rc<Cell<bool>>);

    impl embedded_hal::digital::ErrorType for FaultPin {
        type Error = Infallible;
    }

    impl OutputPin for FaultPin {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.0.set(false);
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            self.0.set(true);
            Ok(())
        }
    }

    static MAILBOX: SummaryMailbox = SummaryMailbox::new();

    fn bms(
        chain: FakeChainBus,
        balancing: bool,
    ) -> (Bms<FakeChainBus, FakeChargerBus, FakeInputs, FaultPin>, Rc<Cell<bool>>) {
        let fault = Rc::new(Cell::new(false));
        let bms = Bms::new(
            chain,
            FakeChargerBus,
            FakeInputs { balancing },
            FaultPin(fault.clone()),
            &MAILBOX,
        );
        (bms, fault)
    }

    #[test]
    fn wrong_chain_length_exhausts_init_retries() {
        let (mut bms, _) = bms(FakeChainBus::new(3), false);

        let ok = block_on(bms.init());

        assert!(!ok);
        assert_eq!(bms.pack.hw_state, BmsHwState::SensorFailure);
        assert_eq!(bms.chain.bus().init_link_calls, 5);
    }

    #[test]
    fn successful_init_is_nominal() {
        let (mut bms, _) = bms(FakeChainBus::new(NUM_BMBS_PER_PACK as u8), false);

        assert!(block_on(bms.init()));
        assert_eq!(bms.pack.hw_state, BmsHwState::Nominal);
        assert_eq!(bms.chain.bus().init_link_calls, 1);
    }

    #[test]
    fn filled_comms_bucket_halts_charging_and_faults() {
        let (mut bms, fault) = bms(FakeChainBus::new(NUM_BMBS_PER_PACK as u8), false);
        block_on(bms.init());

        // Healthy voltages so only the comms alert can fire.
        bms.pack.max_brick_v = 4.0;
        bms.pack.min_brick_v = 3.9;
        bms.pack.current_status_lo = SensorStatus::Good;

        bms.chain.bus_mut().filled = true;

        block_on(async {
            // Comms alert qualifies after 500 ms; one extra charger period to
            // see it applied.
            for _ in 0..520 {
                bms.tick().await;
            }
        });

        assert!(bms.pack.comms_bucket_filled);
        assert_eq!(bms.pack.charger_request, ChargerRequest::Disable);
        assert!(fault.get());
    }

    #[test]
    fn overvoltage_forces_emergency_bleed() {
        let (mut bms, _) = bms(FakeChainBus::new(NUM_BMBS_PER_PACK as u8), false);
        block_on(bms.init());

        bms.pack.min_brick_v = 4.19;
        bms.pack.max_brick_v = 4.24;
        bms.pack.current_status_lo = SensorStatus::Good;
        for bmb in bms.pack.bmb.iter_mut() {
            bmb.brick_v = [4.21; 12];
            bmb.brick_v_status = [SensorStatus::Good; 12];
        }

        block_on(async {
            // Overvoltage qualifies after 2 s; the next balance period turns
            // the bleed on.
            for _ in 0..3100 {
                bms.tick().await;
            }
        });

        assert!(bms.responses.contains(AlertResponse::EmergencyBleed));
        let bmb = &bms.pack.bmb[0];
        assert!(bmb.bal_requested.iter().any(|&r| r));
        assert!(bmb.bal_active.iter().any(|&a| a));
        for i in 1..12 {
            assert!(!(bmb.bal_active[i] && bmb.bal_active[i - 1]));
        }
    }

    #[test]
    fn balancing_switch_gates_the_selector() {
        let (mut bms, _) = bms(FakeChainBus::new(NUM_BMBS_PER_PACK as u8), true);
        block_on(bms.init());

        bms.pack.min_brick_v = 3.60;
        bms.pack.max_brick_v = 3.70;
        bms.pack.current_status_lo = SensorStatus::Good;
        for bmb in bms.pack.bmb.iter_mut() {
            bmb.brick_v = [3.70; 12];
            bmb.brick_v[0] = 3.60;
            bmb.brick_v_status = [SensorStatus::Good; 12];
            bmb.min_brick_v = 3.60;
        }

        block_on(async {
            for _ in 0..1100 {
                bms.tick().await;
            }
        });

        assert!(bms.pack.balancing_requested);
        assert!(bms.pack.bmb[0].bal_requested.iter().any(|&r| r));
    }
}

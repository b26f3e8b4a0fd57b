#![cfg_attr(not(test), no_std)]
#![allow(async_fn_in_trait)]

//! Acquisition and balancing driver for a chain of MAX17823 battery monitor
//! boards, reached through the MAX17841 bridge.

use embassy_time::{Duration, Instant};
use embedded_hal::digital::OutputPin;
use embedded_hal_async::digital::Wait;
use embedded_hal_async::spi::SpiDevice;

use bms_core::balancing::select_balance_switches;
use bms_core::lookup::{LookupTable, NTC_TABLE, ZENER_TABLE};
use bms_core::pack::{
    Pack, SensorStatus, NUM_BMBS_PER_PACK, NUM_BOARD_TEMP_PER_BMB, NUM_BRICKS_PER_BMB,
    NUM_MUX_CHANNELS,
};
use max17841::Max17841;

pub mod registers;

use registers as reg;

/// Minimum spacing between acquisition cycles.
pub const DATA_REFRESH_DELAY_MS: u64 = 100;

// Brick voltages come back in bits [15:2] with a 5 V full scale, the block
// voltage with a 60 V full scale, and the aux inputs in bits [15:4] against
// the 3.3 V reference.
pub const CONVERT_14BIT_TO_5V: f32 = 5.0 / 16384.0;
pub const CONVERT_14BIT_TO_60V: f32 = 60.0 / 16384.0;
pub const CONVERT_12BIT_TO_3V3: f32 = 3.3 / 4096.0;

// Mux positions 0..5 route the Zener brick-temperature ladder, 6..7 the
// on-board NTC ladder.
const FIRST_BOARD_TEMP_CHANNEL: usize = 6;

/// Register-level access to the daisy chain. Implemented by the MAX17841
/// driver; tests substitute their own.
pub trait ChainBus {
    type Error;

    /// Bring the line driver to an operational state.
    async fn init_link(&mut self) -> Result<(), Self::Error>;

    async fn hello_all(&mut self) -> Result<u8, Self::Error>;
    async fn write_all(&mut self, reg: u8, value: u16, expected_count: u8)
        -> Result<(), Self::Error>;
    async fn write_device(
        &mut self,
        bmb_index: usize,
        reg: u8,
        value: u16,
    ) -> Result<(), Self::Error>;
    async fn read_all(&mut self, reg: u8, out: &mut [u16]) -> Result<(), Self::Error>;
    async fn read_device(&mut self, bmb_index: usize, reg: u8) -> Result<u16, Self::Error>;

    /// Sustained-failure latch of the underlying link.
    fn link_filled(&self) -> bool;
}

impl<SPI, INT, SHDN> ChainBus for Max17841<SPI, INT, SHDN>
where
    SPI: SpiDevice,
    INT: Wait,
    SHDN: OutputPin,
{
    type Error = max17841::Error<SPI::Error>;

    async fn init_link(&mut self) -> Result<(), Self::Error> {
        Max17841::init(self).await
    }

    async fn hello_all(&mut self) -> Result<u8, Self::Error> {
        Max17841::hello_all(self).await
    }

    async fn write_all(
        &mut self,
        reg: u8,
        value: u16,
        expected_count: u8,
    ) -> Result<(), Self::Error> {
        Max17841::write_all(self, reg, value, expected_count).await
    }

    async fn write_device(
        &mut self,
        bmb_index: usize,
        reg: u8,
        value: u16,
    ) -> Result<(), Self::Error> {
        Max17841::write_device(self, bmb_index, reg, value).await
    }

    async fn read_all(&mut self, reg: u8, out: &mut [u16]) -> Result<(), Self::Error> {
        Max17841::read_all(self, reg, out).await
    }

    async fn read_device(&mut self, bmb_index: usize, reg: u8) -> Result<u16, Self::Error> {
        Max17841::read_device(self, bmb_index, reg).await
    }

    fn link_filled(&self) -> bool {
        Max17841::link_filled(self)
    }
}

/// Driver state for the whole chain.
pub struct Max17823Chain<B> {
    bus: B,
    num_bmbs: usize,
    mux_channel: usize,
    gpio3: bool,
    last_update: Option<Instant>,
}

impl<B: ChainBus> Max17823Chain<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            num_bmbs: 0,
            mux_channel: 0,
            gpio3: false,
            last_update: None,
        }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn num_bmbs(&self) -> usize {
        self.num_bmbs
    }

    /// Allow the next [`update`](Self::update) to run regardless of the
    /// refresh gate.
    pub fn force_refresh(&mut self) {
        self.last_update = None;
    }

    /// Bring the underlying line driver up.
    pub async fn init_link(&mut self) -> Result<(), B::Error> {
        self.bus.init_link().await
    }

    /// Enumerate the chain and remember how many devices answered.
    pub async fn enumerate(&mut self) -> Result<usize, B::Error> {
        let count = self.bus.hello_all().await?;
        self.num_bmbs = count as usize;
        Ok(self.num_bmbs)
    }

    /// Program every BMB and kick off the first acquisition.
    pub async fn init(&mut self) -> Result<(), B::Error> {
        let n = self.num_bmbs as u8;

        // The alive counter is not active until this lands, so the echo
        // check expects a count of zero.
        self.bus
            .write_all(reg::DEVCFG1, reg::DEVCFG1_ALIVE_COUNTER, 0)
            .await?;

        self.bus
            .write_all(reg::MEASUREEN, reg::MEASUREEN_ALL, n)
            .await?;
        self.bus
            .write_all(reg::ACQCFG, reg::ACQCFG_THRM_SETTLE, n)
            .await?;
        self.bus
            .write_all(reg::AUTOBALSWDIS, reg::AUTOBALSWDIS_5MS, n)
            .await?;

        self.set_gpio(false, false, false, false).await?;

        self.bus
            .write_all(reg::SCANCTRL, reg::SCANCTRL_START_32X, n)
            .await?;

        Ok(())
    }

    /// Drive the BMB GPIO pins, which also select the aux mux channel.
    pub async fn set_gpio(
        &mut self,
        gpio0: bool,
        gpio1: bool,
        gpio2: bool,
        gpio3: bool,
    ) -> Result<(), B::Error> {
        let data = reg::GPIO_OUTPUT_MODE
            | (gpio3 as u16) << 3
            | (gpio2 as u16) << 2
            | (gpio1 as u16) << 1
            | gpio0 as u16;

        self.bus.write_all(reg::GPIO, data, self.num_bmbs as u8).await?;

        self.mux_channel = (data & 0x0007) as usize;
        self.gpio3 = gpio3;
        Ok(())
    }

    pub async fn set_mux(&mut self, channel: usize) -> Result<(), B::Error> {
        self.set_gpio(
            channel & 1 != 0,
            channel & 2 != 0,
            channel & 4 != 0,
            self.gpio3,
        )
        .await
    }

    /// Run one acquisition cycle if the refresh period has elapsed.
    ///
    /// Returns true when fresh data was folded into `pack`. Individual read
    /// failures mark the affected readings [`SensorStatus::Missing`] rather
    /// than aborting the cycle.
    pub async fn update(&mut self, pack: &mut Pack) -> bool {
        if let Some(last) = self.last_update {
            if last.elapsed() < Duration::from_millis(DATA_REFRESH_DELAY_MS) {
                return false;
            }
        }
        self.last_update = Some(Instant::now());

        let mut words = [0u16; NUM_BMBS_PER_PACK];

        // Every device must report SCANDONE and DATARDY before the data
        // registers are worth reading.
        match self.bus.read_all(reg::SCANCTRL, &mut words).await {
            Ok(()) => {
                let all_done = words
                    .iter()
                    .all(|&word| word & reg::SCANCTRL_DONE_MASK == reg::SCANCTRL_DONE_MASK);
                if !all_done {
                    log::warn!("BMB scan did not complete in time");
                    return false;
                }
            }
            Err(_) => {
                log::warn!("failed to read scan control register");
                return false;
            }
        }

        for brick in 0..NUM_BRICKS_PER_BMB {
            let cell_reg = reg::CELL1 + brick as u8;
            match self.bus.read_all(cell_reg, &mut words).await {
                Ok(()) => {
                    for (bmb, &word) in pack.bmb.iter_mut().zip(words.iter()) {
                        let raw = word >> 2;
                        bmb.brick_v[brick] = raw as f32 * CONVERT_14BIT_TO_5V;
                        bmb.brick_v_status[brick] = SensorStatus::Good;
                    }
                }
                Err(_) => {
                    for bmb in pack.bmb.iter_mut() {
                        bmb.brick_v_status[brick] = SensorStatus::Missing;
                    }
                }
            }
        }

        match self.bus.read_all(reg::VBLOCK, &mut words).await {
            Ok(()) => {
                for (bmb, &word) in pack.bmb.iter_mut().zip(words.iter()) {
                    let raw = word >> 2;
                    bmb.block_v = raw as f32 * CONVERT_14BIT_TO_60V;
                    bmb.block_v_status = SensorStatus::Good;
                }
            }
            Err(_) => {
                for bmb in pack.bmb.iter_mut() {
                    bmb.block_v_status = SensorStatus::Missing;
                }
            }
        }

        for (ain_index, ain_reg) in [reg::AIN1, reg::AIN2].into_iter().enumerate() {
            match self.bus.read_all(ain_reg, &mut words).await {
                Ok(()) => {
                    for (bmb_index, &word) in words.iter().enumerate() {
                        let volts = (word >> 4) as f32 * CONVERT_12BIT_TO_3V3;
                        self.store_temperature(pack, bmb_index, ain_index, volts);
                    }
                }
                Err(_) => {
                    for bmb_index in 0..pack.bmb.len() {
                        self.mark_temperature_missing(pack, bmb_index, ain_index);
                    }
                }
            }
        }

        // Route the next sensor pair and start the next oversampled scan.
        let next_mux = (self.mux_channel + 1) % NUM_MUX_CHANNELS;
        if self.set_mux(next_mux).await.is_err() {
            log::warn!("failed to cycle aux mux");
        }
        if self
            .bus
            .write_all(reg::SCANCTRL, reg::SCANCTRL_START_32X, self.num_bmbs as u8)
            .await
            .is_err()
        {
            log::warn!("failed to start next acquisition");
        }

        true
    }

    fn store_temperature(&self, pack: &mut Pack, bmb_index: usize, ain_index: usize, volts: f32) {
        let bmb = &mut pack.bmb[bmb_index];

        if self.mux_channel >= FIRST_BOARD_TEMP_CHANNEL {
            let index = self.mux_channel - FIRST_BOARD_TEMP_CHANNEL
                + ain_index * (NUM_BOARD_TEMP_PER_BMB / 2);
            bmb.board_temp[index] = NTC_TABLE.lookup(volts);
            bmb.board_temp_status[index] = conversion_status(&NTC_TABLE, volts);
        } else {
            let index = self.mux_channel + ain_index * (NUM_BRICKS_PER_BMB / 2);
            bmb.brick_temp[index] = ZENER_TABLE.lookup(volts);
            bmb.brick_temp_status[index] = conversion_status(&ZENER_TABLE, volts);
        }
    }

    fn mark_temperature_missing(&self, pack: &mut Pack, bmb_index: usize, ain_index: usize) {
        let bmb = &mut pack.bmb[bmb_index];

        if self.mux_channel >= FIRST_BOARD_TEMP_CHANNEL {
            let index = self.mux_channel - FIRST_BOARD_TEMP_CHANNEL
                + ain_index * (NUM_BOARD_TEMP_PER_BMB / 2);
            bmb.board_temp_status[index] = SensorStatus::Missing;
        } else {
            let index = self.mux_channel + ain_index * (NUM_BRICKS_PER_BMB / 2);
            bmb.brick_temp_status[index] = SensorStatus::Missing;
        }
    }

    /// Close the selected bleed switches and arm each board's watchdog.
    ///
    /// The watchdog opens every switch by itself if this stops being called,
    /// so a hung controller cannot leave a brick bleeding.
    pub async fn balance(&mut self, pack: &mut Pack) {
        for bmb_index in 0..pack.bmb.len() {
            select_balance_switches(&mut pack.bmb[bmb_index]);

            if self
                .bus
                .write_device(bmb_index, reg::WATCHDOG, reg::WATCHDOG_5S)
                .await
                .is_err()
            {
                log::warn!("failed to arm balancing watchdog on BMB {}", bmb_index);
            }

            let mut switches = 0u16;
            for (brick, &active) in pack.bmb[bmb_index].bal_active.iter().enumerate() {
                if active {
                    switches |= 1 << brick;
                }
            }

            if self
                .bus
                .write_device(bmb_index, reg::BALSWEN, switches)
                .await
                .is_err()
            {
                log::warn!("failed to write balance switches on BMB {}", bmb_index);
            }
        }
    }
}

// Aux readings outside the calibrated table range still produce a clamped
// temperature, but the reading is flagged so downstream consumers can
// discount it.
fn conversion_status(table: &LookupTable<'_>, volts: f32) -> SensorStatus {
    let last = table.x.len() - 1;
    if volts < table.x[0] || volts > table.x[last] {
        SensorStatus::Suspect
    } else {
        SensorStatus::Good
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use embassy_futures::block_on;
    use std::collections::{HashMap, HashSet};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Target {
        All(u8),
        Device(usize),
    }

    struct FakeBus {
        count: u8,
        registers: HashMap<u8, u16>,
        failing: HashSet<u8>,
        writes: Vec<(Target, u8, u16)>,
    }

    impl FakeBus {
        fn new(count: u8) -> Self {
            Self {
                count,
                registers: HashMap::new(),
                failing: HashSet::new(),
                writes: Vec::new(),
            }
        }

        fn set(&mut self, reg: u8, value: u16) {
            self.registers.insert(reg, value);
        }

        fn written(&self, reg: u8) -> Option<u16> {
            self.writes
                .iter()
                .rev()
                .find(|(_, r, _)| *r == reg)
                .map(|&(_, _, v)| v)
        }
    }

    impl ChainBus for FakeBus {
        type Error = ();

        async fn init_link(&mut self) -> Result<(), ()> {
            Ok(())
        }

        async fn hello_all(&mut self) -> Result<u8, ()> {
            Ok(self.count)
        }

        async fn write_all(&mut self, reg: u8, value: u16, expected: u8) -> Result<(), ()> {
            self.writes.push((Target::All(expected), reg, value));
            Ok(())
        }

        async fn write_device(&mut self, index: usize, reg: u8, value: u16) -> Result<(), ()> {
            self.writes.push((Target::Device(index), reg, value));
            Ok(())
        }

        async fn read_all(&mut self, reg: u8, out: &mut [u16]) -> Result<(), ()> {
            if self.failing.contains(&reg) {
                return Err(());
            }
            out.fill(self.registers.get(&reg).copied().unwrap_or(0));
            Ok(())
        }

        async fn read_device(&mut self, _index: usize, reg: u8) -> Result<u16, ()> {
            if self.failing.contains(&reg) {
                return Err(());
            }
            Ok(self.registers.get(&reg).copied().unwrap_or(0))
        }

        fn link_filled(&self) -> bool {
            false
        }
    }

    fn scan_ready_bus() -> FakeBus {
        let mut bus = FakeBus::new(1);
        bus.set(reg::SCANCTRL, reg::SCANCTRL_DONE_MASK | reg::SCANCTRL_START_32X);
        bus
    }

    #[test]
    fn init_programs_the_chain() {
        let mut chain = Max17823Chain::new(FakeBus::new(1));

        block_on(async {
            assert_eq!(chain.enumerate().await.unwrap(), 1);
            chain.init().await.unwrap();
        });

        let writes = &chain.bus().writes;
        // Alive counter enable goes out before it can be verified.
        assert_eq!(
            writes[0],
            (Target::All(0), reg::DEVCFG1, reg::DEVCFG1_ALIVE_COUNTER)
        );
        assert!(writes.contains(&(Target::All(1), reg::MEASUREEN, reg::MEASUREEN_ALL)));
        assert!(writes.contains(&(Target::All(1), reg::GPIO, reg::GPIO_OUTPUT_MODE)));
        // The initial scan kick is the last thing out.
        assert_eq!(
            writes.last(),
            Some(&(Target::All(1), reg::SCANCTRL, reg::SCANCTRL_START_32X))
        );
    }

    #[test]
    fn update_scales_and_cycles_the_mux() {
        let mut bus = scan_ready_bus();

        // 3.7 V brick: code 12124, carried in bits [15:2].
        bus.set(reg::CELL1, 12124 << 2);
        for i in 1..NUM_BRICKS_PER_BMB as u8 {
            bus.set(reg::CELL1 + i, 12124 << 2);
        }
        // 44.4 V block: code 12124 against the 60 V scale.
        bus.set(reg::VBLOCK, 12124 << 2);
        // 2.0 V on both aux inputs, carried in bits [15:4].
        let aux_code = (2.0 / CONVERT_12BIT_TO_3V3) as u16;
        bus.set(reg::AIN1, aux_code << 4);
        bus.set(reg::AIN2, aux_code << 4);

        let mut chain = Max17823Chain::new(bus);
        let mut pack = Pack::new();

        let refreshed = block_on(async {
            chain.enumerate().await.unwrap();
            chain.update(&mut pack).await
        });
        assert!(refreshed);

        let bmb = &pack.bmb[0];
        assert!((bmb.brick_v[0] - 3.7).abs() < 0.001);
        assert_eq!(bmb.brick_v_status[0], SensorStatus::Good);
        assert!((bmb.block_v - 44.4).abs() < 0.01);

        // Mux channel 0 is a Zener pair: AIN1 lands on brick temp 0, AIN2 on
        // brick temp 6.
        assert_eq!(bmb.brick_temp_status[0], SensorStatus::Good);
        assert_eq!(bmb.brick_temp_status[6], SensorStatus::Good);
        assert!(bmb.brick_temp[0] > 0.0 && bmb.brick_temp[0] < 25.0);

        // The cycle ends by advancing the mux and restarting the scan.
        assert_eq!(
            chain.bus().written(reg::GPIO),
            Some(reg::GPIO_OUTPUT_MODE | 1)
        );
        assert_eq!(chain.bus().written(reg::SCANCTRL), Some(reg::SCANCTRL_START_32X));
    }

    #[test]
    fn refresh_gate_holds_between_cycles() {
        let mut chain = Max17823Chain::new(scan_ready_bus());
        let mut pack = Pack::new();

        block_on(async {
            chain.enumerate().await.unwrap();
            assert!(chain.update(&mut pack).await);
            // Immediately after a refresh the gate blocks the next one.
            assert!(!chain.update(&mut pack).await);

            chain.force_refresh();
            assert!(chain.update(&mut pack).await);
        });
    }

    #[test]
    fn incomplete_scan_aborts_the_cycle() {
        let mut bus = scan_ready_bus();
        bus.set(reg::SCANCTRL, 0x2000); // DATARDY without SCANDONE
        bus.set(reg::CELL1, 12124 << 2);

        let mut chain = Max17823Chain::new(bus);
        let mut pack = Pack::new();

        block_on(async {
            chain.enumerate().await.unwrap();
            assert!(!chain.update(&mut pack).await);
        });

        // Nothing was read, statuses still unknown.
        assert_eq!(pack.bmb[0].brick_v_status[0], SensorStatus::Unknown);
    }

    #[test]
    fn failed_cell_read_marks_bricks_missing() {
        let mut bus = scan_ready_bus();
        bus.failing.insert(reg::CELL1 + 3);

        let mut chain = Max17823Chain::new(bus);
        let mut pack = Pack::new();

        block_on(async {
            chain.enumerate().await.unwrap();
            assert!(chain.update(&mut pack).await);
        });

        let bmb = &pack.bmb[0];
        assert_eq!(bmb.brick_v_status[3], SensorStatus::Missing);
        assert_eq!(bmb.brick_v_status[2], SensorStatus::Good);
        assert_eq!(bmb.brick_v_status[4], SensorStatus::Good);
    }

    #[test]
    fn balance_writeout_packs_switch_bits() {
        let mut chain = Max17823Chain::new(FakeBus::new(1));
        let mut pack = Pack::new();

        pack.bmb[0].brick_v[2] = 4.1;
        pack.bmb[0].brick_v[3] = 4.2;
        pack.bmb[0].brick_v[8] = 4.15;
        pack.bmb[0].bal_requested[2] = true;
        pack.bmb[0].bal_requested[3] = true;
        pack.bmb[0].bal_requested[8] = true;

        block_on(async {
            chain.enumerate().await.unwrap();
            chain.balance(&mut pack).await;
        });

        // Brick 3 beats its neighbor 2; brick 8 stands alone.
        assert_eq!(
            chain.bus().written(reg::BALSWEN),
            Some((1 << 3) | (1 << 8))
        );
        assert_eq!(chain.bus().written(reg::WATCHDOG), Some(reg::WATCHDOG_5S));
        assert!(pack.bmb[0].bal_active[3]);
        assert!(!pack.bmb[0].bal_active[2]);
    }
}

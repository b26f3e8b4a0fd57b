//! Loop inputs sourced outside this core

/// Dual-range tractive current sensor channels, in amps.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CurrentSenseReading {
    pub high_a: f32,
    pub low_a: f32,
}

/// Isolation monitor output, measured by the board's PWM capture.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImdReading {
    pub frequency_hz: f32,
    pub duty_percent: f32,
}

/// Safety-discharge-circuit latch pins.
#[derive(Clone, Copy, Debug, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SdcLatches {
    pub ams: bool,
    pub imd: bool,
    pub bspd: bool,
}

/// Everything the main loop samples from the rest of the car.
pub trait SystemInputs {
    fn tractive_current(&mut self) -> CurrentSenseReading;
    fn imd(&mut self) -> ImdReading;
    fn sdc_latches(&mut self) -> SdcLatches;

    /// Operator request to run cell balancing.
    fn balancing_enabled(&mut self) -> bool;
}

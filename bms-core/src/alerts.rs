//! Condition-bounded alert state machines

use enumset::{enum_set, EnumSet, EnumSetType};

use crate::cell_data::{MAX_BRICK_TEMP_WARNING_C, MAX_BRICK_VOLTAGE, MIN_BRICK_FAULT_VOLTAGE};
use crate::pack::Pack;
use crate::timer::Timer;

const OVERVOLTAGE_SET_TIME_MS: u32 = 2000;
const OVERVOLTAGE_CLEAR_TIME_MS: u32 = 2000;
const UNDERVOLTAGE_SET_TIME_MS: u32 = 2000;
const UNDERVOLTAGE_CLEAR_TIME_MS: u32 = 2000;
const OVERTEMP_SET_TIME_MS: u32 = 1000;
const OVERTEMP_CLEAR_TIME_MS: u32 = 1000;
const COMMS_SET_TIME_MS: u32 = 500;
const COMMS_CLEAR_TIME_MS: u32 = 2000;
const CURRENT_SENSOR_SET_TIME_MS: u32 = 100;
const CURRENT_SENSOR_CLEAR_TIME_MS: u32 = 1000;

/// Actions the scheduler takes while an alert is set. Combined with OR
/// across all alerts.
#[derive(EnumSetType, Debug)]
pub enum AlertResponse {
    Info,
    DisableBalancing,
    EmergencyBleed,
    StopCharging,
    LimpMode,
    /// Assert the safety-discharge-circuit output. The only response that
    /// opens the contactors.
    AmsFault,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AlertStatus {
    Cleared,
    Set,
}

pub type AlertCondition = fn(&Pack) -> bool;

/// A latching alert with distinct set and clear qualification times.
///
/// The condition must hold continuously for `set_time` before the alert
/// latches, and fail continuously for `clear_time` before it releases. A
/// transient toggle resets the opposing timer.
pub struct Alert {
    pub name: &'static str,
    status: AlertStatus,
    set_timer: Timer,
    clear_timer: Timer,
    condition: AlertCondition,
    responses: EnumSet<AlertResponse>,
}

impl Alert {
    pub const fn new(
        name: &'static str,
        set_time_ms: u32,
        clear_time_ms: u32,
        condition: AlertCondition,
        responses: EnumSet<AlertResponse>,
    ) -> Self {
        Self {
            name,
            status: AlertStatus::Cleared,
            set_timer: Timer::new(set_time_ms),
            clear_timer: Timer::new(clear_time_ms),
            condition,
            responses,
        }
    }

    pub fn status(&self) -> AlertStatus {
        self.status
    }

    /// The configured responses, only while the alert is set.
    pub fn response(&self) -> EnumSet<AlertResponse> {
        match self.status {
            AlertStatus::Set => self.responses,
            AlertStatus::Cleared => EnumSet::empty(),
        }
    }

    /// Evaluate the condition and advance the state machine by `dt_ms`.
    pub fn update(&mut self, pack: &Pack, dt_ms: u32) {
        let present = (self.condition)(pack);

        match self.status {
            AlertStatus::Cleared => {
                if present {
                    self.set_timer.update(dt_ms);
                    if self.set_timer.expired() {
                        log::warn!("alert set: {}", self.name);
                        self.status = AlertStatus::Set;
                        self.clear_timer.clear();
                    }
                } else {
                    self.set_timer.clear();
                }
            }
            AlertStatus::Set => {
                if present {
                    self.clear_timer.clear();
                } else {
                    self.clear_timer.update(dt_ms);
                    if self.clear_timer.expired() {
                        log::info!("alert cleared: {}", self.name);
                        self.status = AlertStatus::Cleared;
                        self.set_timer.clear();
                    }
                }
            }
        }
    }
}

fn overvoltage_present(pack: &Pack) -> bool {
    pack.max_brick_v > MAX_BRICK_VOLTAGE
}

fn undervoltage_present(pack: &Pack) -> bool {
    pack.min_brick_v < MIN_BRICK_FAULT_VOLTAGE
}

fn overtemperature_present(pack: &Pack) -> bool {
    pack.max_brick_temp > MAX_BRICK_TEMP_WARNING_C
}

fn comms_degraded(pack: &Pack) -> bool {
    pack.comms_bucket_filled
}

fn current_sensor_failed(pack: &Pack) -> bool {
    !pack.current_status_hi.is_good() && !pack.current_status_lo.is_good()
}

pub const NUM_ALERTS: usize = 5;

/// All pack alerts, created once at startup and never destroyed.
pub struct AlertMonitor {
    alerts: [Alert; NUM_ALERTS],
}

impl Default for AlertMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertMonitor {
    pub const fn new() -> Self {
        Self {
            alerts: [
                Alert::new(
                    "overvoltage",
                    OVERVOLTAGE_SET_TIME_MS,
                    OVERVOLTAGE_CLEAR_TIME_MS,
                    overvoltage_present,
                    enum_set!(AlertResponse::StopCharging | AlertResponse::EmergencyBleed),
                ),
                Alert::new(
                    "undervoltage",
                    UNDERVOLTAGE_SET_TIME_MS,
                    UNDERVOLTAGE_CLEAR_TIME_MS,
                    undervoltage_present,
                    enum_set!(AlertResponse::DisableBalancing | AlertResponse::LimpMode),
                ),
                Alert::new(
                    "overtemperature",
                    OVERTEMP_SET_TIME_MS,
                    OVERTEMP_CLEAR_TIME_MS,
                    overtemperature_present,
                    enum_set!(AlertResponse::StopCharging | AlertResponse::AmsFault),
                ),
                Alert::new(
                    "comms degraded",
                    COMMS_SET_TIME_MS,
                    COMMS_CLEAR_TIME_MS,
                    comms_degraded,
                    enum_set!(AlertResponse::StopCharging | AlertResponse::AmsFault),
                ),
                Alert::new(
                    "current sensor failed",
                    CURRENT_SENSOR_SET_TIME_MS,
                    CURRENT_SENSOR_CLEAR_TIME_MS,
                    current_sensor_failed,
                    enum_set!(AlertResponse::Info | AlertResponse::LimpMode),
                ),
            ],
        }
    }

    /// Run every alert machine once and OR their responses together.
    pub fn update(&mut self, pack: &Pack, dt_ms: u32) -> EnumSet<AlertResponse> {
        let mut responses = EnumSet::empty();
        for alert in self.alerts.iter_mut() {
            alert.update(pack, dt_ms);
            responses |= alert.response();
        }
        responses
    }

    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    /// Name of the first set alert, for the status display.
    pub fn first_set(&self) -> Option<&'static str> {
        self.alerts
            .iter()
            .find(|alert| alert.status() == AlertStatus::Set)
            .map(|alert| alert.name)
    }
}

//! Status summary feed for the e-paper task

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

use bms_core::charger::ChargerRequest;
use bms_core::pack::{BmsHwState, Pack};

/// How often a fresh summary is posted for the display.
pub const DISPLAY_UPDATE_PERIOD_MS: u32 = 2000;

/// Everything the rasterizer draws.
#[derive(Clone, Copy, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DisplaySummary {
    pub max_brick_v: f32,
    pub min_brick_v: f32,
    pub avg_brick_v: f32,

    pub max_brick_temp: f32,
    pub min_brick_temp: f32,
    pub avg_brick_temp: f32,

    pub max_board_temp: f32,
    pub min_board_temp: f32,
    pub avg_board_temp: f32,

    pub soc_percent: f32,

    pub state: &'static str,
    pub fault: &'static str,
}

/// Single-slot, latest-value-wins handoff to the display task.
pub type SummaryMailbox = Signal<CriticalSectionRawMutex, DisplaySummary>;

pub fn build_summary(pack: &Pack, fault: Option<&'static str>) -> DisplaySummary {
    let state = match (pack.hw_state, pack.charger_request, pack.balancing_requested) {
        (BmsHwState::SensorFailure, _, _) => "SENSOR FAULT",
        (_, ChargerRequest::Enable, _) => "CHARGE",
        (_, _, true) => "BALANCE",
        _ => "RUN",
    };

    DisplaySummary {
        max_brick_v: pack.max_brick_v,
        min_brick_v: pack.min_brick_v,
        avg_brick_v: pack.avg_brick_v,
        max_brick_temp: pack.max_brick_temp,
        min_brick_temp: pack.min_brick_temp,
        avg_brick_temp: pack.avg_brick_temp,
        max_board_temp: pack.max_board_temp,
        min_board_temp: pack.min_board_temp,
        avg_board_temp: pack.avg_board_temp,
        soc_percent: pack.soc_percent,
        state,
        fault: fault.unwrap_or(""),
    }
}

/// The panel refresh sequence, owned by the board integration.
pub trait DisplaySink {
    type Error;

    async fn present(&mut self, summary: &DisplaySummary) -> Result<(), Self::Error>;
}

/// Consumes summaries as they arrive and pushes them at the panel. Refreshes
/// are slow; anything posted while one is in flight is simply superseded.
pub async fn display_task<D: DisplaySink>(mailbox: &'static SummaryMailbox, mut sink: D) -> ! {
    loop {
        let summary = mailbox.wait().await;
        if sink.present(&summary).await.is_err() {
            log::warn!("display refresh failed");
        }
    }
}

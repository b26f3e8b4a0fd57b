//! Idle-context heartbeat

use embassy_time::{Duration, Ticker};
use embedded_hal::digital::OutputPin;

pub const HEARTBEAT_PERIOD_MS: u64 = 500;

/// Toggles the heartbeat pin forever. Runs at idle priority, so a visible
/// heartbeat means the scheduler still gets around to everything.
pub async fn heartbeat_task<P: OutputPin>(mut pin: P) -> ! {
    let mut ticker = Ticker::every(Duration::from_millis(HEARTBEAT_PERIOD_MS));
    let mut high = false;

    loop {
        ticker.next().await;
        high = !high;
        if high {
            pin.set_high().unwrap();
        } else {
            pin.set_low().unwrap();
        }
    }
}

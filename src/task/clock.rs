use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, RawMutex};
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Ticker};
use embedded_hal_async::i2c::I2c;
use log::{debug, error, info, warn};

use crate::cfg::board_cfg::CLOCK_TICK_MS;
use crate::drivers::ds1307::{DateTime, Ds1307};
use crate::drivers::SensorError;
use crate::sync::display_guard::{DisplayError, FrameWire, GuardedDisplay};

/// Time-set requests from the HTTP server; the latest one wins.
pub type TimeRequests = Signal<CriticalSectionRawMutex, DateTime>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Shown(DateTime),
    /// The display was busy; try again next tick.
    Skipped(DateTime),
}

/// One clock cycle: apply a pending time-set, read the RTC, refresh the
/// display. Only RTC failures are errors.
pub async fn tick<M, I, W>(
    rtc: &mut Ds1307<I>,
    display: &GuardedDisplay<M, W>,
    requests: &TimeRequests,
) -> Result<Tick, SensorError>
where
    M: RawMutex,
    I: I2c,
    W: FrameWire,
{
    if let Some(request) = requests.try_take() {
        info!("[CLOCK] Applying time update");
        if let Err(e) = rtc.set_time(&request).await {
            warn!("[CLOCK] Rejected time update: {e}");
        }
    }

    let now = rtc.get_time().await?;
    match display
        .update_time(now.hours, now.minutes, now.seconds % 2 == 0)
        .await
    {
        Ok(()) => Ok(Tick::Shown(now)),
        Err(DisplayError::LockTimeout) => Ok(Tick::Skipped(now)),
        Err(e) => {
            warn!("[CLOCK] Display update failed: {e}");
            Ok(Tick::Skipped(now))
        }
    }
}

/// Clock task body. Returns only when the RTC stops answering.
pub async fn run<M, I, W>(
    rtc: &mut Ds1307<I>,
    display: &GuardedDisplay<M, W>,
    requests: &TimeRequests,
) -> SensorError
where
    M: RawMutex,
    I: I2c,
    W: FrameWire,
{
    let mut ticker = Ticker::every(Duration::from_millis(CLOCK_TICK_MS));
    loop {
        match tick(rtc, display, requests).await {
            Ok(Tick::Shown(now)) => debug!("[CLOCK] {:02}:{:02}", now.hours, now.minutes),
            Ok(Tick::Skipped(_)) => debug!("[CLOCK] Tick skipped"),
            Err(e) => {
                error!("[CLOCK] RTC read failed: {e}");
                return e;
            }
        }
        ticker.next().await;
    }
}

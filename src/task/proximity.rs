//! Proximity interrupt hand-off.
//!
//! The GPIO edge handler only calls [`ProximityIrq::notify_from_isr`]. All
//! sensor register traffic happens in the proximity task, which may block
//! on the shared I2C bus.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::semaphore::{GreedySemaphore, Semaphore};
use embassy_time::{with_timeout, Duration};
use embedded_hal::digital::OutputPin;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::i2c::I2c;
use log::{debug, error, info};

use crate::cfg::board_cfg::PROXIMITY_WAIT_MS;
use crate::drivers::vcnl4010::{Vcnl4010, INT_PROXIMITY_MASK};
use crate::drivers::SensorError;
use crate::util::fault::blink_once;

/// Counting wake-up between the edge interrupt and the proximity task.
pub struct ProximityIrq<M: RawMutex> {
    pending: GreedySemaphore<M>,
}

impl<M: RawMutex> ProximityIrq<M> {
    pub const fn new() -> Self {
        Self {
            pending: GreedySemaphore::new(0),
        }
    }

    /// Safe from interrupt context: no I/O, never blocks.
    pub fn notify_from_isr(&self) {
        self.pending.release(1);
    }

    /// Wait for at least one edge and take every pending one. Returns the
    /// number taken, or `None` if `timeout` passed first.
    pub async fn wait(&self, timeout: Duration) -> Option<usize> {
        match with_timeout(timeout, self.pending.acquire_all(1)).await {
            Ok(Ok(permits)) => {
                let taken = permits.permits();
                permits.disarm();
                Some(taken)
            }
            Ok(Err(never)) => match never {},
            Err(_) => None,
        }
    }
}

impl<M: RawMutex> Default for ProximityIrq<M> {
    fn default() -> Self {
        Self::new()
    }
}

/// Check and acknowledge the sensor's proximity interrupt. Returns the
/// bits that were cleared, 0 if nothing was pending.
pub async fn service_interrupt<I, P, D>(
    sensor: &mut Vcnl4010<I>,
    led: &mut P,
    delay: &mut D,
) -> Result<u8, SensorError>
where
    I: I2c,
    P: OutputPin,
    D: DelayNs,
{
    let status = sensor.interrupt_status().await?;
    debug!("[PROX] Interrupt status {status:#04x}");
    let triggered = status & INT_PROXIMITY_MASK;
    if triggered == 0 {
        return Ok(0);
    }
    info!("[PROX] Proximity interrupt");
    blink_once(led, delay).await;
    sensor.clear_interrupts(triggered).await?;
    Ok(triggered)
}

/// Proximity task body. Wakes on every edge, and also periodically so a
/// missed edge cannot leave the sensor's interrupt latched.
pub async fn run<M, I, P, D>(
    irq: &ProximityIrq<M>,
    sensor: &mut Vcnl4010<I>,
    led: &mut P,
    delay: &mut D,
) -> !
where
    M: RawMutex,
    I: I2c,
    P: OutputPin,
    D: DelayNs,
{
    info!("[PROX] Task started");
    loop {
        if let Some(edges) = irq.wait(Duration::from_millis(PROXIMITY_WAIT_MS)).await {
            debug!("[PROX] {edges} edge(s)");
        }
        if let Err(e) = service_interrupt(sensor, led, delay).await {
            error!("[PROX] Failed to service interrupt: {e}");
        }
    }
}

//! Fault indication on the status LED.

use embedded_hal::digital::OutputPin;
use embedded_hal_async::delay::DelayNs;
use log::error;

use crate::cfg::board_cfg::LED_BLINK_MS;

const PAUSE_MS: u32 = 1500;

/// Subsystem that failed; the value is the number of blinks per round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FaultSource {
    I2c = 1,
    Vcnl4010 = 2,
    Ds1307 = 3,
    Tm1637 = 4,
    Wifi = 5,
    HttpServer = 6,
    Littlefs = 7,
}

impl FaultSource {
    pub fn blinks(self) -> u8 {
        self as u8
    }
}

/// One round of the blink code: `count` x (off, on), then a long pause.
pub async fn blink_code<P, D>(led: &mut P, delay: &mut D, source: FaultSource)
where
    P: OutputPin,
    D: DelayNs,
{
    for _ in 0..source.blinks() {
        led.set_low().ok();
        delay.delay_ms(LED_BLINK_MS).await;
        led.set_high().ok();
        delay.delay_ms(LED_BLINK_MS).await;
    }
    delay.delay_ms(PAUSE_MS).await;
}

/// Repeat the blink code for `source` forever.
pub async fn signal_forever<P, D>(led: &mut P, delay: &mut D, source: FaultSource) -> !
where
    P: OutputPin,
    D: DelayNs,
{
    error!("[FAULT] Unrecoverable {source:?} fault");
    loop {
        blink_code(led, delay, source).await;
    }
}

/// Single acknowledgement blink.
pub async fn blink_once<P, D>(led: &mut P, delay: &mut D)
where
    P: OutputPin,
    D: DelayNs,
{
    led.set_high().ok();
    delay.delay_ms(LED_BLINK_MS).await;
    led.set_low().ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal_mock::eh1::delay::NoopDelay;
    use embedded_hal_mock::eh1::digital::{Mock as PinMock, State, Transaction as PinTransaction};

    #[tokio::test]
    async fn blink_count_matches_the_source() {
        let mut expectations = Vec::new();
        for _ in 0..3 {
            expectations.push(PinTransaction::set(State::Low));
            expectations.push(PinTransaction::set(State::High));
        }
        let mut led = PinMock::new(&expectations);
        let mut handle = led.clone();
        blink_code(&mut handle, &mut NoopDelay::new(), FaultSource::Ds1307).await;
        led.done();
    }

    #[test]
    fn codes_are_stable() {
        assert_eq!(FaultSource::I2c.blinks(), 1);
        assert_eq!(FaultSource::Wifi.blinks(), 5);
        assert_eq!(FaultSource::Littlefs.blinks(), 7);
    }
}

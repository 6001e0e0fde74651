//! TM1637 4-digit LED driver, bit-banged over CLK/DIO.
//!
//! Bytes go out LSB first on rising CLK edges, followed by one ACK clock
//! during which the chip pulls DIO low. DIO should be an open-drain output.

use embedded_hal::digital::OutputPin;
use embedded_hal_async::delay::DelayNs;

use crate::sync::display_guard::{DisplayError, FrameWire};

/// Segment patterns for 0-9 (bit 0 = segment a).
pub const DIGITS: [u8; 10] = [0x3F, 0x06, 0x5B, 0x4F, 0x66, 0x6D, 0x7D, 0x07, 0x7F, 0x6F];
/// Colon, wired to the decimal point of the second digit.
pub const COLON: u8 = 0x80;
pub const BLANK: u8 = 0x00;

const BIT_DELAY_US: u32 = 3;
const ACK_DELAY_US: u32 = 5;

pub fn encode_digit(value: u8) -> u8 {
    DIGITS.get(value as usize).copied().unwrap_or(BLANK)
}

pub struct Tm1637<CLK, DIO, D> {
    clk: CLK,
    dio: DIO,
    delay: D,
}

impl<CLK, DIO, D> Tm1637<CLK, DIO, D>
where
    CLK: OutputPin,
    DIO: OutputPin,
    D: DelayNs,
{
    pub fn new(clk: CLK, dio: DIO, delay: D) -> Self {
        Self { clk, dio, delay }
    }

    pub fn release(self) -> (CLK, DIO, D) {
        (self.clk, self.dio, self.delay)
    }

    fn clk(&mut self, high: bool) -> Result<(), DisplayError> {
        self.clk
            .set_state(high.into())
            .map_err(|_| DisplayError::Pin)
    }

    fn dio(&mut self, high: bool) -> Result<(), DisplayError> {
        self.dio
            .set_state(high.into())
            .map_err(|_| DisplayError::Pin)
    }
}

impl<CLK, DIO, D> FrameWire for Tm1637<CLK, DIO, D>
where
    CLK: OutputPin,
    DIO: OutputPin,
    D: DelayNs,
{
    async fn start(&mut self) -> Result<(), DisplayError> {
        self.clk(true)?;
        self.dio(true)?;
        self.delay.delay_us(BIT_DELAY_US).await;
        self.dio(false)?;
        self.delay.delay_us(BIT_DELAY_US).await;
        Ok(())
    }

    async fn write_byte(&mut self, byte: u8) -> Result<(), DisplayError> {
        let mut data = byte;
        for _ in 0..8 {
            self.clk(false)?;
            self.dio(data & 0x01 != 0)?;
            data >>= 1;
            self.delay.delay_us(BIT_DELAY_US).await;
            self.clk(true)?;
            self.delay.delay_us(BIT_DELAY_US).await;
        }

        // ACK clock; DIO released for the chip to pull low
        self.clk(false)?;
        self.dio(true)?;
        self.delay.delay_us(ACK_DELAY_US).await;
        self.clk(true)?;
        self.delay.delay_us(ACK_DELAY_US).await;
        self.clk(false)?;
        self.delay.delay_us(ACK_DELAY_US).await;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), DisplayError> {
        self.dio(false)?;
        self.delay.delay_us(BIT_DELAY_US).await;
        self.clk(true)?;
        self.delay.delay_us(BIT_DELAY_US).await;
        self.dio(true)?;
        self.delay.delay_us(BIT_DELAY_US).await;
        Ok(())
    }
}

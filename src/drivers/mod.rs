pub mod ds1307;
pub mod tm1637;
pub mod vcnl4010;

use embedded_hal::i2c::ErrorKind;

/// Failure talking to an I2C peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SensorError {
    #[error("I2C error: {0:?}")]
    I2c(ErrorKind),
    #[error("value out of range")]
    OutOfRange,
    #[error("unexpected product id {0:#04x}")]
    UnknownDevice(u8),
}

impl SensorError {
    pub(crate) fn bus<E: embedded_hal::i2c::Error>(e: E) -> Self {
        SensorError::I2c(e.kind())
    }
}

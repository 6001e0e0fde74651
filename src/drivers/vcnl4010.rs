//! VCNL4010 proximity and ambient light sensor.
//!
//! Registers are plain bytes with mask constants; the interrupt status
//! register is write-one-to-clear.

use embedded_hal_async::i2c::I2c;
use log::{debug, info};

use super::SensorError;

pub const VCNL4010_ADDR: u8 = 0x13;

pub const REG_COMMAND: u8 = 0x80;
pub const REG_PRODUCT_ID: u8 = 0x81;
pub const REG_PROX_RATE: u8 = 0x82;
pub const REG_IR_LED: u8 = 0x83;
pub const REG_AMBIENT_PARAMETER: u8 = 0x84;
pub const REG_AMBIENT_RESULT_HI: u8 = 0x85;
pub const REG_AMBIENT_RESULT_LO: u8 = 0x86;
pub const REG_PROXIMITY_RESULT_HI: u8 = 0x87;
pub const REG_PROXIMITY_RESULT_LO: u8 = 0x88;
pub const REG_INT_CONTROL: u8 = 0x89;
pub const REG_LOW_THRESHOLD_HI: u8 = 0x8A;
pub const REG_LOW_THRESHOLD_LO: u8 = 0x8B;
pub const REG_HIGH_THRESHOLD_HI: u8 = 0x8C;
pub const REG_HIGH_THRESHOLD_LO: u8 = 0x8D;
pub const REG_INTERRUPT_STATUS: u8 = 0x8E;
pub const REG_MOD_TIMING: u8 = 0x8F;

// Command register
pub const CMD_SELFTIMED_EN: u8 = 0x01;
pub const CMD_PROX_EN: u8 = 0x02;
pub const CMD_ALS_EN: u8 = 0x04;
pub const CMD_PROX_OD: u8 = 0x08;
pub const CMD_ALS_OD: u8 = 0x10;
pub const CMD_PROX_DATA_RDY: u8 = 0x20;
pub const CMD_ALS_DATA_RDY: u8 = 0x40;
pub const CMD_CONFIG_LOCK: u8 = 0x80;

// Interrupt control register
pub const INT_THRES_SEL_ALS: u8 = 0x01;
pub const INT_THRES_EN: u8 = 0x02;
pub const INT_ALS_READY_EN: u8 = 0x04;
pub const INT_PROX_READY_EN: u8 = 0x08;
/// Threshold must be exceeded on 4 consecutive measurements.
pub const INT_COUNT_EXCEED_4: u8 = 0b010 << 5;

// Interrupt status register
pub const INT_TH_HI: u8 = 0x01;
pub const INT_TH_LOW: u8 = 0x02;
pub const INT_ALS_READY: u8 = 0x04;
pub const INT_PROX_READY: u8 = 0x08;
/// Bits raised by a proximity threshold crossing.
pub const INT_PROXIMITY_MASK: u8 = INT_TH_HI | INT_TH_LOW;

/// Product id nibble in the upper half of `REG_PRODUCT_ID`.
pub const PRODUCT_ID: u8 = 0x2;

/// IR LED current in 10 mA steps.
const IR_LED_100MA: u8 = 0x0A;
/// 7.8125 proximity measurements/s.
const PROX_RATE_7_8: u8 = 0x02;
/// 2 samples/s, auto offset compensation, 32 conversions averaged.
const AMBIENT_PARAMS: u8 = 0x1D;
pub const DEFAULT_HIGH_THRESHOLD: u16 = 0x16E4;

pub struct Vcnl4010<I2C> {
    i2c: I2C,
}

impl<I2C: I2c> Vcnl4010<I2C> {
    pub fn new(i2c: I2C) -> Self {
        Self { i2c }
    }

    pub fn release(self) -> I2C {
        self.i2c
    }

    async fn write_reg(&mut self, reg: u8, value: u8) -> Result<(), SensorError> {
        self.i2c
            .write(VCNL4010_ADDR, &[reg, value])
            .await
            .map_err(SensorError::bus)
    }

    async fn read_reg(&mut self, reg: u8) -> Result<u8, SensorError> {
        let mut value = [0u8; 1];
        self.i2c
            .write_read(VCNL4010_ADDR, &[reg], &mut value)
            .await
            .map_err(SensorError::bus)?;
        Ok(value[0])
    }

    async fn read_u16(&mut self, hi: u8, lo: u8) -> Result<u16, SensorError> {
        let high = self.read_reg(hi).await?;
        let low = self.read_reg(lo).await?;
        Ok(u16::from_be_bytes([high, low]))
    }

    /// Configure self-timed proximity and ambient measurements with a
    /// threshold interrupt on proximity.
    pub async fn init(&mut self) -> Result<(), SensorError> {
        info!("[VCNL4010] Initializing");
        self.write_reg(REG_IR_LED, IR_LED_100MA).await?;
        self.write_reg(REG_PROX_RATE, PROX_RATE_7_8).await?;
        self.write_reg(REG_AMBIENT_PARAMETER, AMBIENT_PARAMS).await?;
        self.write_reg(REG_INT_CONTROL, INT_COUNT_EXCEED_4 | INT_THRES_EN)
            .await?;
        self.set_thresholds(0, DEFAULT_HIGH_THRESHOLD).await?;
        self.write_reg(REG_COMMAND, CMD_SELFTIMED_EN | CMD_PROX_EN | CMD_ALS_EN)
            .await
    }

    pub async fn product_id(&mut self) -> Result<u8, SensorError> {
        let id = self.read_reg(REG_PRODUCT_ID).await?;
        if id >> 4 != PRODUCT_ID {
            return Err(SensorError::UnknownDevice(id));
        }
        Ok(id)
    }

    pub async fn set_thresholds(&mut self, low: u16, high: u16) -> Result<(), SensorError> {
        let [low_hi, low_lo] = low.to_be_bytes();
        let [high_hi, high_lo] = high.to_be_bytes();
        self.write_reg(REG_LOW_THRESHOLD_HI, low_hi).await?;
        self.write_reg(REG_LOW_THRESHOLD_LO, low_lo).await?;
        self.write_reg(REG_HIGH_THRESHOLD_HI, high_hi).await?;
        self.write_reg(REG_HIGH_THRESHOLD_LO, high_lo).await
    }

    pub async fn read_proximity(&mut self) -> Result<u16, SensorError> {
        let value = self
            .read_u16(REG_PROXIMITY_RESULT_HI, REG_PROXIMITY_RESULT_LO)
            .await?;
        debug!("[VCNL4010] Proximity {value}");
        Ok(value)
    }

    pub async fn read_ambient(&mut self) -> Result<u16, SensorError> {
        let value = self
            .read_u16(REG_AMBIENT_RESULT_HI, REG_AMBIENT_RESULT_LO)
            .await?;
        debug!("[VCNL4010] Ambient {value}");
        Ok(value)
    }

    pub async fn interrupt_status(&mut self) -> Result<u8, SensorError> {
        self.read_reg(REG_INTERRUPT_STATUS).await
    }

    /// Clear the interrupt bits in `mask`. Writes the mask itself; a
    /// read-modify-write would clear flags raised in between.
    pub async fn clear_interrupts(&mut self, mask: u8) -> Result<(), SensorError> {
        self.write_reg(REG_INTERRUPT_STATUS, mask).await
    }
}

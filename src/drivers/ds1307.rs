//! DS1307 real-time clock.
//!
//! Time lives in seven BCD registers starting at 0x00. The chip may be left
//! in 12-hour mode by other firmware; readings are always returned in
//! 24-hour form and writes always select 24-hour mode.

use embedded_hal_async::i2c::I2c;
use log::{debug, info};

use super::SensorError;

pub const DS1307_ADDR: u8 = 0x68;

pub const REG_SECONDS: u8 = 0x00;
pub const REG_MINUTES: u8 = 0x01;
pub const REG_HOURS: u8 = 0x02;
pub const REG_DAY: u8 = 0x03;
pub const REG_DATE: u8 = 0x04;
pub const REG_MONTH: u8 = 0x05;
pub const REG_YEAR: u8 = 0x06;
/// Square-wave output control.
pub const REG_CONTROL: u8 = 0x07;

/// Oscillator stopped while set (seconds register).
pub const CLOCK_HALT: u8 = 0x80;
/// 12-hour mode select (hours register).
pub const HOURS_12H: u8 = 0x40;
/// PM flag in 12-hour mode (hours register).
pub const HOURS_PM: u8 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    /// 1 = Sunday .. 7 = Saturday
    pub weekday: u8,
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
}

fn bcd_to_bin(bcd: u8) -> u8 {
    (bcd >> 4) * 10 + (bcd & 0x0F)
}

fn bin_to_bcd(bin: u8) -> u8 {
    ((bin / 10) << 4) | (bin % 10)
}

fn digits(s: &str) -> Option<u16> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

impl DateTime {
    /// Day of week for a Gregorian date, 1 = Sunday.
    pub fn weekday_of(year: u16, month: u8, day: u8) -> u8 {
        const OFFSETS: [u16; 12] = [0, 3, 2, 5, 0, 3, 5, 1, 4, 6, 2, 4];
        let y = if month < 3 { year - 1 } else { year };
        let dow = (y + y / 4 - y / 100 + y / 400 + OFFSETS[(month - 1) as usize] + day as u16) % 7;
        dow as u8 + 1
    }

    /// Parse `YYYY-MM-DDTHH:MM[:SS][.fff][Z]`, as sent by a browser's
    /// `Date.toISOString()`.
    pub fn parse_iso8601(s: &str) -> Option<Self> {
        let s = s.trim().trim_end_matches('Z');
        let s = s.split('.').next()?;
        let (date, time) = s.split_once('T').or_else(|| s.split_once(' '))?;

        let mut date = date.split('-');
        let year = digits(date.next()?)?;
        let month = digits(date.next()?)? as u8;
        let day = digits(date.next()?)? as u8;

        let mut time = time.split(':');
        let hours = digits(time.next()?)? as u8;
        let minutes = digits(time.next()?)? as u8;
        let seconds = match time.next() {
            Some(sec) => digits(sec)? as u8,
            None => 0,
        };

        let dt = DateTime {
            year,
            month,
            day,
            weekday: 1,
            hours,
            minutes,
            seconds,
        };
        dt.validate().ok()?;
        Some(DateTime {
            weekday: Self::weekday_of(year, month, day),
            ..dt
        })
    }

    fn validate(&self) -> Result<(), SensorError> {
        let ok = (2000..=2099).contains(&self.year)
            && (1..=12).contains(&self.month)
            && (1..=31).contains(&self.day)
            && (1..=7).contains(&self.weekday)
            && self.hours < 24
            && self.minutes < 60
            && self.seconds < 60;
        if ok {
            Ok(())
        } else {
            Err(SensorError::OutOfRange)
        }
    }
}

pub struct Ds1307<I2C> {
    i2c: I2C,
}

impl<I2C: I2c> Ds1307<I2C> {
    pub fn new(i2c: I2C) -> Self {
        Self { i2c }
    }

    pub fn release(self) -> I2C {
        self.i2c
    }

    /// Start the oscillator if a previous power loss left it halted.
    pub async fn init(&mut self) -> Result<(), SensorError> {
        info!("[DS1307] Initializing");
        let mut seconds = [0u8; 1];
        self.i2c
            .write_read(DS1307_ADDR, &[REG_SECONDS], &mut seconds)
            .await
            .map_err(SensorError::bus)?;
        if seconds[0] & CLOCK_HALT != 0 {
            info!("[DS1307] Oscillator halted, starting it");
            self.i2c
                .write(DS1307_ADDR, &[REG_SECONDS, seconds[0] & !CLOCK_HALT])
                .await
                .map_err(SensorError::bus)?;
        }
        Ok(())
    }

    pub async fn get_time(&mut self) -> Result<DateTime, SensorError> {
        let mut regs = [0u8; 7];
        self.i2c
            .write_read(DS1307_ADDR, &[REG_SECONDS], &mut regs)
            .await
            .map_err(SensorError::bus)?;

        let raw_hours = regs[REG_HOURS as usize];
        let hours = if raw_hours & HOURS_12H != 0 {
            let h12 = bcd_to_bin(raw_hours & 0x1F) % 12;
            if raw_hours & HOURS_PM != 0 {
                h12 + 12
            } else {
                h12
            }
        } else {
            bcd_to_bin(raw_hours & 0x3F)
        };

        let time = DateTime {
            year: 2000 + bcd_to_bin(regs[REG_YEAR as usize]) as u16,
            month: bcd_to_bin(regs[REG_MONTH as usize] & 0x1F),
            day: bcd_to_bin(regs[REG_DATE as usize] & 0x3F),
            weekday: regs[REG_DAY as usize] & 0x07,
            hours,
            minutes: bcd_to_bin(regs[REG_MINUTES as usize] & 0x7F),
            seconds: bcd_to_bin(regs[REG_SECONDS as usize] & 0x7F),
        };
        debug!("[DS1307] Read {time:?}");
        Ok(time)
    }

    /// Write `time` in 24-hour mode; also clears the halt bit.
    pub async fn set_time(&mut self, time: &DateTime) -> Result<(), SensorError> {
        time.validate()?;
        let frame = [
            REG_SECONDS,
            bin_to_bcd(time.seconds),
            bin_to_bcd(time.minutes),
            bin_to_bcd(time.hours),
            time.weekday,
            bin_to_bcd(time.day),
            bin_to_bcd(time.month),
            bin_to_bcd((time.year - 2000) as u8),
        ];
        self.i2c
            .write(DS1307_ADDR, &frame)
            .await
            .map_err(SensorError::bus)?;
        info!(
            "[DS1307] Time set to {:04}-{:02}-{:02} {:02}:{:02}:{:02}",
            time.year, time.month, time.day, time.hours, time.minutes, time.seconds
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::ErrorKind;
    use embedded_hal_mock::eh1::i2c::{Mock as I2cMock, Transaction};

    #[tokio::test]
    async fn reads_bcd_time_in_24_hour_mode() {
        let expectations = [Transaction::write_read(
            DS1307_ADDR,
            vec![REG_SECONDS],
            vec![0x59, 0x34, 0x23, 0x03, 0x15, 0x04, 0x25],
        )];
        let mut i2c = I2cMock::new(&expectations);
        let mut rtc = Ds1307::new(i2c.clone());

        let time = rtc.get_time().await.unwrap();
        assert_eq!(
            time,
            DateTime {
                year: 2025,
                month: 4,
                day: 15,
                weekday: 3,
                hours: 23,
                minutes: 34,
                seconds: 59,
            }
        );
        i2c.done();
    }

    #[tokio::test]
    async fn twelve_hour_registers_convert_to_24_hours() {
        // 12:05 AM, 12:05 PM and 07:05 PM
        let expectations = [
            Transaction::write_read(DS1307_ADDR, vec![0], vec![0, 0x05, 0x52, 1, 1, 1, 0]),
            Transaction::write_read(DS1307_ADDR, vec![0], vec![0, 0x05, 0x72, 1, 1, 1, 0]),
            Transaction::write_read(DS1307_ADDR, vec![0], vec![0, 0x05, 0x67, 1, 1, 1, 0]),
        ];
        let mut i2c = I2cMock::new(&expectations);
        let mut rtc = Ds1307::new(i2c.clone());

        assert_eq!(rtc.get_time().await.unwrap().hours, 0);
        assert_eq!(rtc.get_time().await.unwrap().hours, 12);
        assert_eq!(rtc.get_time().await.unwrap().hours, 19);
        i2c.done();
    }

    #[tokio::test]
    async fn set_time_writes_one_bcd_block() {
        let time = DateTime::parse_iso8601("2024-02-29T08:07:06.000Z").unwrap();
        let expectations = [Transaction::write(
            DS1307_ADDR,
            vec![REG_SECONDS, 0x06, 0x07, 0x08, 0x05, 0x29, 0x02, 0x24],
        )];
        let mut i2c = I2cMock::new(&expectations);
        let mut rtc = Ds1307::new(i2c.clone());

        rtc.set_time(&time).await.unwrap();
        i2c.done();
    }

    #[tokio::test]
    async fn halted_oscillator_is_restarted() {
        let expectations = [
            Transaction::write_read(DS1307_ADDR, vec![REG_SECONDS], vec![0x80 | 0x42]),
            Transaction::write(DS1307_ADDR, vec![REG_SECONDS, 0x42]),
        ];
        let mut i2c = I2cMock::new(&expectations);
        let mut rtc = Ds1307::new(i2c.clone());
        rtc.init().await.unwrap();
        i2c.done();
    }

    #[tokio::test]
    async fn bus_errors_are_reported() {
        let expectations = [Transaction::write_read(DS1307_ADDR, vec![0], vec![0; 7])
            .with_error(ErrorKind::Other)];
        let mut i2c = I2cMock::new(&expectations);
        let mut rtc = Ds1307::new(i2c.clone());
        assert_eq!(
            rtc.get_time().await,
            Err(SensorError::I2c(ErrorKind::Other))
        );
        i2c.done();
    }

    #[test]
    fn iso_strings_parse_with_weekday() {
        let t = DateTime::parse_iso8601("2025-01-01T00:00:00Z").unwrap();
        assert_eq!((t.year, t.month, t.day, t.weekday), (2025, 1, 1, 4));
        let t = DateTime::parse_iso8601("2030-12-31T23:59").unwrap();
        assert_eq!((t.hours, t.minutes, t.seconds), (23, 59, 0));

        assert_eq!(DateTime::parse_iso8601("2025-13-01T00:00:00"), None);
        assert_eq!(DateTime::parse_iso8601("yesterday"), None);
        assert_eq!(DateTime::parse_iso8601("1999-01-01T00:00:00"), None);
    }
}

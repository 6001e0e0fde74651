use embedded_hal::delay::DelayNs;
use embedded_hal::spi::SpiDevice;
use littlefs2::consts;
use littlefs2::driver::Storage;
use littlefs2::io::{Error as LfsError, Result as LfsResult};
use log::error;

use super::ex_flash::{W25Q128, SECTOR_SIZE};
use super::fs::FsError;
use crate::cfg::fs_cfg::{BLOCK_COUNT, BLOCK_CYCLES, BLOCK_SIZE, PROG_SIZE, READ_SIZE};

// `erase` clears exactly one filesystem block
const _: () = assert!(BLOCK_SIZE == SECTOR_SIZE as usize);

const VOLUME_BYTES: usize = BLOCK_SIZE * BLOCK_COUNT;

/// W25Q128 as littlefs storage: one filesystem block per 4 KiB sector.
///
/// littlefs hands out byte offsets of the form `block * BLOCK_SIZE + off`,
/// which map one to one onto flash addresses.
pub struct FlashBlockDevice<SPI, D> {
    flash: W25Q128<SPI, D>,
}

impl<SPI, D> FlashBlockDevice<SPI, D>
where
    SPI: SpiDevice,
    D: DelayNs,
{
    pub fn new(flash: W25Q128<SPI, D>) -> Result<Self, FsError> {
        if (flash.capacity() as usize) < VOLUME_BYTES {
            error!(
                "[FS] {BLOCK_COUNT} blocks of {BLOCK_SIZE} bytes exceed flash capacity {}",
                flash.capacity()
            );
            return Err(FsError::Invalid);
        }
        Ok(Self { flash })
    }

    pub fn release(self) -> W25Q128<SPI, D> {
        self.flash
    }

    fn check_range(op: &str, off: usize, len: usize) -> LfsResult<u32> {
        match off.checked_add(len) {
            Some(end) if end <= VOLUME_BYTES => Ok(off as u32),
            _ => {
                error!("[FS] {op} outside the volume: offset {off}, len {len}");
                Err(LfsError::INVALID)
            }
        }
    }
}

impl<SPI, D> Storage for FlashBlockDevice<SPI, D>
where
    SPI: SpiDevice,
    D: DelayNs,
{
    const READ_SIZE: usize = READ_SIZE;
    const WRITE_SIZE: usize = PROG_SIZE;
    const BLOCK_SIZE: usize = BLOCK_SIZE;
    const BLOCK_COUNT: usize = BLOCK_COUNT;
    const BLOCK_CYCLES: isize = BLOCK_CYCLES;

    type CACHE_SIZE = consts::U16;
    // In 64-bit words: 16 bytes, 128 blocks per lookahead window
    type LOOKAHEAD_SIZE = consts::U2;

    fn read(&mut self, off: usize, buf: &mut [u8]) -> LfsResult<usize> {
        let addr = Self::check_range("Read", off, buf.len())?;
        if buf.is_empty() {
            return Ok(0);
        }
        self.flash.read_data(addr, buf).map_err(|e| {
            error!("[FS] Read error at offset {off}: {e:?}");
            LfsError::IO
        })?;
        Ok(buf.len())
    }

    fn write(&mut self, off: usize, data: &[u8]) -> LfsResult<usize> {
        let addr = Self::check_range("Write", off, data.len())?;
        if data.is_empty() {
            return Ok(0);
        }
        self.flash.write_data(addr, data).map_err(|e| {
            error!("[FS] Write error at offset {off}: {e:?}");
            LfsError::IO
        })?;
        Ok(data.len())
    }

    fn erase(&mut self, off: usize, len: usize) -> LfsResult<usize> {
        Self::check_range("Erase", off, len)?;
        if off % BLOCK_SIZE != 0 || len % BLOCK_SIZE != 0 {
            error!("[FS] Erase of {len} bytes at {off} is not block aligned");
            return Err(LfsError::INVALID);
        }
        for sector in (off..off + len).step_by(BLOCK_SIZE) {
            self.flash.erase_sector(sector as u32).map_err(|e| {
                error!("[FS] Erase error at offset {sector}: {e:?}");
                LfsError::IO
            })?;
        }
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::ex_flash::FLASH_CAPACITY;
    use crate::mem::sim::SimFlash;
    use embedded_hal_mock::eh1::delay::NoopDelay;

    fn device(sim: &SimFlash) -> FlashBlockDevice<SimFlash, NoopDelay> {
        FlashBlockDevice::new(W25Q128::new(sim.clone(), NoopDelay::new())).unwrap()
    }

    fn block(n: usize) -> usize {
        n * BLOCK_SIZE
    }

    #[test]
    fn erase_leaves_the_whole_block_erased() {
        let sim = SimFlash::new(FLASH_CAPACITY);
        let mut dev = device(&sim);
        dev.write(block(3), &[0u8; 64]).unwrap();
        assert_eq!(dev.erase(block(3), BLOCK_SIZE).unwrap(), BLOCK_SIZE);

        let mut buf = vec![0u8; BLOCK_SIZE];
        dev.read(block(3), &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn block_and_offset_map_to_byte_addresses() {
        let sim = SimFlash::new(FLASH_CAPACITY);
        let mut dev = device(&sim);
        dev.erase(block(5), BLOCK_SIZE).unwrap();
        assert_eq!(dev.write(block(5) + 300, b"mapped").unwrap(), 6);
        assert_eq!(sim.peek(5 * 4096 + 300, 6), b"mapped".to_vec());
    }

    #[test]
    fn repeated_erase_then_two_programs_read_back_independently() {
        let sim = SimFlash::new(FLASH_CAPACITY);
        sim.set_busy_polls(5);
        let mut dev = device(&sim);
        let first: Vec<u8> = (0..100).map(|i| i as u8).collect();
        let second: Vec<u8> = (0..100).map(|i| 0xA0 ^ i as u8).collect();

        dev.erase(block(7), BLOCK_SIZE).unwrap();
        dev.erase(block(7), BLOCK_SIZE).unwrap();
        dev.write(block(7) + 10, &first).unwrap();
        dev.write(block(7) + 2000, &second).unwrap();

        let mut a = vec![0u8; 100];
        let mut b = vec![0u8; 100];
        dev.read(block(7) + 10, &mut a).unwrap();
        dev.read(block(7) + 2000, &mut b).unwrap();
        assert_eq!(a, first);
        assert_eq!(b, second);
        assert_eq!(sim.erase_count(7), 2);
        assert_eq!(sim.ignored_while_busy(), 0);
    }

    #[test]
    fn multi_block_erase_clears_each_sector_once() {
        let sim = SimFlash::new(FLASH_CAPACITY);
        let mut dev = device(&sim);
        dev.erase(block(10), 3 * BLOCK_SIZE).unwrap();
        assert_eq!(
            (9..14).map(|s| sim.erase_count(s)).collect::<Vec<_>>(),
            vec![0, 1, 1, 1, 0]
        );
    }

    #[test]
    fn transport_failures_surface_as_io() {
        let sim = SimFlash::new(FLASH_CAPACITY);
        let mut dev = device(&sim);
        sim.set_fail_transactions(true);
        assert_eq!(dev.read(0, &mut [0u8; 4]), Err(LfsError::IO));

        sim.set_fail_transactions(false);
        sim.set_ignore_write_enable(true);
        assert_eq!(dev.erase(block(1), BLOCK_SIZE), Err(LfsError::IO));
        assert_eq!(dev.write(block(1), &[1]), Err(LfsError::IO));
    }

    #[test]
    fn out_of_range_or_misaligned_access_is_rejected() {
        let sim = SimFlash::new(FLASH_CAPACITY);
        let mut dev = device(&sim);
        assert_eq!(dev.erase(block(BLOCK_COUNT), BLOCK_SIZE), Err(LfsError::INVALID));
        assert_eq!(dev.read(VOLUME_BYTES - 4, &mut [0u8; 8]), Err(LfsError::INVALID));
        assert_eq!(dev.erase(block(2) + 512, BLOCK_SIZE), Err(LfsError::INVALID));
    }

    #[test]
    fn chip_must_hold_the_whole_volume() {
        let sim = SimFlash::new(1024 * 1024);
        let flash = W25Q128::with_capacity(sim, NoopDelay::new(), 1024 * 1024);
        assert!(matches!(
            FlashBlockDevice::new(flash),
            Err(FsError::Invalid)
        ));
    }
}

//! Host-side W25Q128 model.
//!
//! Implements [`SpiDevice`] on top of an in-memory array with NOR semantics:
//! erase sets bytes to `0xFF`, programming can only clear bits, a page
//! program wraps inside its 256-byte page, and program/erase commands need
//! the write enable latch and leave the chip busy for a few status polls.
//! Clones share the same chip so tests can inspect or damage the image
//! while a driver owns it.

use std::sync::{Arc, Mutex, MutexGuard};

use embedded_hal::spi::{ErrorKind, ErrorType, Operation, SpiDevice};
use log::warn;

use super::ex_flash::{BUSY_BIT, PAGE_SIZE, SECTOR_SIZE, W25Q128_JEDEC_ID, WEL_BIT};

const UNIQUE_ID: [u8; 8] = [0xD2, 0x65, 0x38, 0x14, 0x0F, 0x2A, 0x71, 0x5C];
const DEVICE_ID: [u8; 2] = [0xEF, 0x17];

#[derive(Debug)]
struct Chip {
    memory: Vec<u8>,
    erase_counts: Vec<u32>,
    wel: bool,
    busy_polls: u32,
    busy_remaining: u32,
    powered_down: bool,
    stuck_busy: bool,
    ignore_write_enable: bool,
    fail_transactions: bool,
    ignored_while_busy: u32,
}

impl Chip {
    fn status(&self) -> u8 {
        let mut status = 0;
        if self.busy_remaining > 0 || self.stuck_busy {
            status |= BUSY_BIT;
        }
        if self.wel {
            status |= WEL_BIT;
        }
        status
    }

    fn busy(&self) -> bool {
        self.busy_remaining > 0 || self.stuck_busy
    }

    fn address(header: &[u8]) -> usize {
        ((header[1] as usize) << 16) | ((header[2] as usize) << 8) | header[3] as usize
    }

    fn respond(&mut self, header: &[u8], offset: usize, buf: &mut [u8]) {
        let capacity = self.memory.len();
        match header.first().copied() {
            Some(0x05) => {
                let status = self.status();
                buf.fill(status);
            }
            Some(0x9F) => fill_from(buf, offset, &W25Q128_JEDEC_ID),
            Some(0x4B) if header.len() >= 5 => fill_from(buf, offset, &UNIQUE_ID),
            Some(0x90) if header.len() >= 4 => fill_from(buf, offset, &DEVICE_ID),
            Some(0x03) if header.len() >= 4 => {
                let start = Self::address(header) + offset;
                for (i, byte) in buf.iter_mut().enumerate() {
                    *byte = self.memory[(start + i) % capacity];
                }
            }
            Some(0x0B) if header.len() >= 5 => {
                let start = Self::address(header) + offset;
                for (i, byte) in buf.iter_mut().enumerate() {
                    *byte = self.memory[(start + i) % capacity];
                }
            }
            _ => buf.fill(0xFF),
        }
    }

    /// Side effects latched when chip select rises.
    fn finish(&mut self, written: &[u8]) {
        let Some(&opcode) = written.first() else {
            return;
        };
        if opcode == 0x05 {
            if self.busy_remaining > 0 {
                self.busy_remaining -= 1;
            }
            return;
        }
        if self.powered_down && opcode != 0xAB {
            return;
        }
        if self.busy() {
            self.ignored_while_busy += 1;
            warn!("[SimFlash] Command {opcode:#04X} ignored while busy");
            return;
        }
        match opcode {
            0x06 => self.wel = !self.ignore_write_enable,
            0x04 => self.wel = false,
            0xB9 => self.powered_down = true,
            0xAB => self.powered_down = false,
            0x99 => {
                self.wel = false;
                self.busy_remaining = 0;
            }
            0x02 if written.len() > 4 => {
                if !self.wel {
                    return;
                }
                let base = Self::address(written) % self.memory.len();
                let page = base & !(PAGE_SIZE - 1);
                for (i, byte) in written[4..].iter().enumerate() {
                    let addr = page | ((base + i) & (PAGE_SIZE - 1));
                    self.memory[addr] &= *byte;
                }
                self.complete_write();
            }
            0x20 => self.erase_region(written, SECTOR_SIZE as usize),
            0x52 => self.erase_region(written, 32 * 1024),
            0xD8 => self.erase_region(written, 64 * 1024),
            0xC7 => {
                if !self.wel {
                    return;
                }
                self.memory.fill(0xFF);
                for count in self.erase_counts.iter_mut() {
                    *count += 1;
                }
                self.complete_write();
            }
            _ => {}
        }
    }

    fn erase_region(&mut self, written: &[u8], size: usize) {
        if !self.wel || written.len() < 4 {
            return;
        }
        let start = (Self::address(written) % self.memory.len()) & !(size - 1);
        self.memory[start..start + size].fill(0xFF);
        let first = start / SECTOR_SIZE as usize;
        let sectors = size / SECTOR_SIZE as usize;
        for count in &mut self.erase_counts[first..first + sectors] {
            *count += 1;
        }
        self.complete_write();
    }

    fn complete_write(&mut self) {
        self.wel = false;
        self.busy_remaining = self.busy_polls;
    }
}

fn fill_from(buf: &mut [u8], offset: usize, source: &[u8]) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte = source.get(offset + i).copied().unwrap_or(0);
    }
}

/// Simulated W25Q chip. Clones share state.
#[derive(Debug, Clone)]
pub struct SimFlash {
    chip: Arc<Mutex<Chip>>,
}

impl SimFlash {
    /// A factory-fresh chip: every byte erased.
    pub fn new(capacity: u32) -> Self {
        let capacity = capacity as usize;
        Self {
            chip: Arc::new(Mutex::new(Chip {
                memory: vec![0xFF; capacity],
                erase_counts: vec![0; capacity / SECTOR_SIZE as usize],
                wel: false,
                busy_polls: 2,
                busy_remaining: 0,
                powered_down: false,
                stuck_busy: false,
                ignore_write_enable: false,
                fail_transactions: false,
                ignored_while_busy: 0,
            })),
        }
    }

    fn chip(&self) -> MutexGuard<'_, Chip> {
        match self.chip.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Number of status polls a program or erase stays busy for.
    pub fn set_busy_polls(&self, polls: u32) {
        self.chip().busy_polls = polls;
    }

    /// Keep the busy bit set forever.
    pub fn set_stuck_busy(&self, stuck: bool) {
        self.chip().stuck_busy = stuck;
    }

    /// Make write enable commands fail to latch.
    pub fn set_ignore_write_enable(&self, ignore: bool) {
        self.chip().ignore_write_enable = ignore;
    }

    /// Fail every SPI transaction at the bus level.
    pub fn set_fail_transactions(&self, fail: bool) {
        self.chip().fail_transactions = fail;
    }

    pub fn peek(&self, address: usize, len: usize) -> Vec<u8> {
        self.chip().memory[address..address + len].to_vec()
    }

    /// Overwrite the image directly, bypassing NOR rules.
    pub fn poke(&self, address: usize, bytes: &[u8]) {
        self.chip().memory[address..address + bytes.len()].copy_from_slice(bytes);
    }

    /// First offset of `pattern` in the image.
    pub fn find(&self, pattern: &[u8]) -> Option<usize> {
        self.chip()
            .memory
            .windows(pattern.len())
            .position(|window| window == pattern)
    }

    pub fn erase_count(&self, sector: usize) -> u32 {
        self.chip().erase_counts[sector]
    }

    /// Commands the chip dropped because they arrived mid-operation.
    pub fn ignored_while_busy(&self) -> u32 {
        self.chip().ignored_while_busy
    }
}

impl ErrorType for SimFlash {
    type Error = ErrorKind;
}

impl SpiDevice for SimFlash {
    fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), ErrorKind> {
        let mut chip = self.chip();
        if chip.fail_transactions {
            return Err(ErrorKind::Other);
        }
        let mut written: Vec<u8> = Vec::new();
        let mut read = 0;
        for op in operations.iter_mut() {
            match op {
                Operation::Write(data) => written.extend_from_slice(data),
                Operation::Read(buf) => {
                    chip.respond(&written, read, buf);
                    read += buf.len();
                }
                Operation::DelayNs(_) => {}
                Operation::Transfer(_, _) | Operation::TransferInPlace(_) => {
                    return Err(ErrorKind::Other);
                }
            }
        }
        chip.finish(&written);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::ex_flash::{ExFlashError, FlashTransaction, SpiCommand, W25Q128};
    use embedded_hal_mock::eh1::delay::NoopDelay;

    const CAPACITY: u32 = 1024 * 1024;

    fn flash(sim: &SimFlash) -> W25Q128<SimFlash, NoopDelay> {
        W25Q128::with_capacity(sim.clone(), NoopDelay::new(), CAPACITY)
    }

    #[test]
    fn page_program_wraps_within_the_page() {
        let sim = SimFlash::new(CAPACITY);
        let mut flash = flash(&sim);
        flash.write_enable().unwrap();
        flash
            .execute(
                FlashTransaction::command(SpiCommand::PageProgram)
                    .address(0x1FE)
                    .write(&[1, 2, 3, 4]),
            )
            .unwrap();
        assert_eq!(sim.peek(0x1FE, 2), vec![1, 2]);
        assert_eq!(sim.peek(0x100, 2), vec![3, 4]);
    }

    #[test]
    fn program_only_clears_bits() {
        let sim = SimFlash::new(CAPACITY);
        let mut flash = flash(&sim);
        flash.program_page(0x40, &[0b1010_1010]).unwrap();
        flash.program_page(0x40, &[0b0110_0110]).unwrap();
        assert_eq!(flash_read(&mut flash, 0x40, 1), vec![0b0010_0010]);
    }

    #[test]
    fn transport_polls_out_busy_before_the_next_command() {
        let sim = SimFlash::new(CAPACITY);
        sim.set_busy_polls(3);
        let mut flash = flash(&sim);
        flash.erase_sector(0).unwrap();
        flash.program_page(0x10, &[0x55]).unwrap();
        assert_eq!(sim.ignored_while_busy(), 0);
        assert_eq!(sim.erase_count(0), 1);
        assert_eq!(sim.peek(0x10, 1), vec![0x55]);
    }

    #[test]
    fn command_issued_mid_erase_is_dropped_by_the_chip() {
        let sim = SimFlash::new(CAPACITY);
        let mut flash = flash(&sim);
        flash.write_enable().unwrap();
        flash
            .execute(FlashTransaction::command(SpiCommand::SectorErase4Kb).address(0))
            .unwrap();
        flash
            .execute(FlashTransaction::command(SpiCommand::WriteEnable))
            .unwrap();
        assert_eq!(sim.ignored_while_busy(), 1);
    }

    #[test]
    fn stuck_busy_chip_reports_timeout() {
        let sim = SimFlash::new(CAPACITY);
        let mut flash = flash(&sim);
        sim.set_stuck_busy(true);
        assert_eq!(flash.erase_sector(0x1000), Err(ExFlashError::Timeout));
    }

    #[test]
    fn jedec_id_identifies_a_w25q128() {
        let sim = SimFlash::new(CAPACITY);
        let mut flash = flash(&sim);
        assert_eq!(flash.init().unwrap(), W25Q128_JEDEC_ID);
        assert_eq!(flash.read_manufacturer_id().unwrap(), DEVICE_ID);
    }

    fn flash_read(flash: &mut W25Q128<SimFlash, NoopDelay>, addr: u32, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        flash.read_data(addr, &mut buf).unwrap();
        buf
    }
}

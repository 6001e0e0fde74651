use embedded_hal::delay::DelayNs;
use embedded_hal::spi::{Error as _, ErrorKind, Operation, SpiDevice};
use log::{info, warn};

#[allow(dead_code)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum SpiCommand {
    WriteEnable = 0x06,
    WriteDisable = 0x04,
    ReadStatusReg1 = 0x05,
    ReadStatusReg2 = 0x35,
    ReadJedecId = 0x9F,
    ReadUniqueId = 0x4B,
    ManufacturerDeviceId = 0x90,
    ReadData = 0x03,
    FastRead = 0x0B,
    PageProgram = 0x02,
    SectorErase4Kb = 0x20,
    BlockErase32Kb = 0x52,
    BlockErase64Kb = 0xD8,
    ChipErase = 0xC7,
    PowerDown = 0xB9,
    ReleasePowerDown = 0xAB,
    EnableReset = 0x66,
    ResetDevice = 0x99,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExFlashError {
    AddressInvalid,
    LenInvalid,
    Spi(ErrorKind),
    WriteEnableFailed,
    PageBoundaryViolation,
    Misaligned,
    /// The chip kept reporting write-in-progress past the operation's budget.
    Timeout,
    UnknownDevice([u8; 3]),
}

// Status Register 1 bits
pub const BUSY_BIT: u8 = 0x01;
pub const WEL_BIT: u8 = 0x02;

pub const PAGE_SIZE: usize = 256;
pub const SECTOR_SIZE: u32 = 4096;
pub const BLOCK_32K: u32 = 32 * 1024;
pub const BLOCK_64K: u32 = 64 * 1024;
pub const FLASH_CAPACITY: u32 = 16 * 1024 * 1024; // 16MB for W25Q128FV

pub const WINBOND_MANUFACTURER_ID: u8 = 0xEF;
pub const W25Q128_JEDEC_ID: [u8; 3] = [0xEF, 0x40, 0x18];

// Completion budgets, datasheet worst case plus margin (microseconds)
const POLL_INTERVAL_US: u32 = 100;
const PAGE_PROGRAM_TIMEOUT_US: u32 = 10_000;
const SECTOR_ERASE_TIMEOUT_US: u32 = 500_000;
const BLOCK_32K_ERASE_TIMEOUT_US: u32 = 1_600_000;
const BLOCK_64K_ERASE_TIMEOUT_US: u32 = 2_500_000;
const CHIP_ERASE_TIMEOUT_US: u32 = 200_000_000;
const RESET_RECOVERY_US: u32 = 30;

/// Data phase of a [`FlashTransaction`].
pub enum Payload<'a> {
    None,
    Write(&'a [u8]),
    Read(&'a mut [u8]),
}

/// One command/address/data exchange with the chip.
///
/// The whole exchange runs as a single [`SpiDevice::transaction`], so chip
/// select stays asserted and the bus stays owned from the opcode until the
/// last payload byte.
pub struct FlashTransaction<'a> {
    opcode: SpiCommand,
    address: Option<u32>,
    dummy: usize,
    payload: Payload<'a>,
}

impl<'a> FlashTransaction<'a> {
    pub fn command(opcode: SpiCommand) -> Self {
        Self {
            opcode,
            address: None,
            dummy: 0,
            payload: Payload::None,
        }
    }

    pub fn address(mut self, address: u32) -> Self {
        self.address = Some(address);
        self
    }

    /// Dummy bytes clocked out after the address (at most 4).
    pub fn dummy(mut self, count: usize) -> Self {
        self.dummy = count.min(4);
        self
    }

    pub fn write(mut self, data: &'a [u8]) -> Self {
        self.payload = Payload::Write(data);
        self
    }

    pub fn read(mut self, buffer: &'a mut [u8]) -> Self {
        self.payload = Payload::Read(buffer);
        self
    }

    fn header(&self) -> ([u8; 8], usize) {
        let mut header = [0u8; 8];
        header[0] = self.opcode as u8;
        let mut len = 1;
        if let Some(address) = self.address {
            // 3-byte big-endian address
            header[1] = (address >> 16) as u8;
            header[2] = (address >> 8) as u8;
            header[3] = address as u8;
            len += 3;
        }
        len += self.dummy;
        (header, len)
    }
}

/// W25Q128 serial NOR flash on an SPI device.
#[derive(Debug)]
pub struct W25Q128<SPI, D> {
    spi: SPI,
    delay: D,
    capacity: u32,
}

impl<SPI, D> W25Q128<SPI, D>
where
    SPI: SpiDevice,
    D: DelayNs,
{
    pub fn new(spi: SPI, delay: D) -> Self {
        Self::with_capacity(spi, delay, FLASH_CAPACITY)
    }

    /// Same command set on a smaller part (W25Q32/W25Q64).
    pub fn with_capacity(spi: SPI, delay: D, capacity: u32) -> Self {
        Self {
            spi,
            delay,
            capacity,
        }
    }

    pub fn release(self) -> (SPI, D) {
        (self.spi, self.delay)
    }

    /// Wake the chip, reset it and check it answers with a Winbond JEDEC ID.
    pub fn init(&mut self) -> Result<[u8; 3], ExFlashError> {
        self.release_power_down()?;
        self.software_reset()?;

        let id = self.read_jedec_id()?;
        if id[0] != WINBOND_MANUFACTURER_ID {
            warn!("[ExFlash] Unexpected JEDEC ID {id:02X?}");
            return Err(ExFlashError::UnknownDevice(id));
        }
        if id != W25Q128_JEDEC_ID {
            warn!("[ExFlash] Winbond part {id:02X?} is not a W25Q128");
        }
        info!(
            "[ExFlash] JEDEC ID {id:02X?}, capacity {} KiB",
            self.capacity / 1024
        );
        Ok(id)
    }

    /// Run one transaction with chip select held across every phase.
    pub fn execute(&mut self, txn: FlashTransaction<'_>) -> Result<(), ExFlashError> {
        let (header, len) = txn.header();
        let header = &header[..len];
        let result = match txn.payload {
            Payload::None => self.spi.transaction(&mut [Operation::Write(header)]),
            Payload::Write(data) => self
                .spi
                .transaction(&mut [Operation::Write(header), Operation::Write(data)]),
            Payload::Read(buffer) => self
                .spi
                .transaction(&mut [Operation::Write(header), Operation::Read(buffer)]),
        };
        result.map_err(|e| ExFlashError::Spi(e.kind()))
    }

    fn validate_address(&self, address: u32) -> Result<(), ExFlashError> {
        if address >= self.capacity {
            return Err(ExFlashError::AddressInvalid);
        }
        Ok(())
    }

    fn validate_address_range(&self, address: u32, length: usize) -> Result<(), ExFlashError> {
        self.validate_address(address)?;
        if address as u64 + length as u64 > self.capacity as u64 {
            return Err(ExFlashError::LenInvalid);
        }
        Ok(())
    }

    /// Read JEDEC ID (Manufacturer ID + Memory type + Capacity)
    pub fn read_jedec_id(&mut self) -> Result<[u8; 3], ExFlashError> {
        let mut id = [0u8; 3];
        self.execute(FlashTransaction::command(SpiCommand::ReadJedecId).read(&mut id))?;
        Ok(id)
    }

    /// Factory-programmed 64-bit unique ID
    pub fn read_unique_id(&mut self) -> Result<[u8; 8], ExFlashError> {
        let mut id = [0u8; 8];
        self.execute(
            FlashTransaction::command(SpiCommand::ReadUniqueId)
                .dummy(4)
                .read(&mut id),
        )?;
        Ok(id)
    }

    /// Manufacturer and device ID (0x90)
    pub fn read_manufacturer_id(&mut self) -> Result<[u8; 2], ExFlashError> {
        let mut id = [0u8; 2];
        self.execute(
            FlashTransaction::command(SpiCommand::ManufacturerDeviceId)
                .address(0)
                .read(&mut id),
        )?;
        Ok(id)
    }

    pub fn read_status(&mut self) -> Result<u8, ExFlashError> {
        let mut status = [0u8; 1];
        self.execute(FlashTransaction::command(SpiCommand::ReadStatusReg1).read(&mut status))?;
        Ok(status[0])
    }

    pub fn write_in_progress(&mut self) -> Result<bool, ExFlashError> {
        Ok(self.read_status()? & BUSY_BIT != 0)
    }

    pub fn write_enabled(&mut self) -> Result<bool, ExFlashError> {
        Ok(self.read_status()? & WEL_BIT != 0)
    }

    /// Poll the busy bit until clear or until `timeout_us` has elapsed.
    fn wait_ready(&mut self, timeout_us: u32) -> Result<(), ExFlashError> {
        let mut waited = 0u32;
        while self.write_in_progress()? {
            if waited >= timeout_us {
                warn!("[ExFlash] Device unresponsive after {timeout_us} us");
                return Err(ExFlashError::Timeout);
            }
            self.delay.delay_us(POLL_INTERVAL_US);
            waited = waited.saturating_add(POLL_INTERVAL_US);
        }
        Ok(())
    }

    /// Set the write enable latch and confirm the chip latched it.
    pub fn write_enable(&mut self) -> Result<(), ExFlashError> {
        self.execute(FlashTransaction::command(SpiCommand::WriteEnable))?;
        if !self.write_enabled()? {
            return Err(ExFlashError::WriteEnableFailed);
        }
        Ok(())
    }

    pub fn write_disable(&mut self) -> Result<(), ExFlashError> {
        self.execute(FlashTransaction::command(SpiCommand::WriteDisable))
    }

    pub fn read_data(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), ExFlashError> {
        self.validate_address_range(address, buffer.len())?;
        if buffer.is_empty() {
            return Err(ExFlashError::LenInvalid);
        }
        self.execute(
            FlashTransaction::command(SpiCommand::ReadData)
                .address(address)
                .read(buffer),
        )
    }

    /// Fast read with dummy byte
    pub fn fast_read(&mut self, address: u32, buffer: &mut [u8]) -> Result<(), ExFlashError> {
        self.validate_address_range(address, buffer.len())?;
        if buffer.is_empty() {
            return Err(ExFlashError::LenInvalid);
        }
        self.execute(
            FlashTransaction::command(SpiCommand::FastRead)
                .address(address)
                .dummy(1)
                .read(buffer),
        )
    }

    /// Program within a single 256-byte page.
    pub fn program_page(&mut self, address: u32, data: &[u8]) -> Result<(), ExFlashError> {
        self.validate_address(address)?;
        if data.is_empty() {
            return Err(ExFlashError::LenInvalid);
        }
        let page_offset = address as usize % PAGE_SIZE;
        if data.len() > PAGE_SIZE - page_offset {
            return Err(ExFlashError::PageBoundaryViolation);
        }
        self.validate_address_range(address, data.len())?;

        self.wait_ready(PAGE_PROGRAM_TIMEOUT_US)?;
        self.write_enable()?;
        self.execute(
            FlashTransaction::command(SpiCommand::PageProgram)
                .address(address)
                .write(data),
        )?;
        self.wait_ready(PAGE_PROGRAM_TIMEOUT_US)
    }

    /// Program an arbitrary span, split at page boundaries.
    pub fn write_data(&mut self, address: u32, data: &[u8]) -> Result<(), ExFlashError> {
        self.validate_address_range(address, data.len())?;
        if data.is_empty() {
            return Err(ExFlashError::LenInvalid);
        }
        let mut written = 0;
        while written < data.len() {
            let at = address + written as u32;
            let room = PAGE_SIZE - at as usize % PAGE_SIZE;
            let chunk = room.min(data.len() - written);
            self.program_page(at, &data[written..written + chunk])?;
            written += chunk;
        }
        Ok(())
    }

    fn erase(&mut self, cmd: SpiCommand, address: u32, timeout_us: u32) -> Result<(), ExFlashError> {
        self.wait_ready(timeout_us)?;
        self.write_enable()?;
        self.execute(FlashTransaction::command(cmd).address(address))?;
        self.wait_ready(timeout_us)
    }

    /// Erase the 4KB sector starting at `address`.
    pub fn erase_sector(&mut self, address: u32) -> Result<(), ExFlashError> {
        self.validate_address(address)?;
        if address % SECTOR_SIZE != 0 {
            return Err(ExFlashError::Misaligned);
        }
        self.erase(SpiCommand::SectorErase4Kb, address, SECTOR_ERASE_TIMEOUT_US)
    }

    pub fn erase_block_32kb(&mut self, address: u32) -> Result<(), ExFlashError> {
        self.validate_address(address)?;
        if address % BLOCK_32K != 0 {
            return Err(ExFlashError::Misaligned);
        }
        self.erase(SpiCommand::BlockErase32Kb, address, BLOCK_32K_ERASE_TIMEOUT_US)
    }

    pub fn erase_block_64kb(&mut self, address: u32) -> Result<(), ExFlashError> {
        self.validate_address(address)?;
        if address % BLOCK_64K != 0 {
            return Err(ExFlashError::Misaligned);
        }
        self.erase(SpiCommand::BlockErase64Kb, address, BLOCK_64K_ERASE_TIMEOUT_US)
    }

    /// Erase entire chip (up to 200 seconds)
    pub fn erase_chip(&mut self) -> Result<(), ExFlashError> {
        self.wait_ready(CHIP_ERASE_TIMEOUT_US)?;
        self.write_enable()?;
        self.execute(FlashTransaction::command(SpiCommand::ChipErase))?;
        self.wait_ready(CHIP_ERASE_TIMEOUT_US)
    }

    pub fn power_down(&mut self) -> Result<(), ExFlashError> {
        self.execute(FlashTransaction::command(SpiCommand::PowerDown))
    }

    pub fn release_power_down(&mut self) -> Result<(), ExFlashError> {
        self.execute(FlashTransaction::command(SpiCommand::ReleasePowerDown))?;
        self.delay.delay_us(RESET_RECOVERY_US);
        Ok(())
    }

    pub fn software_reset(&mut self) -> Result<(), ExFlashError> {
        self.execute(FlashTransaction::command(SpiCommand::EnableReset))?;
        self.execute(FlashTransaction::command(SpiCommand::ResetDevice))?;
        self.delay.delay_us(RESET_RECOVERY_US);
        Ok(())
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn page_size(&self) -> usize {
        PAGE_SIZE
    }

    pub fn sector_size(&self) -> u32 {
        SECTOR_SIZE
    }
}

#![no_std]
#![no_main]

use alarm_clock::cfg::board_cfg::FLASH_SPI_KHZ;
use alarm_clock::mem::block_device::FlashBlockDevice;
use alarm_clock::mem::ex_flash::{ExFlashError, W25Q128};
use alarm_clock::mem::fs::{FlashFs, OpenFlags};
use embassy_executor::Spawner;
use embassy_time::Timer;
use embedded_hal_bus::spi::ExclusiveDevice;
use esp_backtrace as _;
use esp_hal::delay::Delay;
use esp_hal::time::RateExtU32;
use esp_hal::{
    clock::CpuClock,
    gpio::{Level, Output},
    spi::{
        master::{Config, Spi},
        Mode,
    },
    timer::timg::TimerGroup,
};
use log::{error, info, warn};

const TEST_PATH: &str = "/uploads/test.txt";

#[esp_hal_embassy::main]
async fn main(_spawner: Spawner) -> ! {
    esp_println::logger::init_logger_from_env();
    let peripherals = esp_hal::init({
        let mut config = esp_hal::Config::default();
        config.cpu_clock = CpuClock::max();
        config
    });
    esp_alloc::heap_allocator!(72 * 1024);
    let timg1 = TimerGroup::new(peripherals.TIMG1);
    esp_hal_embassy::init(timg1.timer0);

    let cs_pin = Output::new(peripherals.GPIO3, Level::High);
    let spi = Spi::new(
        peripherals.SPI2,
        Config::default()
            .with_frequency(FLASH_SPI_KHZ.kHz())
            .with_mode(Mode::_0), // CPOL = 0, CPHA = 0
    )
    .unwrap()
    .with_sck(peripherals.GPIO18)
    .with_mosi(peripherals.GPIO19)
    .with_miso(peripherals.GPIO20);
    let spi = ExclusiveDevice::new_no_delay(spi, cs_pin).unwrap();
    let mut flash = W25Q128::new(spi, Delay::new());

    info!("Initializing flash...");
    match flash.init() {
        Ok(id) => info!("✓ W25Q128 detected, JEDEC ID {id:02x?}"),
        Err(ExFlashError::UnknownDevice(id)) => {
            warn!("⚠ Unexpected JEDEC ID {id:02x?}, expected [0xEF, 0x40, 0x18]")
        }
        Err(e) => {
            error!("✗ Flash initialization failed: {e:?}");
            panic!("Cannot continue without flash initialization");
        }
    }
    info!("Flash capacity: {} MB", flash.capacity() / (1024 * 1024));
    info!("Page size: {} bytes", flash.page_size());
    info!("Sector size: {} bytes", flash.sector_size());

    // Last sector, away from the superblock pair at blocks 0 and 1
    let address = flash.capacity() - flash.sector_size();
    let write_data = [0xDE, 0xAD, 0xBE, 0xEF];
    let mut read_data = [0u8; 4];

    info!("Erasing sector at {address:#08x}...");
    match flash.erase_sector(address) {
        Ok(()) => info!("✓ Sector erased"),
        Err(e) => error!("✗ Sector erase failed: {e:?}"),
    }
    match flash.read_data(address, &mut read_data) {
        Ok(()) if read_data == [0xFF; 4] => info!("✓ Erase verified"),
        Ok(()) => error!("✗ Erase verification failed, read {read_data:02x?}"),
        Err(e) => error!("✗ Read after erase failed: {e:?}"),
    }

    info!("Writing {write_data:02x?} to {address:#08x}...");
    match flash.write_data(address, &write_data) {
        Ok(()) => info!("✓ Data written"),
        Err(ExFlashError::WriteEnableFailed) => error!("✗ Write enable latch did not set"),
        Err(ExFlashError::Timeout) => error!("✗ Chip stayed busy"),
        Err(e) => error!("✗ Write failed: {e:?}"),
    }
    match flash.read_data(address, &mut read_data) {
        Ok(()) if read_data == write_data => info!("✓ Write/Read test PASSED"),
        Ok(()) => error!("✗ Mismatch: wrote {write_data:02x?}, read {read_data:02x?}"),
        Err(e) => error!("✗ Read failed: {e:?}"),
    }

    info!("Mounting filesystem...");
    let device = match FlashBlockDevice::new(flash) {
        Ok(device) => device,
        Err(e) => {
            error!("✗ Geometry rejected: {e}");
            panic!("Cannot continue without a block device");
        }
    };
    let mut fs = FlashFs::new(device);
    match fs.mount() {
        Ok(()) => info!("✓ Filesystem mounted"),
        Err(e) => {
            error!("✗ Mount failed: {e}");
            panic!("Cannot continue without a filesystem");
        }
    }

    let written = fs
        .open(TEST_PATH, OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNC)
        .and_then(|file| {
            fs.write(&file, b"hello")?;
            fs.close(file)
        });
    match written {
        Ok(()) => info!("✓ Wrote {TEST_PATH}"),
        Err(e) => error!("✗ Writing {TEST_PATH} failed: {e}"),
    }

    let mut text = [0u8; 16];
    let read = fs.open(TEST_PATH, OpenFlags::READ).and_then(|file| {
        let n = fs.read_as_string(&file, &mut text)?;
        fs.close(file)?;
        Ok(n)
    });
    match read {
        Ok(n) if &text[..=n] == b"hello\0" => info!("✓ Read back {TEST_PATH}"),
        Ok(n) => error!("✗ Read back {:02x?}", &text[..n]),
        Err(e) => error!("✗ Reading {TEST_PATH} failed: {e}"),
    }

    match fs.fs_size() {
        Ok(blocks) => info!("Blocks in use: {blocks}"),
        Err(e) => warn!("⚠ Could not size the filesystem: {e}"),
    }

    info!("Flash test complete");
    loop {
        Timer::after_secs(10).await;
    }
}

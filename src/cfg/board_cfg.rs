// SPI2 wiring for the W25Q128 (mode 0)
pub const FLASH_SPI_KHZ: u32 = 10_000;
// Display / bus timing
pub const DISPLAY_LOCK_TIMEOUT_MS: u64 = 100;
pub const DISPLAY_BRIGHTNESS: u8 = 7;
pub const I2C_KHZ: u32 = 100;
// Task periods
pub const CLOCK_TICK_MS: u64 = 1000;
pub const PROXIMITY_WAIT_MS: u64 = 5000;
pub const LED_BLINK_MS: u32 = 100;

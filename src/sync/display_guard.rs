//! Mutex-guarded access to the 7-segment display.
//!
//! Every display update is a run of start/bytes/stop frames on a two-wire
//! link. The clock tick and brightness changes come from different tasks,
//! so each complete run is emitted under one lock. Waiting for the lock is
//! bounded; a caller that times out has written nothing and can retry on
//! its next cycle.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_time::{with_timeout, Duration};
use log::warn;

use crate::cfg::board_cfg::{DISPLAY_BRIGHTNESS, DISPLAY_LOCK_TIMEOUT_MS};
use crate::drivers::tm1637::{encode_digit, COLON};

pub const CMD_DATA_AUTO: u8 = 0x40;
pub const CMD_ADDRESS: u8 = 0xC0;
pub const CMD_DISPLAY_ON: u8 = 0x88;
pub const MAX_BRIGHTNESS: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DisplayError {
    #[error("display busy")]
    LockTimeout,
    #[error("display pin error")]
    Pin,
}

/// Byte-framed link to a display controller.
#[allow(async_fn_in_trait)]
pub trait FrameWire {
    async fn start(&mut self) -> Result<(), DisplayError>;
    async fn write_byte(&mut self, byte: u8) -> Result<(), DisplayError>;
    async fn stop(&mut self) -> Result<(), DisplayError>;
}

struct Panel<W> {
    wire: W,
    brightness: u8,
}

impl<W: FrameWire> Panel<W> {
    async fn frame(&mut self, bytes: &[u8]) -> Result<(), DisplayError> {
        self.wire.start().await?;
        for &byte in bytes {
            self.wire.write_byte(byte).await?;
        }
        self.wire.stop().await
    }

    async fn show(&mut self, segments: [u8; 4]) -> Result<(), DisplayError> {
        self.frame(&[CMD_DATA_AUTO]).await?;
        let [a, b, c, d] = segments;
        self.frame(&[CMD_ADDRESS, a, b, c, d]).await?;
        self.frame(&[CMD_DISPLAY_ON | self.brightness]).await
    }
}

pub struct GuardedDisplay<M: RawMutex, W> {
    panel: Mutex<M, Panel<W>>,
    timeout: Duration,
}

impl<M: RawMutex, W: FrameWire> GuardedDisplay<M, W> {
    pub fn new(wire: W) -> Self {
        Self::with_timeout(wire, Duration::from_millis(DISPLAY_LOCK_TIMEOUT_MS))
    }

    pub fn with_timeout(wire: W, timeout: Duration) -> Self {
        Self {
            panel: Mutex::new(Panel {
                wire,
                brightness: DISPLAY_BRIGHTNESS.min(MAX_BRIGHTNESS),
            }),
            timeout,
        }
    }

    async fn lock(&self) -> Result<MutexGuard<'_, M, Panel<W>>, DisplayError> {
        with_timeout(self.timeout, self.panel.lock())
            .await
            .map_err(|_| {
                warn!("[TM1637] Display busy, update dropped");
                DisplayError::LockTimeout
            })
    }

    /// Light every segment at full brightness.
    pub async fn init(&self) -> Result<(), DisplayError> {
        let mut panel = self.lock().await?;
        panel.frame(&[CMD_DATA_AUTO]).await?;
        panel.frame(&[CMD_ADDRESS, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]).await?;
        panel.frame(&[CMD_DISPLAY_ON | MAX_BRIGHTNESS]).await
    }

    /// Show `HH:MM`.
    pub async fn update_time(&self, hours: u8, minutes: u8, colon: bool) -> Result<(), DisplayError> {
        let mut segments = [
            encode_digit(hours / 10 % 10),
            encode_digit(hours % 10),
            encode_digit(minutes / 10 % 10),
            encode_digit(minutes % 10),
        ];
        if colon {
            segments[1] |= COLON;
        }
        self.show_segments(segments).await
    }

    pub async fn show_segments(&self, segments: [u8; 4]) -> Result<(), DisplayError> {
        let mut panel = self.lock().await?;
        panel.show(segments).await
    }

    /// Level 0..=7; larger values are clamped.
    pub async fn set_brightness(&self, level: u8) -> Result<(), DisplayError> {
        let mut panel = self.lock().await?;
        panel.brightness = level.min(MAX_BRIGHTNESS);
        let command = CMD_DISPLAY_ON | panel.brightness;
        panel.frame(&[command]).await
    }
}

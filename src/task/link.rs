//! Wi-Fi link selection: station first, access point after repeated failures.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    Station,
    AccessPoint,
}

/// Raised by the Wi-Fi task once a link is usable.
pub type LinkReady = Signal<CriticalSectionRawMutex, LinkMode>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    Retry,
    FallBackToAccessPoint,
}

/// Counts consecutive station connect failures.
#[derive(Debug)]
pub struct StationRetry {
    failures: u8,
    max: u8,
}

impl StationRetry {
    pub const fn new(max: u8) -> Self {
        Self { failures: 0, max }
    }

    pub fn connected(&mut self) {
        self.failures = 0;
    }

    pub fn failed(&mut self) -> NextStep {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.max {
            NextStep::FallBackToAccessPoint
        } else {
            NextStep::Retry
        }
    }

    pub fn failures(&self) -> u8 {
        self.failures
    }
}

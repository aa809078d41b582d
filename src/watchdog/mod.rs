//! Liveness guard over a watchdog.
//!
//! The guard is configured once at process start and fed on every service
//! iteration. If feeding stops for longer than the timeout the platform
//! resets the device; software never tries to recover from that.
//!
//! Backends:
//! - [`linux::LinuxWatchdog`] - kernel watchdog device (`/dev/watchdog`)
//! - [`soft::SoftWatchdog`] - in-process monitor for hosts without one

pub mod linux;
pub mod soft;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::{WatchdogBackend, WatchdogConfig};

/// `WDIOF_CARDRESET` from `linux/watchdog.h`.
const WDIOF_CARDRESET: i32 = 0x0020;

#[derive(Debug, thiserror::Error)]
pub enum WatchdogError {
    #[error("Failed to open watchdog device {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Watchdog request {op} failed: {source}")]
    Ioctl {
        op: &'static str,
        source: nix::Error,
    },

    #[error("Watchdog timeout {0:?} is not supported")]
    UnsupportedTimeout(Duration),

    #[error("Failed to start watchdog monitor: {0}")]
    Monitor(std::io::Error),

    #[error("Liveness guard is already configured")]
    AlreadyConfigured,

    #[error("Watchdog is not configured")]
    NotConfigured,
}

/// Why the previous boot ended, as far as the watchdog knows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetReason {
    PowerOn,
    Watchdog,
    Unknown,
}

impl ResetReason {
    /// Interprets the flags returned by `WDIOC_GETBOOTSTATUS`.
    pub fn from_boot_flags(flags: i32) -> Self {
        if flags & WDIOF_CARDRESET != 0 {
            Self::Watchdog
        } else {
            Self::PowerOn
        }
    }
}

impl fmt::Display for ResetReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PowerOn => f.write_str("power-on"),
            Self::Watchdog => f.write_str("watchdog-reset"),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// Hardware (or emulated) watchdog peripheral.
pub trait Watchdog: fmt::Debug {
    /// Arms the watchdog, returning the timeout the device actually applied.
    fn configure(&mut self, timeout: Duration) -> Result<Duration, WatchdogError>;

    fn feed(&mut self) -> Result<(), WatchdogError>;

    fn reset_reason(&self) -> ResetReason;
}

/// Opens the backend selected in the configuration.
pub fn open(config: &WatchdogConfig) -> Result<Box<dyn Watchdog>, WatchdogError> {
    match config.backend {
        WatchdogBackend::Hardware => Ok(Box::new(linux::LinuxWatchdog::open(&config.device)?)),
        WatchdogBackend::Software => Ok(Box::new(soft::SoftWatchdog::default())),
    }
}

#[derive(Debug)]
pub struct LivenessGuard {
    watchdog: Box<dyn Watchdog>,
    timeout: Option<Duration>,
    feeds: u64,
}

impl LivenessGuard {
    pub fn new(watchdog: Box<dyn Watchdog>) -> Self {
        Self {
            watchdog,
            timeout: None,
            feeds: 0,
        }
    }

    /// Sets the reset-on-timeout policy. Only the first call is accepted.
    pub fn configure(&mut self, timeout: Duration) -> Result<(), WatchdogError> {
        if self.timeout.is_some() {
            return Err(WatchdogError::AlreadyConfigured);
        }

        let applied = self.watchdog.configure(timeout)?;
        if applied != timeout {
            warn!(
                "Watchdog applied timeout {:?} instead of requested {:?}",
                applied, timeout
            );
        }
        info!(
            "Liveness guard armed with {:?} timeout (last reset: {})",
            applied,
            self.watchdog.reset_reason()
        );
        self.timeout = Some(applied);
        Ok(())
    }

    /// Resets the countdown. Failures are logged; the hardware takes over
    /// if they persist.
    pub fn feed(&mut self) {
        match self.watchdog.feed() {
            Ok(()) => self.feeds += 1,
            Err(e) => error!("Failed to feed watchdog: {}", e),
        }
    }

    pub fn feeds(&self) -> u64 {
        self.feeds
    }

    pub fn reset_reason(&self) -> ResetReason {
        self.watchdog.reset_reason()
    }
}

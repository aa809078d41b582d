//! Kernel watchdog device driver (`linux/watchdog.h` ioctls).
//!
//! The device is opened for writing, which arms it. It is never closed with
//! the magic character, so a dead process leaves the watchdog running and
//! the board resets once the timeout passes.

use nix::libc::c_int;
use nix::{ioctl_read, ioctl_readwrite};
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use super::{ResetReason, Watchdog, WatchdogError};

const WATCHDOG_IOCTL_BASE: u8 = b'W';

ioctl_read!(wdioc_getbootstatus, WATCHDOG_IOCTL_BASE, 2, c_int);
ioctl_read!(wdioc_keepalive, WATCHDOG_IOCTL_BASE, 5, c_int);
ioctl_readwrite!(wdioc_settimeout, WATCHDOG_IOCTL_BASE, 6, c_int);

#[derive(Debug)]
pub struct LinuxWatchdog {
    device: File,
    path: PathBuf,
    boot_status: ResetReason,
}

impl LinuxWatchdog {
    pub fn open(path: &Path) -> Result<Self, WatchdogError> {
        let device = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|source| WatchdogError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        let boot_status = read_boot_status(&device);
        info!("Opened watchdog {:?}, boot status: {}", path, boot_status);

        Ok(Self {
            device,
            path: path.to_path_buf(),
            boot_status,
        })
    }
}

impl Watchdog for LinuxWatchdog {
    fn configure(&mut self, timeout: Duration) -> Result<Duration, WatchdogError> {
        let mut seconds =
            c_int::try_from(timeout.as_secs()).map_err(|_| WatchdogError::UnsupportedTimeout(timeout))?;
        if seconds <= 0 {
            return Err(WatchdogError::UnsupportedTimeout(timeout));
        }

        // SAFETY: the fd is an open watchdog device and `seconds` outlives the call.
        unsafe { wdioc_settimeout(self.device.as_raw_fd(), &mut seconds) }.map_err(|source| {
            WatchdogError::Ioctl {
                op: "WDIOC_SETTIMEOUT",
                source,
            }
        })?;

        // The driver writes back the timeout it settled on.
        let applied = u64::try_from(seconds).map_err(|_| WatchdogError::UnsupportedTimeout(timeout))?;
        debug!("Watchdog {:?} timeout set to {}s", self.path, applied);
        Ok(Duration::from_secs(applied))
    }

    fn feed(&mut self) -> Result<(), WatchdogError> {
        let mut unused: c_int = 0;
        // SAFETY: the fd is an open watchdog device and `unused` outlives the call.
        unsafe { wdioc_keepalive(self.device.as_raw_fd(), &mut unused) }
            .map(|_| ())
            .map_err(|source| WatchdogError::Ioctl {
                op: "WDIOC_KEEPALIVE",
                source,
            })
    }

    fn reset_reason(&self) -> ResetReason {
        self.boot_status
    }
}

fn read_boot_status(device: &File) -> ResetReason {
    let mut flags: c_int = 0;
    // SAFETY: the fd is an open watchdog device and `flags` outlives the call.
    match unsafe { wdioc_getbootstatus(device.as_raw_fd(), &mut flags) } {
        Ok(_) => ResetReason::from_boot_flags(flags),
        Err(e) => {
            debug!("Watchdog boot status unavailable: {}", e);
            ResetReason::Unknown
        }
    }
}

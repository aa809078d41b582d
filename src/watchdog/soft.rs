use std::process;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info};

use super::{ResetReason, Watchdog, WatchdogError};

/// Upper bound on how late the monitor notices an expiry.
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Deadline model of a watchdog.
///
/// Feeding at any cadence strictly below the timeout never expires. Once
/// the time since the last feed exceeds the timeout, [`poll`](Self::poll)
/// reports the reset exactly once.
#[derive(Debug, Clone)]
pub struct ExpiryTracker {
    timeout: Duration,
    last_feed: Instant,
    fired: bool,
}

impl ExpiryTracker {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            timeout,
            last_feed: now,
            fired: false,
        }
    }

    pub fn feed(&mut self, now: Instant) {
        if !self.fired {
            self.last_feed = now;
        }
    }

    /// Returns `true` on the first poll past the deadline, `false` otherwise.
    pub fn poll(&mut self, now: Instant) -> bool {
        if self.fired {
            return false;
        }
        if now.saturating_duration_since(self.last_feed) > self.timeout {
            self.fired = true;
            return true;
        }
        false
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }
}

/// Watchdog emulated by a monitor thread that aborts the process on expiry.
#[derive(Debug, Default)]
pub struct SoftWatchdog {
    tracker: Option<Arc<Mutex<ExpiryTracker>>>,
}

impl Watchdog for SoftWatchdog {
    fn configure(&mut self, timeout: Duration) -> Result<Duration, WatchdogError> {
        if timeout.is_zero() {
            return Err(WatchdogError::UnsupportedTimeout(timeout));
        }
        if self.tracker.is_some() {
            return Err(WatchdogError::AlreadyConfigured);
        }

        let tracker = Arc::new(Mutex::new(ExpiryTracker::new(timeout, Instant::now())));
        let monitored = Arc::clone(&tracker);
        let interval = (timeout / 4).min(MAX_POLL_INTERVAL);

        thread::Builder::new()
            .name("soft-watchdog".to_string())
            .spawn(move || monitor(&monitored, interval))
            .map_err(WatchdogError::Monitor)?;

        info!("Software watchdog started ({:?} timeout)", timeout);
        self.tracker = Some(tracker);
        Ok(timeout)
    }

    fn feed(&mut self) -> Result<(), WatchdogError> {
        let tracker = self.tracker.as_ref().ok_or(WatchdogError::NotConfigured)?;
        tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .feed(Instant::now());
        Ok(())
    }

    fn reset_reason(&self) -> ResetReason {
        ResetReason::Unknown
    }
}

fn monitor(tracker: &Mutex<ExpiryTracker>, interval: Duration) {
    loop {
        thread::sleep(interval);
        let expired = tracker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .poll(Instant::now());
        if expired {
            error!("Software watchdog expired, aborting process");
            process::abort();
        }
    }
}

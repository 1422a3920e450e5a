//! Time sources.
//!
//! Everything time-dependent in the crate reads the current time through
//! [`Clock`] so that window and timeout behaviour can be driven by a
//! [`ManualClock`] in tests.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Source of the current time, expressed as the duration since the UNIX epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        // A clock set before 1970 reads as the epoch itself.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying time, so a test can hand one clone to a
/// breaker or store and advance another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<Duration>>,
}

impl ManualClock {
    /// Create a clock reading `start` since the epoch.
    pub fn new(start: Duration) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Create a clock starting at the current wall-clock time.
    pub fn starting_now() -> Self {
        Self::new(SystemClock.now())
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        *self.current.lock() += by;
    }

    /// Jump to an absolute time.
    pub fn set(&self, to: Duration) {
        *self.current.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.current.lock()
    }
}

/// Shared handle to the system clock.
pub fn system() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

use parking_lot::Mutex;
use std::time::{Duration, Instant};

use super::Host;

/// A host backed by the monotonic clock.
#[derive(Debug)]
pub struct ClockHost {
    origin: Instant,
}

impl ClockHost {
    /// Creates a host whose time starts at zero now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for ClockHost {
    fn default() -> Self {
        Self::new()
    }
}

impl Host for ClockHost {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// A host whose time only moves when told to.
///
/// Useful for deterministic tests of time-based instructions.
#[derive(Debug, Default)]
pub struct ManualHost {
    now: Mutex<Duration>,
}

impl ManualHost {
    /// Creates a host at time zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves host time forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = now.saturating_add(by);
    }

    /// Sets host time to `to`.
    pub fn set(&self, to: Duration) {
        *self.now.lock() = to;
    }
}

impl Host for ManualHost {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
}

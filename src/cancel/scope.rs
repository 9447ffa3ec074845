//! The rotating process-wide cancellation scope behind `stop_all`.

use parking_lot::RwLock;

use super::{CancelSource, CancelToken};
use crate::tracing_compat::debug;
use crate::types::CancelReason;

/// A cancellation scope that is replaced, not reset, when everything stops.
///
/// Runs started without their own token capture [`current_token`](Self::current_token)
/// at submission time. [`stop_all`](Self::stop_all) cancels that epoch and
/// installs a fresh source of the next generation under the same write lock,
/// so a reader observes either the old scope or the new one and work started
/// after the rotation is never affected by it.
#[derive(Debug)]
pub struct StopScope {
    current: RwLock<CancelSource>,
}

impl StopScope {
    /// Creates a scope at generation 0.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: RwLock::new(CancelSource::new()),
        }
    }

    /// Returns a token for the current generation.
    #[must_use]
    pub fn current_token(&self) -> CancelToken {
        self.current.read().token()
    }

    /// Returns the current generation.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.current.read().generation()
    }

    /// Cancels every run of the current generation and starts the next one.
    ///
    /// Returns the new generation.
    #[allow(clippy::must_use_candidate)]
    pub fn stop_all(&self) -> u64 {
        let mut current = self.current.write();
        let next = current.generation() + 1;
        current.cancel(CancelReason::stop_all());
        *current = CancelSource::with_generation(next);
        drop(current);
        debug!(generation = next, "stop scope rotated");
        next
    }
}

impl Default for StopScope {
    fn default() -> Self {
        Self::new()
    }
}

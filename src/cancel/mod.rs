//! Generation-stamped cancellation.
//!
//! A [`CancelSource`] owns the right to cancel; any number of [`CancelToken`]s
//! observe it. Every source carries the generation it was created in, so a
//! run can tell which epoch of the process-wide [`StopScope`] it belongs to.
//!
//! Cancellation is cooperative: the sequence pump checks the token before each
//! step and stops advancing once it is cancelled. Nothing is interrupted
//! mid-step.
//!
//! # Example
//!
//! ```
//! use affinity_bridge::cancel::CancelSource;
//! use affinity_bridge::types::CancelReason;
//!
//! let source = CancelSource::new();
//! let token = source.token();
//! assert!(!token.is_cancelled());
//!
//! assert!(source.cancel(CancelReason::user("closing")));
//! assert!(token.is_cancelled());
//! assert_eq!(token.reason(), Some(CancelReason::user("closing")));
//! ```

mod scope;

pub use scope::StopScope;

use core::fmt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::types::CancelReason;

struct CancelState {
    generation: u64,
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
}

impl CancelState {
    fn new(generation: u64) -> Self {
        Self {
            generation,
            cancelled: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }
}

/// The owning side of a cancellation epoch.
///
/// Dropping a source does not cancel its tokens.
pub struct CancelSource {
    state: Arc<CancelState>,
}

impl CancelSource {
    /// Creates a fresh, uncancelled source in generation 0.
    #[must_use]
    pub fn new() -> Self {
        Self::with_generation(0)
    }

    /// Creates a fresh, uncancelled source stamped with `generation`.
    #[must_use]
    pub fn with_generation(generation: u64) -> Self {
        Self {
            state: Arc::new(CancelState::new(generation)),
        }
    }

    /// Returns a token observing this source.
    #[must_use]
    pub fn token(&self) -> CancelToken {
        CancelToken {
            state: Arc::clone(&self.state),
        }
    }

    /// Returns the generation this source was created in.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.generation
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Requests cancellation with the given reason.
    ///
    /// Returns true if this call triggered the cancellation (first caller wins).
    #[allow(clippy::must_use_candidate)]
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let mut slot = self.state.reason.lock();
        if self
            .state
            .cancelled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *slot = Some(reason);
        true
    }
}

impl Default for CancelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelSource")
            .field("generation", &self.state.generation)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// An observer of a [`CancelSource`].
#[derive(Clone)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    /// Returns a token that is never cancelled.
    #[must_use]
    pub fn never() -> Self {
        CancelSource::new().token()
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::Acquire)
    }

    /// Returns the cancellation reason, if cancelled.
    #[must_use]
    pub fn reason(&self) -> Option<CancelReason> {
        if !self.is_cancelled() {
            return None;
        }
        self.state.reason.lock().clone()
    }

    /// Returns the generation of the source this token observes.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.generation
    }

    /// Returns true if both tokens observe the same source.
    #[must_use]
    pub fn same_source(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("generation", &self.state.generation)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

//! Tracing compatibility layer for structured logging.
//!
//! Every log statement in the crate goes through this module:
//!
//! - **With `tracing-integration`** (default): re-exports the `tracing` macros.
//! - **Without it**: the macros expand to nothing.
//!
//! ```rust,ignore
//! use crate::tracing_compat::{debug, trace};
//!
//! debug!(run_id = ?id, "sequence run started");
//! trace!(tick = n, "tick pumped");
//! ```

#[cfg(feature = "tracing-integration")]
pub use tracing::{debug, debug_span, error, info, trace, warn, Span};

#[cfg(not(feature = "tracing-integration"))]
mod noop {
    //! No-op implementations when tracing is disabled.

    /// No-op trace-level logging macro.
    macro_rules! trace {
        ($($arg:tt)*) => {};
    }

    /// No-op debug-level logging macro.
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    /// No-op info-level logging macro.
    macro_rules! info {
        ($($arg:tt)*) => {};
    }

    /// No-op warn-level logging macro.
    macro_rules! warn {
        ($($arg:tt)*) => {};
    }

    /// No-op error-level logging macro.
    macro_rules! error {
        ($($arg:tt)*) => {};
    }

    /// No-op debug_span macro.
    macro_rules! debug_span {
        ($($arg:tt)*) => {
            $crate::tracing_compat::Span
        };
    }

    pub(crate) use {debug, debug_span, error, info, trace, warn};
}

#[cfg(not(feature = "tracing-integration"))]
pub(crate) use noop::{debug, debug_span, error, info, trace, warn};

/// A no-op span used when tracing is disabled.
#[cfg(not(feature = "tracing-integration"))]
#[derive(Debug, Clone, Copy)]
pub struct Span;

#[cfg(not(feature = "tracing-integration"))]
impl Span {
    /// Returns a guard that does nothing on drop.
    #[inline]
    #[must_use]
    pub fn entered(self) -> Self {
        self
    }
}

//! Error types and error handling strategy for affinity-bridge.
//!
//! Error handling follows these principles:
//!
//! - Errors are explicit and typed (no stringly-typed errors)
//! - Errors compose with the [`Outcome`](crate::types::Outcome) severity lattice
//! - Panics inside sequence steps and spawned futures are isolated and
//!   converted to `Outcome::Panicked`
//! - Cancellation is a terminal outcome, not an error; [`ErrorKind::Cancelled`]
//!   only appears when an outcome is flattened into a `Result`
//!
//! # Error Categories
//!
//! - **Usage**: the caller broke a contract (double continuation registration,
//!   pumping off the affinity thread, blocking the pump on itself)
//! - **Fault**: a suspend sequence step, host instruction, or closure failed
//! - **Cancellation**: the run was cancelled or aborted
//! - **Lifecycle**: install/teardown of the affinity dispatcher
//! - **Config**: invalid configuration values
//! - **User**: caller-defined failures raised from sequence bodies

use core::fmt;
use std::sync::Arc;

use crate::types::{CancelReason, PanicPayload};

/// The kind of error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    // === Usage ===
    /// An API was used in a way its contract forbids.
    InvalidUsage,
    /// A migrating awaiter resumed on a context it cannot vouch for.
    WrongContext,

    // === Faults ===
    /// A suspend sequence step failed.
    SequenceFault,
    /// A host-native suspend instruction reported a failure.
    HostPrimitiveFailure,
    /// A closure, step, or future panicked.
    Panicked,

    // === Cancellation ===
    /// The operation was cancelled.
    Cancelled,

    // === Lifecycle ===
    /// No affinity thread has been installed.
    NotInstalled,
    /// An affinity thread is already installed on a different thread.
    AlreadyInstalled,
    /// The affinity dispatcher has shut down and accepts no more work.
    DispatcherClosed,

    // === Config ===
    /// A configuration value could not be parsed or is out of range.
    Config,

    // === User ===
    /// User-provided error.
    User,
}

impl ErrorKind {
    /// Returns the error category for this kind.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidUsage | Self::WrongContext => ErrorCategory::Usage,
            Self::SequenceFault | Self::HostPrimitiveFailure | Self::Panicked => {
                ErrorCategory::Fault
            }
            Self::Cancelled => ErrorCategory::Cancellation,
            Self::NotInstalled | Self::AlreadyInstalled | Self::DispatcherClosed => {
                ErrorCategory::Lifecycle
            }
            Self::Config => ErrorCategory::Config,
            Self::User => ErrorCategory::User,
        }
    }

    const fn describe(self) -> &'static str {
        match self {
            Self::InvalidUsage => "invalid usage",
            Self::WrongContext => "resumed on the wrong context",
            Self::SequenceFault => "sequence fault",
            Self::HostPrimitiveFailure => "host primitive failure",
            Self::Panicked => "panicked",
            Self::Cancelled => "cancelled",
            Self::NotInstalled => "affinity thread not installed",
            Self::AlreadyInstalled => "affinity thread already installed",
            Self::DispatcherClosed => "affinity dispatcher closed",
            Self::Config => "configuration error",
            Self::User => "user error",
        }
    }
}

/// High-level error category for grouping related errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Contract violations by the caller.
    Usage,
    /// Failures raised while executing user work.
    Fault,
    /// Cancellation outcomes flattened into errors.
    Cancellation,
    /// Install/teardown failures.
    Lifecycle,
    /// Configuration failures.
    Config,
    /// User-originated errors.
    User,
}

/// The main error type for affinity-bridge operations.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            source: None,
        }
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the error category.
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        self.kind.category()
    }

    /// Returns true if this error represents cancellation.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self.kind, ErrorKind::Cancelled)
    }

    /// Returns true if this error is a caller contract violation.
    #[must_use]
    pub const fn is_usage_error(&self) -> bool {
        matches!(self.kind.category(), ErrorCategory::Usage)
    }

    /// Adds a message description to the error.
    #[must_use]
    pub fn with_message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    /// Returns the error message, if any.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    /// Creates an `InvalidUsage` error with a message.
    #[must_use]
    pub fn usage(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidUsage).with_message(msg)
    }

    /// Creates a user error with a message.
    #[must_use]
    pub fn user(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::User).with_message(msg)
    }

    /// Creates a sequence fault with a message.
    #[must_use]
    pub fn fault(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::SequenceFault).with_message(msg)
    }

    /// Creates a cancellation error from a structured reason.
    #[must_use]
    pub fn cancelled(reason: &CancelReason) -> Self {
        Self::new(ErrorKind::Cancelled).with_message(format!("{reason}"))
    }

    /// Creates a panic error from a captured payload.
    #[must_use]
    pub fn panicked(payload: &PanicPayload) -> Self {
        Self::new(ErrorKind::Panicked).with_message(payload.message())
    }

    /// Wraps a failure reported by a host instruction.
    ///
    /// Errors that are already `HostPrimitiveFailure` pass through unchanged.
    #[must_use]
    pub fn host_failure(instruction: &str, cause: Self) -> Self {
        if cause.kind == ErrorKind::HostPrimitiveFailure {
            return cause;
        }
        Self::new(ErrorKind::HostPrimitiveFailure)
            .with_message(format!("host instruction `{instruction}` failed"))
            .with_source(cause)
    }

    /// Creates a `DispatcherClosed` error.
    #[must_use]
    pub fn dispatcher_closed() -> Self {
        Self::new(ErrorKind::DispatcherClosed)
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.message == other.message
    }
}

impl Eq for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.describe())?;
        if let Some(msg) = &self.message {
            write!(f, ": {msg}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl From<CancelReason> for Error {
    fn from(reason: CancelReason) -> Self {
        Self::cancelled(&reason)
    }
}

/// A specialized Result type for affinity-bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

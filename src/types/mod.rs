//! Core types shared across the crate.
//!
//! - [`id`]: Identifier types (`RunId`)
//! - [`outcome`]: Four-valued outcome type with severity lattice
//! - [`cancel`]: Cancellation reason and kind types

pub mod cancel;
pub mod id;
pub mod outcome;

pub use cancel::{CancelKind, CancelReason};
pub use id::RunId;
pub use outcome::{Outcome, OutcomeError, PanicPayload};

//! Affinity-bridge: thread-affinity dispatch for host frame loops.
//!
//! # Overview
//!
//! Many hosts (game engines, UI toolkits, embedded interpreters) own one
//! thread that certain work must run on, and drive everything from a
//! per-frame loop. This crate bridges that model and ordinary Rust code:
//!
//! - An [`AffinityToken`] identifies the affinity thread and owns its dispatch
//!   queue. The host calls [`AffinityToken::pump_one_tick`] once per frame.
//! - [`SuspendSequence`]s are explicit, resumable step functions. Nested
//!   sequences are flattened onto an explicit frame stack and stepped one tick
//!   at a time, strictly serialized on the affinity thread.
//! - Futures spawned on the token move between the affinity thread and a
//!   background [`WorkerPool`] by awaiting [`ToBackground`], [`ToAffinity`]
//!   and [`NextTick`].
//! - Every run reports through a [`CompletionHandle`] whose four-valued
//!   [`Outcome`] separates success, fault, cancellation and panic.
//!
//! # Core Guarantees
//!
//! - **Serialized sequences**: sequence steps only ever run on the affinity
//!   thread, one at a time
//! - **Stack safety**: nesting depth grows a `Vec`, never the native stack
//! - **Exactly-once continuations**: an awaiter resumes its continuation once,
//!   whichever of completion and registration happens first
//! - **Generation-stamped stop**: `stop_all` never affects runs started after it
//! - **No busy-waiting**: blocking joins park on condition variables
//!
//! # Module Structure
//!
//! - [`runtime`]: the token, its dispatcher and pump, builder and worker pool
//! - [`sequence`]: suspend sequences, the interpreter and completion handles
//! - [`awaiter`]: one-shot awaiters and the context-migrating primitives
//! - [`host`]: the host collaborator and built-in host instructions
//! - [`cancel`]: cancellation sources, tokens and the stop scope
//! - [`lifecycle`]: process-wide install and quit hooks
//! - [`types`]: identifiers, outcomes and cancellation reasons
//! - [`error`]: error types
//!
//! # Example
//!
//! ```ignore
//! use affinity_bridge::{lifecycle, host::ClockHost, sequence::{self, Step}};
//! use std::sync::Arc;
//!
//! let token = lifecycle::install()?;
//! let host = Arc::new(ClockHost::new());
//! let handle = token.start_sequence(sequence::from_fn(|_cx| Ok(Step::Return(5))), host);
//! while !handle.is_completed() {
//!     token.pump_one_tick()?;
//! }
//! assert_eq!(handle.get_result()?, 5);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]

pub mod awaiter;
pub mod cancel;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod runtime;
pub mod sequence;
pub mod tracing_compat;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;

pub use awaiter::{Awaiter, NextTick, ResumeOn, ToAffinity, ToBackground};
pub use cancel::{CancelSource, CancelToken, StopScope};
pub use error::{Error, ErrorCategory, ErrorKind, Result};
pub use host::{Frame, Host, HostInstruction};
pub use runtime::{
    AffinityBuilder, AffinityConfig, AffinityStats, AffinityToken, ConfigError, TickReport,
    WorkerPool,
};
pub use sequence::{CompletionHandle, Step, StepContext, SuspendSequence};
pub use types::{CancelKind, CancelReason, Outcome, PanicPayload, RunId};

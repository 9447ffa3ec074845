//! The host collaborator: frame clock and native suspend instructions.
//!
//! The host is whatever owns the per-frame loop (a game engine, a UI toolkit,
//! a test harness). The dispatcher only needs two things from it: the current
//! host time, and a way to ask whether a host-native suspend instruction is
//! still waiting. Both are expressed by the [`Host`] trait.

mod clock;
mod instructions;

pub use clock::{ClockHost, ManualHost};
pub use instructions::{WaitFor, WaitTicks, WaitUntil, WaitWhile};

use std::time::Duration;

use crate::error::Result;

/// A snapshot of the host loop, handed to instructions and sequence steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// Scheduler tick counter; advanced once per `pump_one_tick`.
    pub tick: u64,
    /// Host time at the start of the tick.
    pub time: Duration,
}

impl Frame {
    /// Creates a frame snapshot.
    #[must_use]
    pub const fn new(tick: u64, time: Duration) -> Self {
        Self { tick, time }
    }
}

/// A host-native suspend instruction, such as "wait N seconds".
///
/// Instructions are polled once per tick on the affinity thread until
/// [`keep_waiting`](Self::keep_waiting) returns `false`. A cancelled run
/// stops polling its instruction at the next tick, but nothing interrupts an
/// instruction mid-check; work the host started on its behalf has to observe
/// cancellation itself.
pub trait HostInstruction: Send {
    /// Returns true while the instruction is still waiting.
    fn keep_waiting(&mut self, frame: &Frame) -> Result<bool>;

    /// Short name used in logs and failure messages.
    fn name(&self) -> &str {
        "instruction"
    }
}

/// The external per-frame host.
pub trait Host: Send + Sync {
    /// Current host time.
    fn now(&self) -> Duration;

    /// Polls an outstanding instruction; returns true while it keeps waiting.
    ///
    /// Hosts with their own native scheduler may override this to resolve
    /// instructions they recognise.
    fn poll_instruction(&self, instruction: &mut dyn HostInstruction, frame: &Frame) -> Result<bool> {
        instruction.keep_waiting(frame)
    }
}

impl<F> HostInstruction for F
where
    F: FnMut(&Frame) -> Result<bool> + Send,
{
    fn keep_waiting(&mut self, frame: &Frame) -> Result<bool> {
        self(frame)
    }

    fn name(&self) -> &str {
        "closure"
    }
}

//! Built-in host instructions.

use std::fmt;
use std::time::Duration;

use super::{Frame, HostInstruction};
use crate::error::Result;

/// Waits for a number of ticks.
///
/// The tick in which the instruction is first polled counts, so
/// `WaitTicks::new(1)` resolves on its first check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTicks {
    remaining: u64,
}

impl WaitTicks {
    /// Creates an instruction that resolves after `ticks` checks.
    #[must_use]
    pub const fn new(ticks: u64) -> Self {
        Self { remaining: ticks }
    }
}

impl HostInstruction for WaitTicks {
    fn keep_waiting(&mut self, _frame: &Frame) -> Result<bool> {
        self.remaining = self.remaining.saturating_sub(1);
        Ok(self.remaining > 0)
    }

    fn name(&self) -> &str {
        "wait-ticks"
    }
}

/// Waits until `duration` of host time has passed since the first check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitFor {
    duration: Duration,
    deadline: Option<Duration>,
}

impl WaitFor {
    /// Creates an instruction waiting `duration` of host time.
    #[must_use]
    pub const fn new(duration: Duration) -> Self {
        Self {
            duration,
            deadline: None,
        }
    }
}

impl HostInstruction for WaitFor {
    fn keep_waiting(&mut self, frame: &Frame) -> Result<bool> {
        let duration = self.duration;
        let deadline = *self
            .deadline
            .get_or_insert_with(|| frame.time.saturating_add(duration));
        Ok(frame.time < deadline)
    }

    fn name(&self) -> &str {
        "wait-for"
    }
}

/// Waits until a predicate holds.
pub struct WaitUntil<P> {
    predicate: P,
}

impl<P> WaitUntil<P>
where
    P: FnMut() -> bool + Send,
{
    /// Creates an instruction resolving once `predicate` returns true.
    pub fn new(predicate: P) -> Self {
        Self { predicate }
    }
}

impl<P> HostInstruction for WaitUntil<P>
where
    P: FnMut() -> bool + Send,
{
    fn keep_waiting(&mut self, _frame: &Frame) -> Result<bool> {
        Ok(!(self.predicate)())
    }

    fn name(&self) -> &str {
        "wait-until"
    }
}

impl<P> fmt::Debug for WaitUntil<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitUntil").finish_non_exhaustive()
    }
}

/// Waits while a predicate holds.
pub struct WaitWhile<P> {
    predicate: P,
}

impl<P> WaitWhile<P>
where
    P: FnMut() -> bool + Send,
{
    /// Creates an instruction resolving once `predicate` returns false.
    pub fn new(predicate: P) -> Self {
        Self { predicate }
    }
}

impl<P> HostInstruction for WaitWhile<P>
where
    P: FnMut() -> bool + Send,
{
    fn keep_waiting(&mut self, _frame: &Frame) -> Result<bool> {
        Ok((self.predicate)())
    }

    fn name(&self) -> &str {
        "wait-while"
    }
}

impl<P> fmt::Debug for WaitWhile<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitWhile").finish_non_exhaustive()
    }
}

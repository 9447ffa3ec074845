//! Flattens nested suspend sequences onto an explicit frame stack.
//!
//! The interpreter is a trampoline: every nested call pushes a frame onto a
//! `Vec`, every return pops one, and a single loop steps whatever is on top.
//! Native stack use is constant in the nesting depth.

use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::error::Error;
use crate::host::{Frame, Host, HostInstruction};
use crate::tracing_compat::{trace, warn};
use crate::types::{CancelReason, PanicPayload};

use super::{BoxSequence, Step, StepContext};

/// Result of driving a run for one tick.
#[derive(Debug)]
pub(crate) enum Drive<T> {
    /// The sequence paused or used up its step budget.
    Paused,
    /// A host instruction is outstanding.
    Waiting,
    /// The root sequence returned.
    Completed(T),
    /// A step or instruction failed; the stack was abandoned.
    Failed(Error),
    /// A step or instruction panicked; the stack was abandoned.
    Panicked(PanicPayload),
    /// The stop check fired before a step.
    Cancelled(CancelReason),
}

pub(crate) struct Interpreter<T> {
    stack: Vec<BoxSequence<T>>,
    waiting: Option<Box<dyn HostInstruction>>,
    returned: Option<T>,
    steps: u64,
    max_depth: usize,
}

impl<T> Interpreter<T> {
    pub(crate) fn new(root: BoxSequence<T>) -> Self {
        Self {
            stack: vec![root],
            waiting: None,
            returned: None,
            steps: 0,
            max_depth: 1,
        }
    }

    /// Total steps taken so far.
    pub(crate) fn steps(&self) -> u64 {
        self.steps
    }

    /// Deepest nesting reached so far.
    pub(crate) fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Current nesting depth.
    pub(crate) fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Drives the run for one tick.
    ///
    /// `stop` is checked first; a cancelled run is not polled at all. An
    /// outstanding host instruction is polled next; while it keeps waiting no
    /// step is taken. Otherwise steps are taken until the top
    /// sequence pauses or waits, the root returns, something fails, `stop`
    /// reports a cancellation, or `budget` steps have been taken.
    pub(crate) fn drive(
        &mut self,
        host: &dyn Host,
        frame: &Frame,
        budget: usize,
        stop: &dyn Fn() -> Option<CancelReason>,
    ) -> Drive<T> {
        if let Some(reason) = stop() {
            return Drive::Cancelled(reason);
        }
        if let Some(instruction) = self.waiting.as_mut() {
            let polled = catch_unwind(AssertUnwindSafe(|| {
                host.poll_instruction(instruction.as_mut(), frame)
            }));
            match polled {
                Ok(Ok(true)) => return Drive::Waiting,
                Ok(Ok(false)) => {
                    trace!(instruction = instruction.name(), "host instruction resolved");
                    self.waiting = None;
                }
                Ok(Err(err)) => {
                    let err = Error::host_failure(instruction.name(), err);
                    self.abandon();
                    return Drive::Failed(err);
                }
                Err(payload) => {
                    self.abandon();
                    return Drive::Panicked(PanicPayload::from_any(payload.as_ref()));
                }
            }
        }

        let mut taken = 0;
        loop {
            if let Some(reason) = stop() {
                return Drive::Cancelled(reason);
            }
            if taken == budget {
                warn!(
                    budget,
                    depth = self.stack.len(),
                    "step budget exhausted; run yields until the next tick"
                );
                return Drive::Paused;
            }
            let depth = self.stack.len();
            let Some(top) = self.stack.last_mut() else {
                return Drive::Failed(Error::fault("sequence resumed after it finished"));
            };

            taken += 1;
            self.steps += 1;
            let mut cx = StepContext::new(&mut self.returned, frame, depth);
            let step = catch_unwind(AssertUnwindSafe(|| top.resume(&mut cx)));
            self.returned = None;

            match step {
                Ok(Ok(Step::Pause)) => return Drive::Paused,
                Ok(Ok(Step::Call(child))) => {
                    self.stack.push(child);
                    self.max_depth = self.max_depth.max(self.stack.len());
                }
                Ok(Ok(Step::Wait(instruction))) => {
                    trace!(instruction = instruction.name(), depth, "waiting on host instruction");
                    self.waiting = Some(instruction);
                    return Drive::Waiting;
                }
                Ok(Ok(Step::Return(value))) => {
                    self.stack.pop();
                    if self.stack.is_empty() {
                        return Drive::Completed(value);
                    }
                    self.returned = Some(value);
                }
                Ok(Err(err)) => {
                    self.abandon();
                    return Drive::Failed(err);
                }
                Err(payload) => {
                    self.abandon();
                    return Drive::Panicked(PanicPayload::from_any(payload.as_ref()));
                }
            }
        }
    }

    /// Drops every frame so nothing is stepped again.
    fn abandon(&mut self) {
        self.waiting = None;
        self.returned = None;
        // Pop one at a time so frames drop top-down, outside any recursion.
        while self.stack.pop().is_some() {}
    }
}

//! Suspend sequences: resumable step functions driven one tick at a time.
//!
//! A [`SuspendSequence`] is an explicit state machine. Each call to
//! [`resume`](SuspendSequence::resume) advances it by one step and reports
//! what happens next as a [`Step`]:
//!
//! - [`Step::Pause`]: yield to the pump; resume on the next tick.
//! - [`Step::Call`]: run a nested sequence to completion first. Its returned
//!   value is handed back through [`StepContext::take_returned`].
//! - [`Step::Wait`]: park on a host instruction until it resolves.
//! - [`Step::Return`]: finish with a value.
//!
//! Nested calls are flattened onto an explicit frame stack by the
//! interpreter, so nesting depth never consumes native stack.
//!
//! ```rust,ignore
//! use affinity_bridge::sequence::{self, Step};
//!
//! let mut count = 0;
//! let counter = sequence::from_fn(move |_cx| {
//!     count += 1;
//!     Ok(if count == 3 { Step::Return(count) } else { Step::Pause })
//! });
//! let handle = token.start_sequence(counter, host);
//! ```

pub mod completion;
pub(crate) mod interpreter;
pub(crate) mod run;

pub use completion::CompletionHandle;

use std::collections::VecDeque;
use std::fmt;
use std::marker::PhantomData;

use crate::error::Result;
use crate::host::{Frame, HostInstruction};

/// A boxed sequence producing `T`.
pub type BoxSequence<T> = Box<dyn SuspendSequence<Output = T>>;

/// What a sequence does after one step.
pub enum Step<T> {
    /// Yield to the pump and continue next tick.
    Pause,
    /// Run a nested sequence before resuming this one.
    Call(BoxSequence<T>),
    /// Wait for a host instruction to resolve before resuming.
    Wait(Box<dyn HostInstruction>),
    /// Finish with a value.
    Return(T),
}

impl<T> Step<T> {
    /// Boxes `sequence` into a nested call.
    pub fn call<S>(sequence: S) -> Self
    where
        S: SuspendSequence<Output = T> + 'static,
    {
        Self::Call(Box::new(sequence))
    }

    /// Boxes `instruction` into a host wait.
    pub fn wait<I>(instruction: I) -> Self
    where
        I: HostInstruction + 'static,
    {
        Self::Wait(Box::new(instruction))
    }
}

impl<T> fmt::Debug for Step<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pause => f.write_str("Pause"),
            Self::Call(_) => f.write_str("Call(..)"),
            Self::Wait(instruction) => write!(f, "Wait({})", instruction.name()),
            Self::Return(_) => f.write_str("Return(..)"),
        }
    }
}

/// Per-step view handed to [`SuspendSequence::resume`].
pub struct StepContext<'a, T> {
    returned: &'a mut Option<T>,
    frame: &'a Frame,
    depth: usize,
}

impl<'a, T> StepContext<'a, T> {
    pub(crate) fn new(returned: &'a mut Option<T>, frame: &'a Frame, depth: usize) -> Self {
        Self {
            returned,
            frame,
            depth,
        }
    }

    /// Takes the value returned by the nested sequence that just finished.
    ///
    /// Only available in the step immediately after the nested call returns.
    pub fn take_returned(&mut self) -> Option<T> {
        self.returned.take()
    }

    /// The current frame snapshot.
    #[must_use]
    pub fn frame(&self) -> &Frame {
        self.frame
    }

    /// The current tick.
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.frame.tick
    }

    /// Nesting depth of the sequence being stepped; the root is 1.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// A lazily evaluated, resumable computation.
///
/// Sequences are not restartable: once `resume` has returned
/// [`Step::Return`] or an error, it is never called again.
pub trait SuspendSequence: Send {
    /// The value produced when the sequence finishes.
    type Output;

    /// Advances the sequence by one step.
    fn resume(&mut self, cx: &mut StepContext<'_, Self::Output>) -> Result<Step<Self::Output>>;
}

impl<T> SuspendSequence for Box<dyn SuspendSequence<Output = T>> {
    type Output = T;

    fn resume(&mut self, cx: &mut StepContext<'_, T>) -> Result<Step<T>> {
        (**self).resume(cx)
    }
}

/// A sequence backed by a closure. See [`from_fn`].
pub struct FromFn<T, F> {
    step: F,
    _output: PhantomData<fn() -> T>,
}

/// Builds a sequence from a step closure.
pub fn from_fn<T, F>(step: F) -> FromFn<T, F>
where
    F: FnMut(&mut StepContext<'_, T>) -> Result<Step<T>> + Send,
{
    FromFn {
        step,
        _output: PhantomData,
    }
}

impl<T, F> SuspendSequence for FromFn<T, F>
where
    F: FnMut(&mut StepContext<'_, T>) -> Result<Step<T>> + Send,
{
    type Output = T;

    fn resume(&mut self, cx: &mut StepContext<'_, T>) -> Result<Step<T>> {
        (self.step)(cx)
    }
}

impl<T, F> fmt::Debug for FromFn<T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FromFn").finish_non_exhaustive()
    }
}

/// A sequence replaying a fixed list of steps. See [`from_steps`].
pub struct Steps<T> {
    steps: VecDeque<Step<T>>,
}

/// Builds a sequence that yields `steps` in order, then returns
/// `T::default()` if none of them returned.
pub fn from_steps<T, I>(steps: I) -> Steps<T>
where
    T: Default + Send,
    I: IntoIterator<Item = Step<T>>,
{
    Steps {
        steps: steps.into_iter().collect(),
    }
}

impl<T: Default + Send> SuspendSequence for Steps<T> {
    type Output = T;

    fn resume(&mut self, _cx: &mut StepContext<'_, T>) -> Result<Step<T>> {
        Ok(self.steps.pop_front().unwrap_or_else(|| Step::Return(T::default())))
    }
}

impl<T> fmt::Debug for Steps<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Steps")
            .field("remaining", &self.steps.len())
            .finish()
    }
}

/// A nested sequence that pauses `ticks` times, then returns `T::default()`.
#[must_use]
pub fn pause<T>(ticks: u64) -> BoxSequence<T>
where
    T: Default + Send + 'static,
{
    let mut remaining = ticks;
    Box::new(from_fn(move |_cx| {
        if remaining == 0 {
            return Ok(Step::Return(T::default()));
        }
        remaining -= 1;
        Ok(Step::Pause)
    }))
}

/// Adapts a host instruction into a nested sequence that waits for it and
/// then returns `T::default()`.
#[must_use]
pub fn wait<T, I>(instruction: I) -> BoxSequence<T>
where
    T: Default + Send + 'static,
    I: HostInstruction + 'static,
{
    Box::new(from_steps([Step::wait(instruction)]))
}

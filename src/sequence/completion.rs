//! Completion handles for runs and spawned tasks.
//!
//! A [`CompletionHandle`] is the consumer side of a one-shot outcome slot;
//! the matching [`Completer`] is owned by whatever produces the outcome (a
//! sequence run, a spawned task, an async dispatch). Every clone of a handle
//! observes the same run: the outcome is produced once and replayed to every
//! waiter.

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::tracing_compat::{debug, error};
use crate::types::{CancelReason, Outcome, PanicPayload, RunId};

type CompleteCallback<T> = Box<dyn FnOnce(&Outcome<T, Error>) + Send + 'static>;

struct Slot<T> {
    outcome: Option<Outcome<T, Error>>,
    wakers: Vec<Waker>,
    callbacks: Vec<CompleteCallback<T>>,
}

struct HandleState<T> {
    id: RunId,
    /// The thread that must never block on this handle.
    affinity: Option<ThreadId>,
    slot: Mutex<Slot<T>>,
    ready: Condvar,
    aborted: AtomicBool,
}

/// Creates a linked completer/handle pair for the run `id`.
pub(crate) fn channel<T>(id: RunId, affinity: Option<ThreadId>) -> (Completer<T>, CompletionHandle<T>) {
    let state = Arc::new(HandleState {
        id,
        affinity,
        slot: Mutex::new(Slot {
            outcome: None,
            wakers: Vec::new(),
            callbacks: Vec::new(),
        }),
        ready: Condvar::new(),
        aborted: AtomicBool::new(false),
    });
    (
        Completer {
            state: Some(Arc::clone(&state)),
        },
        CompletionHandle { state },
    )
}

/// The eventual outcome of a sequence run or spawned task.
///
/// The handle is also a [`Future`] resolving to the [`Outcome`]; any number
/// of clones may await it concurrently.
pub struct CompletionHandle<T> {
    state: Arc<HandleState<T>>,
}

impl<T> Clone for CompletionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: Clone> CompletionHandle<T> {
    /// Returns true once the outcome is available.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state.slot.lock().outcome.is_some()
    }

    /// Returns the outcome if available, without blocking.
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome<T, Error>> {
        self.state.slot.lock().outcome.clone()
    }

    /// Blocks until the outcome is available.
    ///
    /// Fails with `InvalidUsage` when called before completion on the
    /// affinity thread of a handle whose producer runs there (sequence runs,
    /// affinity tasks, async dispatch): it can only make progress if that
    /// thread keeps pumping. Background tasks may be waited on anywhere.
    pub fn wait(&self) -> Result<Outcome<T, Error>> {
        let mut slot = self.state.slot.lock();
        if let Some(outcome) = &slot.outcome {
            return Ok(outcome.clone());
        }
        self.refuse_affinity_block()?;
        loop {
            if let Some(outcome) = &slot.outcome {
                return Ok(outcome.clone());
            }
            self.state.ready.wait(&mut slot);
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, returning
    /// `Ok(None)`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<Outcome<T, Error>>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.state.slot.lock();
        if let Some(outcome) = &slot.outcome {
            return Ok(Some(outcome.clone()));
        }
        self.refuse_affinity_block()?;
        loop {
            if let Some(outcome) = &slot.outcome {
                return Ok(Some(outcome.clone()));
            }
            if self.state.ready.wait_until(&mut slot, deadline).timed_out() {
                return Ok(slot.outcome.clone());
            }
        }
    }

    /// Blocks for the outcome and flattens it into a `Result`.
    ///
    /// Repeated calls replay the same value or error.
    pub fn get_result(&self) -> Result<T> {
        self.wait()?.into_error_result()
    }

    /// Registers a callback invoked with the outcome.
    ///
    /// Runs on the completing thread, or immediately on the caller's thread if
    /// the outcome is already available.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Outcome<T, Error>) + Send + 'static,
    {
        let mut slot = self.state.slot.lock();
        match slot.outcome.clone() {
            Some(outcome) => {
                drop(slot);
                callback(&outcome);
            }
            None => slot.callbacks.push(Box::new(callback)),
        }
    }

    fn refuse_affinity_block(&self) -> Result<()> {
        if self.state.affinity == Some(thread::current().id()) {
            return Err(Error::usage(format!(
                "blocking on {} from the affinity thread would stall the pump",
                self.state.id
            )));
        }
        Ok(())
    }
}

impl<T> CompletionHandle<T> {
    /// Blocks until completed and moves the outcome out.
    ///
    /// For a handle that is never cloned or shared. No affinity check: the
    /// caller makes sure it is not on the thread that produces the outcome.
    pub(crate) fn wait_owned(self) -> Outcome<T, Error> {
        let mut slot = self.state.slot.lock();
        loop {
            if let Some(outcome) = slot.outcome.take() {
                return outcome;
            }
            self.state.ready.wait(&mut slot);
        }
    }

    /// Returns the id of the run behind this handle.
    #[must_use]
    pub fn id(&self) -> RunId {
        self.state.id
    }

    /// Requests that the run stop before its next step.
    ///
    /// An aborted run completes `Cancelled(Aborted)`. Aborting a completed run
    /// has no effect.
    pub fn abort(&self) {
        if !self.state.aborted.swap(true, Ordering::AcqRel) {
            debug!(run_id = ?self.state.id, "abort requested");
        }
    }

    /// Returns true if [`abort`](Self::abort) has been called.
    #[must_use]
    pub fn is_abort_requested(&self) -> bool {
        self.state.aborted.load(Ordering::Acquire)
    }
}

impl<T: Clone> Future for CompletionHandle<T> {
    type Output = Outcome<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.state.slot.lock();
        if let Some(outcome) = &slot.outcome {
            return Poll::Ready(outcome.clone());
        }
        if !slot.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            slot.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T> fmt::Debug for CompletionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("id", &self.state.id)
            .field("completed", &self.state.slot.lock().outcome.is_some())
            .field("aborted", &self.state.aborted.load(Ordering::Relaxed))
            .finish()
    }
}

/// The producer side of a [`CompletionHandle`].
///
/// Dropping a completer without completing it resolves the handle as
/// `Cancelled(Shutdown)`, so no waiter is left hanging when the dispatcher
/// discards queued work.
pub(crate) struct Completer<T> {
    state: Option<Arc<HandleState<T>>>,
}

impl<T> Completer<T> {
    /// Returns true if the consumer side asked the run to stop.
    pub(crate) fn is_aborted(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|s| s.aborted.load(Ordering::Acquire))
    }
}

impl<T> Completer<T> {
    /// Publishes the outcome to a handle read only through
    /// [`CompletionHandle::wait_owned`].
    pub(crate) fn complete_owned(mut self, outcome: Outcome<T, Error>) {
        if let Some(state) = self.state.take() {
            // The handle stays private to its single reader; nothing else waits.
            let _ = settle(&state, outcome);
        }
    }
}

impl<T: Clone> Completer<T> {
    /// Publishes the outcome and wakes every waiter.
    pub(crate) fn complete(mut self, outcome: Outcome<T, Error>) {
        if let Some(state) = self.state.take() {
            publish(&state, outcome);
        }
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        let reason = CancelReason::shutdown();
        if let Some(pending) = settle(&state, Outcome::Cancelled(reason.clone())) {
            debug!(run_id = ?state.id, "run dropped before completion");
            pending.resume(&Outcome::Cancelled(reason));
        }
    }
}

struct Pending<T> {
    wakers: Vec<Waker>,
    callbacks: Vec<CompleteCallback<T>>,
}

impl<T> Pending<T> {
    fn resume(self, outcome: &Outcome<T, Error>) {
        for waker in self.wakers {
            waker.wake();
        }
        for callback in self.callbacks {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(outcome))) {
                let payload = PanicPayload::from_any(payload.as_ref());
                error!(panic = %payload, "completion callback panicked");
            }
        }
    }
}

/// Stores the outcome unless one is already set, returning who to resume.
fn settle<T>(state: &HandleState<T>, outcome: Outcome<T, Error>) -> Option<Pending<T>> {
    let pending = {
        let mut slot = state.slot.lock();
        if slot.outcome.is_some() {
            return None;
        }
        slot.outcome = Some(outcome);
        Pending {
            wakers: std::mem::take(&mut slot.wakers),
            callbacks: std::mem::take(&mut slot.callbacks),
        }
    };
    state.ready.notify_all();
    Some(pending)
}

fn publish<T: Clone>(state: &HandleState<T>, outcome: Outcome<T, Error>) {
    let severity = outcome.severity();
    if let Some(pending) = settle(state, outcome.clone()) {
        debug!(run_id = ?state.id, severity = ?severity, "run completed");
        pending.resume(&outcome);
    }
}

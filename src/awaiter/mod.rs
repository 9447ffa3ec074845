//! One-shot awaiters and the context-migrating primitives built on them.
//!
//! An [`Awaiter`] is a single-consumer suspension point: it is completed
//! once, optionally with an error, and resumes exactly one continuation.
//! The continuation is either a callback registered with
//! [`Awaiter::on_completed`] or the waker of a task polling the awaiter as a
//! [`Future`]. Completion and registration may happen in either order; the
//! state lock orders them so the continuation always runs exactly once and
//! always after completion is visible.
//!
//! The migrating primitives ([`ToBackground`], [`ToAffinity`], [`NextTick`])
//! live in [`affinity`] and are usually created through
//! [`AffinityToken`](crate::runtime::AffinityToken).

pub mod affinity;

pub use affinity::{NextTick, ToAffinity, ToBackground};

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::runtime::token::{AffinityToken, WeakToken};
use crate::tracing_compat::{trace, warn};

/// Where a registered callback runs once the awaiter completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeOn {
    /// On whichever thread calls [`Awaiter::complete`], or on the
    /// registering thread if already completed.
    Inline,
    /// Always queued to the affinity thread, even when completed there.
    Affinity,
    /// On a worker of the token's pool. Runs inline if the completing thread
    /// already is one.
    Background,
}

type Callback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

enum Continuation {
    Empty,
    Callback(Callback),
    Waker(Waker),
    Consumed,
}

struct AwaiterInner {
    completed: bool,
    error: Option<Error>,
    continuation: Continuation,
}

struct AwaiterState {
    inner: Mutex<AwaiterInner>,
    ready: Condvar,
    resume: ResumeOn,
    token: Option<WeakToken>,
}

/// A one-shot, single-consumer suspension point.
///
/// Clones share the same state: one clone is typically handed to the
/// completing side while the other is awaited.
#[derive(Clone)]
pub struct Awaiter {
    state: Arc<AwaiterState>,
}

impl Awaiter {
    /// Creates an awaiter whose callback resumes on `resume` of `token`.
    #[must_use]
    pub fn new(token: &AffinityToken, resume: ResumeOn) -> Self {
        Self::build(resume, Some(token.downgrade()))
    }

    /// Creates an awaiter that resumes its callback inline.
    #[must_use]
    pub fn inline() -> Self {
        Self::build(ResumeOn::Inline, None)
    }

    fn build(resume: ResumeOn, token: Option<WeakToken>) -> Self {
        Self {
            state: Arc::new(AwaiterState {
                inner: Mutex::new(AwaiterInner {
                    completed: false,
                    error: None,
                    continuation: Continuation::Empty,
                }),
                ready: Condvar::new(),
                resume,
                token,
            }),
        }
    }

    /// Returns the resume target for callbacks.
    #[must_use]
    pub fn resume_on(&self) -> ResumeOn {
        self.state.resume
    }

    /// Returns true once [`complete`](Self::complete) has been called.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state.inner.lock().completed
    }

    /// Registers the continuation.
    ///
    /// If the awaiter has already completed, the callback is dispatched
    /// immediately. Registering a second continuation fails with
    /// `InvalidUsage`, whether or not the first has run.
    pub fn on_completed<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let mut inner = self.state.inner.lock();
        match inner.continuation {
            Continuation::Empty => {}
            _ => {
                return Err(Error::usage(
                    "a continuation is already registered on this awaiter",
                ))
            }
        }
        if inner.completed {
            inner.continuation = Continuation::Consumed;
            let result = outcome_of(&inner);
            drop(inner);
            self.dispatch(Box::new(callback), result);
        } else {
            inner.continuation = Continuation::Callback(Box::new(callback));
        }
        Ok(())
    }

    /// Marks the awaiter complete and resumes its continuation, if any.
    ///
    /// Completing without a continuation records the result for a later
    /// registration. A second call is ignored.
    pub fn complete(&self, result: Result<()>) {
        let continuation = {
            let mut inner = self.state.inner.lock();
            if inner.completed {
                warn!("awaiter completed twice; ignoring the second completion");
                return;
            }
            inner.completed = true;
            inner.error = result.err();
            match std::mem::replace(&mut inner.continuation, Continuation::Empty) {
                Continuation::Empty => None,
                taken => {
                    inner.continuation = Continuation::Consumed;
                    Some((taken, outcome_of(&inner)))
                }
            }
        };
        self.state.ready.notify_all();

        match continuation {
            Some((Continuation::Callback(callback), result)) => self.dispatch(callback, result),
            Some((Continuation::Waker(waker), _)) => waker.wake(),
            _ => {}
        }
    }

    /// Blocks the calling thread until completion and returns the result.
    ///
    /// Every caller observes the same carried error. Blocking the affinity
    /// thread on an awaiter that is completed by a queued job deadlocks.
    pub fn get_result(&self) -> Result<()> {
        let mut inner = self.state.inner.lock();
        while !inner.completed {
            self.state.ready.wait(&mut inner);
        }
        outcome_of(&inner)
    }

    /// Like [`get_result`](Self::get_result) but gives up after `timeout`.
    ///
    /// Returns `None` if the awaiter is still pending.
    pub fn get_result_timeout(&self, timeout: Duration) -> Option<Result<()>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.state.inner.lock();
        while !inner.completed {
            if self.state.ready.wait_until(&mut inner, deadline).timed_out() {
                return inner.completed.then(|| outcome_of(&inner));
            }
        }
        Some(outcome_of(&inner))
    }

    /// Returns the result if completed, without blocking.
    #[must_use]
    pub fn try_result(&self) -> Option<Result<()>> {
        let inner = self.state.inner.lock();
        inner.completed.then(|| outcome_of(&inner))
    }

    fn dispatch(&self, callback: Callback, result: Result<()>) {
        let token = self
            .state
            .token
            .as_ref()
            .and_then(WeakToken::upgrade)
            .filter(|token| !token.is_closed());
        match (self.state.resume, token) {
            (ResumeOn::Inline, _) => callback(result),
            (ResumeOn::Background, Some(token)) if token.worker_pool().is_current_worker() => {
                callback(result);
            }
            (ResumeOn::Affinity, Some(token)) => {
                trace!("awaiter continuation queued to the affinity thread");
                if token.dispatch_affinity(Box::new(move || callback(result))).is_err() {
                    warn!("affinity dispatcher closed; awaiter continuation dropped");
                }
            }
            (ResumeOn::Background, Some(token)) => {
                trace!("awaiter continuation handed to the worker pool");
                if token.dispatch_background(Box::new(move || callback(result))).is_err() {
                    warn!("worker pool closed; awaiter continuation dropped");
                }
            }
            (_, None) => callback(Err(Error::dispatcher_closed())),
        }
    }
}

fn outcome_of(inner: &AwaiterInner) -> Result<()> {
    inner.error.clone().map_or(Ok(()), Err)
}

impl Future for Awaiter {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.state.inner.lock();
        if inner.completed {
            return Poll::Ready(outcome_of(&inner));
        }
        match &mut inner.continuation {
            Continuation::Waker(waker) => {
                if !waker.will_wake(cx.waker()) {
                    waker.clone_from(cx.waker());
                }
            }
            Continuation::Empty => inner.continuation = Continuation::Waker(cx.waker().clone()),
            Continuation::Callback(_) | Continuation::Consumed => {
                return Poll::Ready(Err(Error::usage(
                    "awaiter polled after a callback continuation was registered",
                )));
            }
        }
        Poll::Pending
    }
}

impl fmt::Debug for Awaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.state.inner.lock();
        let continuation = match inner.continuation {
            Continuation::Empty => "empty",
            Continuation::Callback(_) => "callback",
            Continuation::Waker(_) => "waker",
            Continuation::Consumed => "consumed",
        };
        f.debug_struct("Awaiter")
            .field("resume", &self.state.resume)
            .field("completed", &inner.completed)
            .field("error", &inner.error)
            .field("continuation", &continuation)
            .finish()
    }
}

//! Context-migrating awaiters.
//!
//! Awaited inside a task spawned on the dispatcher, [`ToBackground`] and
//! [`ToAffinity`] move the rest of the task to the worker pool or the
//! affinity thread. [`NextTick`] suspends until the next pump without moving.
//!
//! Under any other executor the migration cannot be enforced: the awaiter
//! still waits for the hop, but if it resumes somewhere other than the
//! requested context it reports `WrongContext` instead of pretending.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use super::Awaiter;
use crate::error::{Error, ErrorKind, Result};
use crate::runtime::task::{self, Placement};
use crate::runtime::token::AffinityToken;
use crate::tracing_compat::trace;

enum Hop {
    Init,
    Waiting { awaiter: Awaiter, managed: bool },
    Done,
}

/// Polls the hop through its states; `arrived` decides if the resumed
/// context is the requested one.
fn poll_hop(
    hop: &mut Hop,
    cx: &mut Context<'_>,
    token: &AffinityToken,
    placement: Placement,
    arrived: impl Fn(bool) -> bool,
) -> Poll<Result<()>> {
    match hop {
        Hop::Init => {
            if token.is_closed() {
                *hop = Hop::Done;
                return Poll::Ready(Err(Error::dispatcher_closed()));
            }
            let managed = task::set_current_placement(token, placement);
            let mut awaiter = Awaiter::inline();
            // Register the waker before the hop so the wake-up always
            // observes the new placement.
            if let Poll::Ready(result) = Pin::new(&mut awaiter).poll(cx) {
                *hop = Hop::Done;
                return Poll::Ready(result);
            }
            let completer = awaiter.clone();
            let job = Box::new(move || completer.complete(Ok(())));
            let dispatched = match placement {
                Placement::Affinity => token.dispatch_affinity(job),
                Placement::Background => token.dispatch_background(job),
            };
            if let Err(err) = dispatched {
                *hop = Hop::Done;
                return Poll::Ready(Err(err));
            }
            trace!(?placement, managed, "hop requested");
            *hop = Hop::Waiting { awaiter, managed };
            Poll::Pending
        }
        Hop::Waiting { awaiter, managed } => {
            let managed = *managed;
            let result = match Pin::new(awaiter).poll(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(result) => result,
            };
            *hop = Hop::Done;
            result?;
            if arrived(managed) {
                return Poll::Ready(Ok(()));
            }
            Poll::Ready(Err(Error::new(ErrorKind::WrongContext).with_message(format!(
                "expected to resume on {placement:?} but the awaiting executor did not move"
            ))))
        }
        Hop::Done => Poll::Ready(Err(Error::usage(
            "migrating awaiter polled after completion",
        ))),
    }
}

/// Moves the awaiting task to a pool worker.
///
/// Created by [`AffinityToken::to_background`].
#[must_use = "futures do nothing unless awaited"]
pub struct ToBackground {
    token: AffinityToken,
    hop: Hop,
}

impl ToBackground {
    pub(crate) fn new(token: AffinityToken) -> Self {
        Self {
            token,
            hop: Hop::Init,
        }
    }
}

impl Future for ToBackground {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let token = &this.token;
        poll_hop(&mut this.hop, cx, token, Placement::Background, |managed| {
            !token.is_affinity_thread() && (!managed || token.worker_pool().is_current_worker())
        })
    }
}

impl std::fmt::Debug for ToBackground {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToBackground").finish_non_exhaustive()
    }
}

/// Moves the awaiting task to the affinity thread.
///
/// The hop always goes through the dispatch queue, even when the task is
/// already on the affinity thread, so awaiting it yields to the pump.
/// Created by [`AffinityToken::to_affinity`].
#[must_use = "futures do nothing unless awaited"]
pub struct ToAffinity {
    token: AffinityToken,
    hop: Hop,
}

impl ToAffinity {
    pub(crate) fn new(token: AffinityToken) -> Self {
        Self {
            token,
            hop: Hop::Init,
        }
    }
}

impl Future for ToAffinity {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let token = &this.token;
        poll_hop(&mut this.hop, cx, token, Placement::Affinity, |_| {
            token.is_affinity_thread()
        })
    }
}

impl std::fmt::Debug for ToAffinity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToAffinity").finish_non_exhaustive()
    }
}

/// Suspends the awaiting task until the start of the next tick.
///
/// The task stays where it is; only the timing changes.
#[must_use = "futures do nothing unless awaited"]
pub struct NextTick {
    token: AffinityToken,
    awaiter: Option<Awaiter>,
}

impl NextTick {
    pub(crate) fn new(token: AffinityToken) -> Self {
        Self {
            token,
            awaiter: None,
        }
    }
}

impl Future for NextTick {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if let Some(awaiter) = this.awaiter.as_mut() {
            return Pin::new(awaiter).poll(cx);
        }
        let mut awaiter = Awaiter::inline();
        if let Poll::Ready(result) = Pin::new(&mut awaiter).poll(cx) {
            return Poll::Ready(result);
        }
        this.token.register_tick_waiter(awaiter.clone())?;
        this.awaiter = Some(awaiter);
        Poll::Pending
    }
}

impl std::fmt::Debug for NextTick {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NextTick")
            .field("registered", &self.awaiter.is_some())
            .finish()
    }
}

//! Futures spawned onto the dispatcher.
//!
//! A task is polled either by an affinity-thread job or by a pool worker,
//! depending on its current placement. The migrating awaiters flip the
//! placement of the task that polls them; the next wake-up then schedules
//! the task on the other side.

use parking_lot::Mutex;
use std::cell::RefCell;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};

use crate::runtime::token::{AffinityToken, WeakToken};
use crate::sequence::completion::{self, Completer, CompletionHandle};
use crate::tracing_compat::{trace, warn};
use crate::types::{CancelReason, Outcome, PanicPayload, RunId};

/// Which side of the dispatcher polls a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Placement {
    Affinity = 0,
    Background = 1,
}

impl Placement {
    fn from_u8(value: u8) -> Self {
        if value == Self::Background as u8 {
            Self::Background
        } else {
            Self::Affinity
        }
    }
}

type BoxTaskFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Task {
    id: RunId,
    future: Mutex<Option<BoxTaskFuture>>,
    placement: AtomicU8,
    scheduled: AtomicBool,
    token: WeakToken,
}

thread_local! {
    static CURRENT_TASK: RefCell<Option<Arc<Task>>> = const { RefCell::new(None) };
}

/// Spawns `future` with the given initial placement.
pub(crate) fn spawn<F>(token: &AffinityToken, future: F, placement: Placement) -> CompletionHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Clone + Send + 'static,
{
    let id = RunId::next();
    // Only a task that starts on the affinity thread needs the pump to finish.
    let pumped_by = match placement {
        Placement::Affinity => Some(token.thread_id()),
        Placement::Background => None,
    };
    let (completer, handle) = completion::channel(id, pumped_by);
    let task = Arc::new(Task {
        id,
        future: Mutex::new(Some(Box::pin(TaskFuture {
            future: Box::pin(future),
            completer: Some(completer),
        }))),
        placement: AtomicU8::new(placement as u8),
        scheduled: AtomicBool::new(false),
        token: token.downgrade(),
    });
    trace!(task_id = ?id, ?placement, "task spawned");
    task.schedule();
    handle
}

/// Moves the task currently being polled on this thread to `placement`.
///
/// Returns false if no task of `token` is being polled here, e.g. when a
/// migrating awaiter is polled by a foreign executor.
pub(crate) fn set_current_placement(token: &AffinityToken, placement: Placement) -> bool {
    CURRENT_TASK.with(|current| match current.borrow().as_ref() {
        Some(task) if task.token.points_to(token) => {
            task.placement.store(placement as u8, Ordering::Release);
            true
        }
        _ => false,
    })
}

impl Task {
    fn schedule(self: &Arc<Self>) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(token) = self.token.upgrade() else {
            trace!(task_id = ?self.id, "task woken after its dispatcher was dropped");
            return;
        };
        let task = Arc::clone(self);
        let job = Box::new(move || task.run());
        let placement = Placement::from_u8(self.placement.load(Ordering::Acquire));
        let scheduled = match placement {
            Placement::Affinity => token.dispatch_affinity(job),
            Placement::Background => token.dispatch_background(job),
        };
        if let Err(err) = scheduled {
            warn!(task_id = ?self.id, ?placement, error = %err, "task could not be scheduled");
        }
    }

    fn run(self: Arc<Self>) {
        self.scheduled.store(false, Ordering::Release);
        let waker = Waker::from(Arc::clone(&self));
        let mut cx = Context::from_waker(&waker);

        let mut slot = self.future.lock();
        let Some(future) = slot.as_mut() else {
            return;
        };
        let previous = CURRENT_TASK.with(|current| current.replace(Some(Arc::clone(&self))));
        let poll = future.as_mut().poll(&mut cx);
        CURRENT_TASK.with(|current| *current.borrow_mut() = previous);
        if poll.is_ready() {
            trace!(task_id = ?self.id, "task finished");
            *slot = None;
        }
    }
}

impl Wake for Task {
    fn wake(self: Arc<Self>) {
        self.schedule();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.schedule();
    }
}

/// Adapts a user future: checks for abort before each poll, captures panics,
/// and publishes the outcome.
struct TaskFuture<F: Future> {
    future: Pin<Box<F>>,
    completer: Option<Completer<F::Output>>,
}

impl<F> Future for TaskFuture<F>
where
    F: Future,
    F::Output: Clone,
{
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = &mut *self;
        let Some(completer) = this.completer.as_ref() else {
            return Poll::Ready(());
        };
        if completer.is_aborted() {
            if let Some(completer) = this.completer.take() {
                completer.complete(Outcome::Cancelled(CancelReason::aborted()));
            }
            return Poll::Ready(());
        }

        let outcome = match catch_unwind(AssertUnwindSafe(|| this.future.as_mut().poll(cx))) {
            Ok(Poll::Pending) => return Poll::Pending,
            Ok(Poll::Ready(value)) => Outcome::Ok(value),
            Err(payload) => Outcome::Panicked(PanicPayload::from_any(payload.as_ref())),
        };
        if let Some(completer) = this.completer.take() {
            completer.complete(outcome);
        }
        Poll::Ready(())
    }
}

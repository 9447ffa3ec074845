//! The affinity token: identity of the affinity thread and its dispatcher.
//!
//! An [`AffinityToken`] is created on the thread that becomes the affinity
//! thread. It owns that thread's dispatch queue, the table of active sequence
//! runs, the background [`WorkerPool`], and the rotating [`StopScope`].
//!
//! The host loop drives the dispatcher by calling
//! [`pump_one_tick`](AffinityToken::pump_one_tick) once per frame on the
//! affinity thread. Each tick:
//!
//! 1. advances the tick counter and resumes every `next_tick` waiter that was
//!    registered before the tick began,
//! 2. runs posted jobs, up to `poll_budget` (jobs posted while draining count),
//! 3. drives every active sequence run once.
//!
//! Everything else on the token may be called from any thread.

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::awaiter::{Awaiter, NextTick, ToAffinity, ToBackground};
use crate::cancel::{CancelToken, StopScope};
use crate::error::{Error, Result};
use crate::host::Host;
use crate::runtime::config::AffinityConfig;
use crate::runtime::task::{self, Placement};
use crate::runtime::worker_pool::{PoolJob, WorkerPool};
use crate::sequence::completion::{self, CompletionHandle};
use crate::sequence::run::{PumpedRun, SequenceRun};
use crate::sequence::SuspendSequence;
use crate::tracing_compat::{debug, error, trace};
use crate::types::{CancelReason, Outcome, PanicPayload, RunId};

/// Work queued for the affinity thread.
pub(crate) enum Job {
    /// Run a closure.
    Call(PoolJob),
    /// Add a sequence run to the run table.
    Adopt(Box<dyn PumpedRun>),
}

/// A snapshot of dispatcher counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AffinityStats {
    /// Ticks pumped so far.
    pub tick: u64,
    /// Jobs queued to the affinity thread.
    pub jobs_posted: u64,
    /// Jobs the pump has taken off the queue.
    pub jobs_run: u64,
    /// Sequence runs adopted into the run table.
    pub runs_started: u64,
    /// Sequence runs that left the run table.
    pub runs_finished: u64,
    /// Runs currently in the run table.
    pub active_runs: usize,
    /// `next_tick` waiters not yet resumed.
    pub pending_tick_waiters: usize,
    /// Current stop-all generation.
    pub stop_generation: u64,
    /// Live worker threads.
    pub worker_threads: usize,
}

/// What one call to [`AffinityToken::pump_one_tick`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// The tick number just pumped.
    pub tick: u64,
    /// `next_tick` waiters resumed.
    pub woken: usize,
    /// Jobs taken off the queue.
    pub jobs_run: usize,
    /// Runs driven.
    pub runs_pumped: usize,
    /// Runs that finished this tick.
    pub runs_finished: usize,
}

// Field order is drop order: queued work is released before the pool.
struct TokenInner {
    thread: ThreadId,
    thread_name: Option<String>,
    config: AffinityConfig,
    jobs: SegQueue<Job>,
    runs: Mutex<Vec<Box<dyn PumpedRun>>>,
    tick_waiters: Mutex<Vec<Awaiter>>,
    pool: WorkerPool,
    scope: StopScope,
    tick: AtomicU64,
    closed: AtomicBool,
    pumping: AtomicBool,
    posted: Mutex<bool>,
    posted_cv: Condvar,
    jobs_posted: AtomicU64,
    jobs_run: AtomicU64,
    runs_started: AtomicU64,
    runs_finished: AtomicU64,
    active_runs: AtomicUsize,
}

/// Handle to the affinity thread and its dispatcher.
///
/// Cloning is cheap; every clone refers to the same dispatcher.
#[derive(Clone)]
pub struct AffinityToken {
    inner: Arc<TokenInner>,
}

/// A non-owning reference to a token, held by awaiters and tasks.
#[derive(Clone)]
pub(crate) struct WeakToken {
    inner: Weak<TokenInner>,
}

impl WeakToken {
    pub(crate) fn upgrade(&self) -> Option<AffinityToken> {
        self.inner.upgrade().map(|inner| AffinityToken { inner })
    }

    pub(crate) fn points_to(&self, token: &AffinityToken) -> bool {
        std::ptr::eq(self.inner.as_ptr(), Arc::as_ptr(&token.inner))
    }
}

impl AffinityToken {
    /// Binds a new dispatcher to the calling thread.
    pub(crate) fn bind_current(mut config: AffinityConfig) -> Self {
        config.normalize();
        let current = thread::current();
        let pool = WorkerPool::new(&config.worker, &config.thread_name_prefix);
        let token = Self {
            inner: Arc::new(TokenInner {
                thread: current.id(),
                thread_name: current.name().map(str::to_string),
                config,
                jobs: SegQueue::new(),
                runs: Mutex::new(Vec::new()),
                tick_waiters: Mutex::new(Vec::new()),
                pool,
                scope: StopScope::new(),
                tick: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                pumping: AtomicBool::new(false),
                posted: Mutex::new(false),
                posted_cv: Condvar::new(),
                jobs_posted: AtomicU64::new(0),
                jobs_run: AtomicU64::new(0),
                runs_started: AtomicU64::new(0),
                runs_finished: AtomicU64::new(0),
                active_runs: AtomicUsize::new(0),
            }),
        };
        debug!(
            thread = ?token.inner.thread,
            name = ?token.inner.thread_name,
            "affinity thread bound"
        );
        token
    }

    pub(crate) fn downgrade(&self) -> WeakToken {
        WeakToken {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The affinity thread's id.
    #[must_use]
    pub fn thread_id(&self) -> ThreadId {
        self.inner.thread
    }

    /// Returns true if the calling thread is the affinity thread.
    ///
    /// A plain thread-id comparison; never blocks.
    #[must_use]
    pub fn is_affinity_thread(&self) -> bool {
        thread::current().id() == self.inner.thread
    }

    /// The normalized configuration this token was built with.
    #[must_use]
    pub fn config(&self) -> &AffinityConfig {
        &self.inner.config
    }

    /// The background worker pool.
    #[must_use]
    pub fn worker_pool(&self) -> &WorkerPool {
        &self.inner.pool
    }

    /// Returns true once [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Returns true if both handles refer to the same dispatcher.
    #[must_use]
    pub fn same_dispatcher(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // === Dispatch ===

    /// Queues `f` to run on the affinity thread during a later pump.
    ///
    /// Never runs `f` inline, even on the affinity thread. Safe to call from
    /// any number of threads concurrently.
    pub fn post<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatch_affinity(Box::new(f))
    }

    pub(crate) fn dispatch_affinity(&self, job: PoolJob) -> Result<()> {
        self.push_job(Job::Call(job))
    }

    pub(crate) fn dispatch_background(&self, job: PoolJob) -> Result<()> {
        self.inner
            .pool
            .try_spawn(job)
            .map_err(|_| Error::dispatcher_closed().with_message("worker pool is shut down"))
    }

    fn push_job(&self, job: Job) -> Result<()> {
        let inner = &*self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(Error::dispatcher_closed());
        }
        inner.jobs.push(job);
        inner.jobs_posted.fetch_add(1, Ordering::Relaxed);
        if inner.closed.load(Ordering::Acquire) {
            // Raced with shutdown; release whatever is still queued.
            self.discard_queued();
            return Err(Error::dispatcher_closed());
        }
        {
            let mut posted = inner.posted.lock();
            *posted = true;
        }
        inner.posted_cv.notify_one();
        Ok(())
    }

    fn discard_queued(&self) {
        let mut dropped = 0usize;
        while let Some(job) = self.inner.jobs.pop() {
            drop(job);
            dropped += 1;
        }
        if dropped > 0 {
            debug!(dropped, "discarded queued affinity jobs");
        }
    }

    /// Runs `f` on the affinity thread and returns its value.
    ///
    /// On the affinity thread `f` runs inline with no queue hop. From any
    /// other thread it is posted and the caller blocks until it has run; a
    /// panic in `f` is resumed on the calling thread with the same message.
    /// Fails with
    /// `DispatcherClosed` if the dispatcher shuts down first.
    pub fn run_on_affinity<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_affinity_thread() {
            trace!("run_on_affinity inline");
            return Ok(f());
        }

        let (completer, handle) = completion::channel(RunId::next(), None);
        self.post(move || {
            let outcome = match catch_unwind(AssertUnwindSafe(f)) {
                Ok(value) => Outcome::Ok(value),
                Err(payload) => Outcome::Panicked(PanicPayload::from_any(payload.as_ref())),
            };
            completer.complete_owned(outcome);
        })?;
        trace!(run_id = ?handle.id(), "run_on_affinity posted; blocking caller");
        match handle.wait_owned() {
            Outcome::Ok(value) => Ok(value),
            Outcome::Err(err) => Err(err),
            Outcome::Panicked(payload) => resume_unwind(Box::new(payload.message().to_string())),
            // The job was dropped unrun: the dispatcher shut down.
            Outcome::Cancelled(_) => Err(Error::dispatcher_closed()),
        }
    }

    /// Runs `f` on the affinity thread and returns a handle to its value.
    ///
    /// On the affinity thread `f` runs inline and the returned handle is
    /// already complete. A panic in `f` completes the handle as `Panicked`.
    pub fn run_on_affinity_async<F, T>(&self, f: F) -> CompletionHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Clone + Send + 'static,
    {
        let (completer, handle) = completion::channel(RunId::next(), Some(self.thread_id()));
        let job = move || {
            let outcome = match catch_unwind(AssertUnwindSafe(f)) {
                Ok(value) => Outcome::Ok(value),
                Err(payload) => Outcome::Panicked(PanicPayload::from_any(payload.as_ref())),
            };
            completer.complete(outcome);
        };
        if self.is_affinity_thread() {
            job();
        } else if self.post(job).is_err() {
            trace!(run_id = ?handle.id(), "run_on_affinity_async rejected; dispatcher closed");
        }
        handle
    }

    // === Sequences ===

    /// Starts `sequence` on the affinity thread under the current stop scope.
    ///
    /// Returns immediately; the run is adopted and stepped by later pumps.
    /// [`stop_all`](Self::stop_all) cancels it.
    pub fn start_sequence<S>(&self, sequence: S, host: Arc<dyn Host>) -> CompletionHandle<S::Output>
    where
        S: SuspendSequence + 'static,
        S::Output: Clone + Send + 'static,
    {
        let cancel = self.inner.scope.current_token();
        self.submit_run(Box::new(sequence), host, cancel)
    }

    /// Starts `sequence` under an explicit cancellation token.
    ///
    /// The run stops before its next step once `cancel` fires. It is not
    /// affected by [`stop_all`](Self::stop_all). A token that is already
    /// cancelled completes the handle immediately without queueing anything.
    pub fn start_cancelable_sequence<S>(
        &self,
        sequence: S,
        host: Arc<dyn Host>,
        cancel: CancelToken,
    ) -> CompletionHandle<S::Output>
    where
        S: SuspendSequence + 'static,
        S::Output: Clone + Send + 'static,
    {
        self.submit_run(Box::new(sequence), host, cancel)
    }

    /// Starts `sequence` and invokes `on_complete` with its outcome on the
    /// affinity thread.
    pub fn run_hosted<S, F>(
        &self,
        sequence: S,
        host: Arc<dyn Host>,
        on_complete: F,
    ) -> CompletionHandle<S::Output>
    where
        S: SuspendSequence + 'static,
        S::Output: Clone + Send + 'static,
        F: FnOnce(Outcome<S::Output, Error>) + Send + 'static,
    {
        let handle = self.start_sequence(sequence, host);
        let token = self.downgrade();
        handle.on_complete(move |outcome| {
            let outcome = outcome.clone();
            match token.upgrade() {
                Some(token) if !token.is_affinity_thread() => {
                    let slot = Arc::new(Mutex::new(Some((on_complete, outcome))));
                    let queued = Arc::clone(&slot);
                    let posted = token.post(move || {
                        if let Some((callback, outcome)) = queued.lock().take() {
                            callback(outcome);
                        }
                    });
                    if posted.is_err() {
                        if let Some((callback, outcome)) = slot.lock().take() {
                            callback(outcome);
                        }
                    }
                }
                _ => on_complete(outcome),
            }
        });
        handle
    }

    fn submit_run<T>(
        &self,
        sequence: Box<dyn SuspendSequence<Output = T>>,
        host: Arc<dyn Host>,
        cancel: CancelToken,
    ) -> CompletionHandle<T>
    where
        T: Clone + Send + 'static,
    {
        let id = RunId::next();
        let (completer, handle) = completion::channel(id, Some(self.thread_id()));
        if let Some(reason) = cancel.reason() {
            debug!(run_id = ?id, %reason, "run cancelled before start");
            completer.complete(Outcome::Cancelled(reason));
            return handle;
        }
        let run = SequenceRun::new(id, sequence, host, cancel, completer);
        match self.push_job(Job::Adopt(Box::new(run))) {
            Ok(()) => debug!(run_id = ?id, generation = self.stop_generation(), "run submitted"),
            Err(_) => debug!(run_id = ?id, "run rejected; dispatcher closed"),
        }
        handle
    }

    /// Cancels every run started without an explicit token.
    ///
    /// Runs started afterwards belong to the next generation and are not
    /// affected. Returns the new generation.
    #[allow(clippy::must_use_candidate)]
    pub fn stop_all(&self) -> u64 {
        self.inner.scope.stop_all()
    }

    /// The current stop-all generation.
    #[must_use]
    pub fn stop_generation(&self) -> u64 {
        self.inner.scope.generation()
    }

    // === Tasks ===

    /// Spawns `future` as a task that starts on the affinity thread.
    ///
    /// The task follows `to_background` / `to_affinity` migrations.
    pub fn spawn<F>(&self, future: F) -> CompletionHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Clone + Send + 'static,
    {
        task::spawn(self, future, Placement::Affinity)
    }

    /// Spawns `future` as a task that starts on the worker pool.
    pub fn spawn_background<F>(&self, future: F) -> CompletionHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Clone + Send + 'static,
    {
        task::spawn(self, future, Placement::Background)
    }

    /// Moves the awaiting task to a worker thread.
    #[must_use]
    pub fn to_background(&self) -> ToBackground {
        ToBackground::new(self.clone())
    }

    /// Moves the awaiting task to the affinity thread, always through the
    /// dispatch queue.
    #[must_use]
    pub fn to_affinity(&self) -> ToAffinity {
        ToAffinity::new(self.clone())
    }

    /// Suspends the awaiting task until the next tick, without moving it.
    #[must_use]
    pub fn next_tick(&self) -> NextTick {
        NextTick::new(self.clone())
    }

    pub(crate) fn register_tick_waiter(&self, awaiter: Awaiter) -> Result<()> {
        if self.is_closed() {
            return Err(Error::dispatcher_closed());
        }
        self.inner.tick_waiters.lock().push(awaiter);
        if self.is_closed() {
            self.release_tick_waiters();
        }
        Ok(())
    }

    fn release_tick_waiters(&self) {
        let waiters = std::mem::take(&mut *self.inner.tick_waiters.lock());
        for waiter in waiters {
            waiter.complete(Err(Error::dispatcher_closed()));
        }
    }

    // === Pump ===

    /// Pumps one scheduler tick. Must be called on the affinity thread.
    ///
    /// Fails with `InvalidUsage` off the affinity thread or when called from
    /// inside a tick.
    pub fn pump_one_tick(&self) -> Result<TickReport> {
        if !self.is_affinity_thread() {
            return Err(Error::usage(
                "pump_one_tick must be called on the affinity thread",
            ));
        }
        let inner = &*self.inner;
        if inner.pumping.swap(true, Ordering::AcqRel) {
            return Err(Error::usage("pump_one_tick is not reentrant"));
        }
        let _pumping = PumpingGuard(&inner.pumping);

        let tick = inner.tick.fetch_add(1, Ordering::AcqRel) + 1;

        let waiters = std::mem::take(&mut *inner.tick_waiters.lock());
        let woken = waiters.len();
        for waiter in waiters {
            waiter.complete(Ok(()));
        }

        let mut adopted = Vec::new();
        let mut jobs_run = 0;
        while jobs_run < inner.config.poll_budget {
            let Some(job) = inner.jobs.pop() else {
                break;
            };
            jobs_run += 1;
            match job {
                Job::Call(f) => {
                    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
                        let payload = PanicPayload::from_any(payload.as_ref());
                        error!(tick, panic = %payload, "affinity job panicked");
                    }
                }
                Job::Adopt(run) => {
                    trace!(tick, run_id = ?run.id(), "run adopted");
                    adopted.push(run);
                }
            }
        }
        inner.jobs_run.fetch_add(jobs_run as u64, Ordering::Relaxed);
        inner
            .runs_started
            .fetch_add(adopted.len() as u64, Ordering::Relaxed);

        let mut runs = std::mem::take(&mut *inner.runs.lock());
        runs.append(&mut adopted);
        let runs_pumped = runs.len();
        let step_budget = inner.config.step_budget;
        let mut still_running = Vec::with_capacity(runs.len());
        for mut run in runs {
            if pump_isolated(run.as_mut(), tick, step_budget) {
                release_isolated(run);
            } else {
                still_running.push(run);
            }
        }
        let mut runs = still_running;
        let mut runs_finished = runs_pumped - runs.len();

        {
            let mut table = inner.runs.lock();
            runs.append(&mut table);
            if self.is_closed() {
                runs_finished += runs.len();
                for run in &mut runs {
                    run.cancel(CancelReason::shutdown());
                }
                runs.clear();
            }
            inner.active_runs.store(runs.len(), Ordering::Relaxed);
            *table = runs;
        }
        inner
            .runs_finished
            .fetch_add(runs_finished as u64, Ordering::Relaxed);

        trace!(tick, woken, jobs_run, runs_pumped, runs_finished, "tick pumped");
        Ok(TickReport {
            tick,
            woken,
            jobs_run,
            runs_pumped,
            runs_finished,
        })
    }

    /// Parks the calling thread until a job is posted or `timeout` elapses.
    ///
    /// Returns true if a job was posted. Lets an idle host loop sleep instead
    /// of spinning between ticks.
    pub fn park_until_posted(&self, timeout: Duration) -> bool {
        let inner = &*self.inner;
        let mut posted = inner.posted.lock();
        if !*posted && inner.jobs.is_empty() && !self.is_closed() {
            let _ = inner.posted_cv.wait_for(&mut posted, timeout);
        }
        std::mem::replace(&mut *posted, false)
    }

    /// Returns a snapshot of dispatcher counters.
    #[must_use]
    pub fn stats(&self) -> AffinityStats {
        let inner = &*self.inner;
        AffinityStats {
            tick: inner.tick.load(Ordering::Acquire),
            jobs_posted: inner.jobs_posted.load(Ordering::Relaxed),
            jobs_run: inner.jobs_run.load(Ordering::Relaxed),
            runs_started: inner.runs_started.load(Ordering::Relaxed),
            runs_finished: inner.runs_finished.load(Ordering::Relaxed),
            active_runs: inner.active_runs.load(Ordering::Relaxed),
            pending_tick_waiters: inner.tick_waiters.lock().len(),
            stop_generation: inner.scope.generation(),
            worker_threads: inner.pool.active_threads(),
        }
    }

    /// Shuts the dispatcher down.
    ///
    /// Active runs complete `Cancelled(Shutdown)`, queued jobs are dropped
    /// (blocked `run_on_affinity` callers get `DispatcherClosed`), pending
    /// `next_tick` waiters resume with `DispatcherClosed`, and the worker
    /// pool stops accepting work. Idempotent.
    pub fn shutdown(&self) {
        let inner = &*self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(tick = inner.tick.load(Ordering::Relaxed), "affinity dispatcher shutting down");

        self.discard_queued();
        let runs = std::mem::take(&mut *inner.runs.lock());
        inner.active_runs.store(0, Ordering::Relaxed);
        inner
            .runs_finished
            .fetch_add(runs.len() as u64, Ordering::Relaxed);
        for mut run in runs {
            run.cancel(CancelReason::shutdown());
        }
        self.release_tick_waiters();
        inner.pool.shutdown();

        {
            let mut posted = inner.posted.lock();
            *posted = true;
        }
        inner.posted_cv.notify_all();
    }

    /// Shuts the dispatcher down and waits up to `timeout` for the worker
    /// threads to exit.
    ///
    /// Returns true if every worker exited in time. Called on a worker of this
    /// token's pool it cannot wait for itself and returns false.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shutdown();
        self.inner.pool.shutdown_and_wait(timeout)
    }
}

/// Clears the pumping flag when a tick ends, including by unwinding.
struct PumpingGuard<'a>(&'a AtomicBool);

impl Drop for PumpingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Pumps one run, confining a panic to that run.
///
/// Returns true once the run has finished, including by panicking.
fn pump_isolated(run: &mut dyn PumpedRun, tick: u64, step_budget: usize) -> bool {
    match catch_unwind(AssertUnwindSafe(|| run.pump(tick, step_budget))) {
        Ok(finished) => finished,
        Err(payload) => {
            let payload = PanicPayload::from_any(payload.as_ref());
            error!(tick, run_id = ?run.id(), panic = %payload, "sequence run panicked outside a step");
            if catch_unwind(AssertUnwindSafe(|| run.panicked(payload))).is_err() {
                error!(tick, run_id = ?run.id(), "completing a panicked run panicked");
            }
            true
        }
    }
}

/// Drops a finished run; a panicking frame destructor is logged and contained.
fn release_isolated(run: Box<dyn PumpedRun>) {
    let id = run.id();
    if let Err(payload) = catch_unwind(AssertUnwindSafe(move || drop(run))) {
        let payload = PanicPayload::from_any(payload.as_ref());
        error!(run_id = ?id, panic = %payload, "dropping a finished run panicked");
    }
}

impl fmt::Debug for AffinityToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AffinityToken")
            .field("thread", &self.inner.thread)
            .field("thread_name", &self.inner.thread_name)
            .field("tick", &self.inner.tick.load(Ordering::Relaxed))
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSource;
    use crate::error::ErrorKind;
    use crate::host::ManualHost;
    use crate::sequence::{from_fn, Step, StepContext};
    use crate::test_utils::{init_test_logging, pump_ticks, pump_until, test_token, DEFAULT_MAX_TICKS};
    use crate::types::CancelKind;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn manual_host() -> Arc<dyn Host> {
        Arc::new(ManualHost::new())
    }

    /// Pauses `pauses` times, then returns how many steps it took.
    fn pausing(pauses: u32) -> impl SuspendSequence<Output = u32> {
        let mut steps = 0;
        from_fn(move |_cx: &mut StepContext<'_, u32>| {
            steps += 1;
            if steps > pauses {
                Ok(Step::Return(steps))
            } else {
                Ok(Step::Pause)
            }
        })
    }

    #[test]
    fn pump_refuses_foreign_threads() {
        init_test_logging();
        let token = test_token();
        let remote = token.clone();
        let err = thread::spawn(move || remote.pump_one_tick())
            .join()
            .expect("thread")
            .expect_err("off the affinity thread");
        assert_eq!(err.kind(), ErrorKind::InvalidUsage);
    }

    #[test]
    fn pump_is_not_reentrant() {
        init_test_logging();
        let token = test_token();
        let inner = token.clone();
        let (tx, rx) = mpsc::channel();
        token
            .post(move || {
                let kind = inner.pump_one_tick().map(|_| ()).map_err(|e| e.kind());
                tx.send(kind).expect("send");
            })
            .expect("post");
        pump_ticks(&token, 1);
        assert_eq!(rx.recv().expect("job ran"), Err(ErrorKind::InvalidUsage));
    }

    #[test]
    fn run_on_affinity_inline_has_no_hop() {
        init_test_logging();
        crate::test_phase!("run_on_affinity_inline_has_no_hop");
        let token = test_token();
        let before = token.stats().jobs_posted;
        let value = token.run_on_affinity(|| 41 + 1).expect("inline");
        assert_eq!(value, 42);
        crate::assert_with_log!(
            token.stats().jobs_posted == before,
            "no job queued for an inline call",
            before,
            token.stats().jobs_posted
        );
        crate::test_complete!("run_on_affinity_inline_has_no_hop");
    }

    #[test]
    fn run_on_affinity_from_a_worker_is_one_hop() {
        init_test_logging();
        let token = test_token();
        let affinity = thread::current().id();
        let remote = token.clone();
        let caller = thread::spawn(move || remote.run_on_affinity(move || thread::current().id() == affinity));

        pump_until(&token, DEFAULT_MAX_TICKS, || caller.is_finished());
        let ran_on_affinity = caller.join().expect("caller").expect("dispatched");
        assert!(ran_on_affinity);
        assert_eq!(token.stats().jobs_posted, 1);
        assert_eq!(token.stats().jobs_run, 1);
    }

    #[test]
    fn run_on_affinity_resumes_panics_in_the_caller() {
        init_test_logging();
        let token = test_token();
        let remote = token.clone();
        let caller = thread::spawn(move || {
            let _ = remote.run_on_affinity(|| -> u8 { panic!("affinity job exploded") });
        });

        pump_until(&token, DEFAULT_MAX_TICKS, || caller.is_finished());
        let payload = caller.join().expect_err("panic crosses back");
        assert_eq!(PanicPayload::from_any(payload.as_ref()).message(), "affinity job exploded");
    }

    #[test]
    fn run_on_affinity_async_captures_panics() {
        init_test_logging();
        let token = test_token();
        let ok = token.run_on_affinity_async(|| 5u8);
        assert!(ok.is_completed(), "inline on the affinity thread");
        crate::assert_outcome_ok!(ok.outcome().expect("completed"), 5);

        let remote = token.clone();
        let failed = thread::spawn(move || remote.run_on_affinity_async(|| -> u8 { panic!("async boom") }))
            .join()
            .expect("thread");
        pump_until(&token, DEFAULT_MAX_TICKS, || failed.is_completed());
        crate::assert_outcome_panicked!(failed.outcome().expect("completed"));
    }

    #[test]
    fn shutdown_releases_blocked_callers() {
        init_test_logging();
        let token = test_token();
        let remote = token.clone();
        let caller = thread::spawn(move || remote.run_on_affinity(|| 1u8));
        while token.stats().jobs_posted == 0 && !caller.is_finished() {
            thread::sleep(Duration::from_millis(1));
        }
        token.shutdown();

        let err = caller.join().expect("caller").expect_err("released");
        assert_eq!(err.kind(), ErrorKind::DispatcherClosed);
        assert_eq!(token.post(|| {}).expect_err("closed").kind(), ErrorKind::DispatcherClosed);
        assert!(token.worker_pool().is_shutdown());
    }

    #[test]
    fn sequence_runs_one_pause_per_tick() {
        init_test_logging();
        let token = test_token();
        let handle = token.start_sequence(pausing(3), manual_host());
        assert!(!handle.is_completed(), "start never steps inline");

        let ticks = pump_until(&token, DEFAULT_MAX_TICKS, || handle.is_completed());
        assert_eq!(ticks, 4);
        assert_eq!(handle.get_result().expect("value"), 4);
        let stats = token.stats();
        assert_eq!(stats.runs_started, 1);
        assert_eq!(stats.runs_finished, 1);
        assert_eq!(stats.active_runs, 0);
    }

    #[test]
    fn pre_cancelled_token_never_steps() {
        init_test_logging();
        let token = test_token();
        let source = CancelSource::new();
        source.cancel(CancelReason::user("never mind"));
        let stepped = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&stepped);
        let handle = token.start_cancelable_sequence(
            from_fn(move |_cx: &mut StepContext<'_, ()>| {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(Step::Return(()))
            }),
            manual_host(),
            source.token(),
        );

        assert!(handle.is_completed());
        crate::assert_outcome_cancelled!(handle.outcome().expect("completed"));
        pump_ticks(&token, 2);
        assert_eq!(stepped.load(Ordering::SeqCst), 0);
        assert_eq!(token.stats().jobs_posted, 0);
    }

    #[test]
    fn stop_all_spares_later_and_explicit_runs() {
        init_test_logging();
        let token = test_token();
        let scoped = token.start_sequence(pausing(1_000), manual_host());
        let own = CancelSource::new();
        let explicit = token.start_cancelable_sequence(pausing(5), manual_host(), own.token());
        pump_ticks(&token, 2);

        let generation = token.stop_all();
        assert_eq!(generation, token.stats().stop_generation);
        let later = token.start_sequence(pausing(2), manual_host());

        pump_until(&token, DEFAULT_MAX_TICKS, || {
            scoped.is_completed() && explicit.is_completed() && later.is_completed()
        });
        match scoped.outcome().expect("completed") {
            Outcome::Cancelled(reason) => assert_eq!(reason.kind(), CancelKind::StopAll),
            other => unreachable!("expected stop-all cancellation, got {other:?}"),
        }
        assert_eq!(explicit.get_result().expect("explicit run"), 6);
        assert_eq!(later.get_result().expect("later run"), 3);
    }

    #[test]
    fn next_tick_waiters_resume_at_the_start_of_the_next_tick() {
        init_test_logging();
        let token = test_token();
        let awaiter = Awaiter::inline();
        token.register_tick_waiter(awaiter.clone()).expect("register");
        assert_eq!(token.stats().pending_tick_waiters, 1);

        let report = token.pump_one_tick().expect("pump");
        assert_eq!(report.woken, 1);
        assert_eq!(awaiter.try_result(), Some(Ok(())));
        assert_eq!(token.stats().pending_tick_waiters, 0);
    }

    #[test]
    fn poll_budget_defers_the_remainder() {
        init_test_logging();
        let token = crate::runtime::AffinityBuilder::new()
            .poll_budget(2)
            .worker_threads(0, 1)
            .build()
            .expect("build");
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..5 {
            let counted = Arc::clone(&ran);
            token
                .post(move || {
                    counted.fetch_add(1, Ordering::SeqCst);
                })
                .expect("post");
        }
        assert_eq!(token.pump_one_tick().expect("pump").jobs_run, 2);
        assert_eq!(token.pump_one_tick().expect("pump").jobs_run, 2);
        assert_eq!(token.pump_one_tick().expect("pump").jobs_run, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn panicking_job_does_not_stop_the_pump() {
        init_test_logging();
        let token = test_token();
        token.post(|| panic!("job exploded")).expect("post");
        let (tx, rx) = mpsc::channel();
        token.post(move || tx.send(()).expect("send")).expect("post");
        let report = token.pump_one_tick().expect("pump survives");
        assert_eq!(report.jobs_run, 2);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn park_returns_early_when_work_is_posted() {
        init_test_logging();
        let token = test_token();
        assert!(!token.park_until_posted(Duration::from_millis(5)));
        let remote = token.clone();
        let poster = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            remote.post(|| {}).expect("post");
        });
        assert!(token.park_until_posted(Duration::from_secs(5)));
        poster.join().expect("poster");
    }

    #[test]
    fn run_hosted_calls_back_on_the_affinity_thread() {
        init_test_logging();
        let token = test_token();
        let affinity = thread::current().id();
        let (tx, rx) = mpsc::channel();
        let handle = token.run_hosted(pausing(1), manual_host(), move |outcome| {
            tx.send((thread::current().id() == affinity, outcome)).expect("send");
        });
        pump_until(&token, DEFAULT_MAX_TICKS, || handle.is_completed());
        let (on_affinity, outcome) = rx.recv().expect("callback ran");
        assert!(on_affinity);
        crate::assert_outcome_ok!(outcome, 2);
    }

    #[test]
    fn shutdown_cancels_active_runs() {
        init_test_logging();
        let token = test_token();
        let handle = token.start_sequence(pausing(1_000), manual_host());
        pump_ticks(&token, 2);
        token.shutdown();
        match handle.outcome().expect("completed") {
            Outcome::Cancelled(reason) => assert!(reason.is_shutdown()),
            other => unreachable!("expected shutdown, got {other:?}"),
        }
        assert_eq!(token.stats().active_runs, 0);
    }

    #[test]
    fn shutdown_and_wait_joins_the_workers() {
        init_test_logging();
        let token = test_token();
        let handle = token.spawn_background(async { 7u8 });
        let outcome = handle
            .wait_timeout(Duration::from_secs(5))
            .expect("background tasks may be awaited here")
            .expect("task finished");
        crate::assert_outcome_ok!(outcome, 7);

        assert!(token.shutdown_and_wait(Duration::from_secs(5)));
        assert!(token.is_closed());
        assert_eq!(token.stats().worker_threads, 0);
    }
}

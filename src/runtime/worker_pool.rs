//! Background worker pool.
//!
//! The pool manages OS threads separate from the affinity thread. Work that
//! migrates off the affinity thread (`to_background`, `spawn_background`)
//! runs here.
//!
//! ## Thread Lifecycle
//!
//! Threads are spawned lazily up to `max_threads`. When idle beyond
//! `idle_timeout`, threads above `min_threads` are retired.
//!
//! ## Panics
//!
//! A job that panics is logged and discarded; the worker keeps running.
//! Callers that need the panic (spawned tasks, `run_on_affinity`) catch it
//! themselves before the job reaches the pool.

use crossbeam_queue::SegQueue;
use parking_lot::{Condvar, Mutex};
use std::cell::Cell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::runtime::config::WorkerPoolConfig;
use crate::tracing_compat::{debug, error};
use crate::types::PanicPayload;

/// A unit of work for the pool.
pub(crate) type PoolJob = Box<dyn FnOnce() + Send + 'static>;

static NEXT_POOL_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// Id of the pool owning this thread, 0 off the pool.
    static WORKER_OF: Cell<usize> = const { Cell::new(0) };
}

/// Returns true if the calling thread is a worker of any [`WorkerPool`].
#[must_use]
pub fn is_worker_thread() -> bool {
    WORKER_OF.with(Cell::get) != 0
}

/// The background worker pool.
///
/// Dropping the pool shuts it down without waiting for workers.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    id: usize,
    min_threads: usize,
    max_threads: usize,
    idle_timeout: Duration,
    thread_name_prefix: String,
    on_thread_start: Option<Arc<dyn Fn() + Send + Sync>>,
    on_thread_stop: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Threads currently alive.
    active_threads: AtomicUsize,
    /// Threads currently executing a job.
    busy_threads: AtomicUsize,
    /// Jobs queued but not yet picked up.
    pending_count: AtomicUsize,
    /// Monotonic index used for thread names.
    next_thread_index: AtomicUsize,
    queue: SegQueue<PoolJob>,
    shutdown: AtomicBool,
    mutex: Mutex<()>,
    condvar: Condvar,
    /// Signalled by every worker as it leaves the pool.
    exited: Condvar,
    thread_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates a pool and eagerly starts `min_threads` workers.
    ///
    /// # Panics
    ///
    /// Panics if the OS refuses to spawn a worker thread.
    #[must_use]
    pub fn new(config: &WorkerPoolConfig, thread_name_prefix: &str) -> Self {
        let mut config = config.clone();
        config.normalize();

        let inner = Arc::new(PoolInner {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            min_threads: config.min_threads,
            max_threads: config.max_threads,
            idle_timeout: config.idle_timeout,
            thread_name_prefix: thread_name_prefix.to_string(),
            on_thread_start: config.on_thread_start,
            on_thread_stop: config.on_thread_stop,
            active_threads: AtomicUsize::new(0),
            busy_threads: AtomicUsize::new(0),
            pending_count: AtomicUsize::new(0),
            next_thread_index: AtomicUsize::new(0),
            queue: SegQueue::new(),
            shutdown: AtomicBool::new(false),
            mutex: Mutex::new(()),
            condvar: Condvar::new(),
            exited: Condvar::new(),
            thread_handles: Mutex::new(Vec::with_capacity(config.max_threads)),
        });

        for _ in 0..inner.min_threads {
            spawn_thread(&inner);
        }

        Self { inner }
    }

    /// Queues `f` to run on a worker thread.
    ///
    /// Fails with `DispatcherClosed` once the pool is shut down.
    pub fn spawn<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.try_spawn(Box::new(f))
            .map_err(|_| Error::dispatcher_closed().with_message("worker pool is shut down"))
    }

    /// Queues a boxed job, handing it back if the pool is shut down.
    pub(crate) fn try_spawn(&self, job: PoolJob) -> std::result::Result<(), PoolJob> {
        if self.is_shutdown() {
            return Err(job);
        }
        self.inner.queue.push(job);
        self.inner.pending_count.fetch_add(1, Ordering::AcqRel);

        maybe_spawn_thread(&self.inner);
        let _guard = self.inner.mutex.lock();
        self.inner.condvar.notify_one();
        Ok(())
    }

    /// Returns the number of queued jobs.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending_count.load(Ordering::Relaxed)
    }

    /// Returns the number of live worker threads.
    #[must_use]
    pub fn active_threads(&self) -> usize {
        self.inner.active_threads.load(Ordering::Relaxed)
    }

    /// Returns the number of workers currently executing a job.
    #[must_use]
    pub fn busy_threads(&self) -> usize {
        self.inner.busy_threads.load(Ordering::Relaxed)
    }

    /// Returns true if the calling thread is one of this pool's workers.
    #[must_use]
    pub fn is_current_worker(&self) -> bool {
        WORKER_OF.with(Cell::get) == self.inner.id
    }

    /// Returns true once [`shutdown`](Self::shutdown) has been called.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Stops accepting jobs. Queued jobs still run before workers exit.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        let _guard = self.inner.mutex.lock();
        self.inner.condvar.notify_all();
    }

    /// Shuts down and waits up to `timeout` for every worker to exit.
    ///
    /// Returns `true` if all workers exited. Called from one of this pool's
    /// workers it only signals shutdown and returns `false`, since a worker
    /// cannot wait for itself.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        self.shutdown();
        if self.is_current_worker() {
            return false;
        }

        let deadline = Instant::now() + timeout;
        {
            let mut guard = self.inner.mutex.lock();
            while self.inner.active_threads.load(Ordering::Acquire) > 0 {
                if self.inner.exited.wait_until(&mut guard, deadline).timed_out()
                    && self.inner.active_threads.load(Ordering::Acquire) > 0
                {
                    return false;
                }
            }
        }

        let handles = std::mem::take(&mut *self.inner.thread_handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
        true
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("min_threads", &self.inner.min_threads)
            .field("max_threads", &self.inner.max_threads)
            .field("active_threads", &self.active_threads())
            .field("busy_threads", &self.busy_threads())
            .field("pending", &self.pending_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

enum WorkerExit {
    Shutdown,
    Retired,
}

fn spawn_thread(inner: &Arc<PoolInner>) {
    let index = inner.next_thread_index.fetch_add(1, Ordering::Relaxed);
    let name = format!("{}-worker-{}", inner.thread_name_prefix, index);
    inner.active_threads.fetch_add(1, Ordering::AcqRel);

    let worker = Arc::clone(inner);
    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || {
            WORKER_OF.with(|owner| owner.set(worker.id));
            if let Some(callback) = &worker.on_thread_start {
                callback();
            }
            // A retiring worker has already released its slot.
            if let WorkerExit::Shutdown = worker_loop(&worker) {
                worker.active_threads.fetch_sub(1, Ordering::AcqRel);
            }
            {
                let _guard = worker.mutex.lock();
                worker.exited.notify_all();
            }
            if let Some(callback) = &worker.on_thread_stop {
                callback();
            }
        })
        .expect("failed to spawn worker thread");

    let mut handles = inner.thread_handles.lock();
    // Retired workers are detached once they have exited.
    handles.retain(|handle| !handle.is_finished());
    handles.push(handle);
}

fn maybe_spawn_thread(inner: &Arc<PoolInner>) {
    let active = inner.active_threads.load(Ordering::Acquire);
    let busy = inner.busy_threads.load(Ordering::Acquire);
    let pending = inner.pending_count.load(Ordering::Acquire);

    if active < inner.max_threads && busy >= active && pending > 0 {
        spawn_thread(inner);
    }
}

fn worker_loop(inner: &PoolInner) -> WorkerExit {
    loop {
        if let Some(job) = inner.queue.pop() {
            inner.pending_count.fetch_sub(1, Ordering::AcqRel);
            inner.busy_threads.fetch_add(1, Ordering::AcqRel);
            if let Err(payload) = catch_unwind(AssertUnwindSafe(job)) {
                let payload = PanicPayload::from_any(payload.as_ref());
                error!(panic = %payload, "worker job panicked");
            }
            inner.busy_threads.fetch_sub(1, Ordering::AcqRel);
            continue;
        }

        if inner.shutdown.load(Ordering::Acquire) {
            return WorkerExit::Shutdown;
        }

        let mut guard = inner.mutex.lock();
        if !inner.queue.is_empty() || inner.shutdown.load(Ordering::Acquire) {
            continue;
        }
        if inner.active_threads.load(Ordering::Acquire) > inner.min_threads {
            let timed_out = inner
                .condvar
                .wait_for(&mut guard, inner.idle_timeout)
                .timed_out();
            drop(guard);
            if timed_out && inner.queue.is_empty() && try_retire(inner) {
                debug!(
                    active = inner.active_threads.load(Ordering::Relaxed),
                    "idle worker retired"
                );
                return WorkerExit::Retired;
            }
        } else {
            inner.condvar.wait(&mut guard);
        }
    }
}

/// Leaves the pool if doing so keeps at least `min_threads` alive.
fn try_retire(inner: &PoolInner) -> bool {
    let mut active = inner.active_threads.load(Ordering::Acquire);
    while active > inner.min_threads {
        match inner.active_threads.compare_exchange_weak(
            active,
            active - 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return true,
            Err(seen) => active = seen,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::init_test_logging;
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;

    fn pool(min: usize, max: usize) -> WorkerPool {
        let config = WorkerPoolConfig {
            min_threads: min,
            max_threads: max,
            idle_timeout: Duration::from_millis(50),
            ..WorkerPoolConfig::default()
        };
        WorkerPool::new(&config, "pool-test")
    }

    #[test]
    fn jobs_run_on_named_worker_threads() {
        init_test_logging();
        crate::test_phase!("jobs_run_on_named_worker_threads");
        let pool = pool(1, 2);
        let (tx, rx) = mpsc::channel();
        pool.spawn(move || {
            let name = thread::current().name().map(str::to_string);
            tx.send((name, is_worker_thread())).expect("send");
        })
        .expect("spawn");

        let (name, worker) = rx.recv_timeout(Duration::from_secs(5)).expect("job ran");
        assert!(name.expect("named").starts_with("pool-test-worker-"));
        assert!(worker);
        assert!(!is_worker_thread());
        crate::test_complete!("jobs_run_on_named_worker_threads");
    }

    #[test]
    fn many_jobs_complete() {
        init_test_logging();
        let pool = pool(2, 4);
        let counter = Arc::new(AtomicU32::new(0));
        let (tx, rx) = mpsc::channel();
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            let tx = tx.clone();
            pool.spawn(move || {
                counter.fetch_add(1, Ordering::Relaxed);
                let _ = tx.send(());
            })
            .expect("spawn");
        }
        for _ in 0..100 {
            rx.recv_timeout(Duration::from_secs(5)).expect("job ran");
        }
        assert_eq!(counter.load(Ordering::Relaxed), 100);
        assert!(pool.active_threads() <= 4);
    }

    #[test]
    fn panicking_job_does_not_kill_worker() {
        init_test_logging();
        let pool = pool(1, 1);
        pool.spawn(|| panic!("job failure")).expect("spawn");
        let (tx, rx) = mpsc::channel();
        pool.spawn(move || tx.send(7).expect("send")).expect("spawn");
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).expect("ran"), 7);
        assert_eq!(pool.active_threads(), 1);
    }

    #[test]
    fn spawn_after_shutdown_is_rejected() {
        init_test_logging();
        let pool = pool(1, 2);
        assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
        assert_eq!(pool.active_threads(), 0);
        let err = pool.spawn(|| {}).expect_err("closed pool");
        assert_eq!(err.kind(), crate::error::ErrorKind::DispatcherClosed);
    }

    #[test]
    fn idle_workers_above_min_retire() {
        init_test_logging();
        let pool = pool(0, 2);
        let (tx, rx) = mpsc::channel();
        pool.spawn(move || tx.send(()).expect("send")).expect("spawn");
        rx.recv_timeout(Duration::from_secs(5)).expect("ran");

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.active_threads() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.active_threads(), 0);
    }

    #[test]
    fn thread_hooks_fire() {
        init_test_logging();
        let started = Arc::new(AtomicU32::new(0));
        let stopped = Arc::new(AtomicU32::new(0));
        let config = WorkerPoolConfig {
            min_threads: 2,
            max_threads: 2,
            on_thread_start: Some({
                let started = Arc::clone(&started);
                Arc::new(move || {
                    started.fetch_add(1, Ordering::SeqCst);
                })
            }),
            on_thread_stop: Some({
                let stopped = Arc::clone(&stopped);
                Arc::new(move || {
                    stopped.fetch_add(1, Ordering::SeqCst);
                })
            }),
            ..WorkerPoolConfig::default()
        };
        let pool = WorkerPool::new(&config, "hooks");
        assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
        assert_eq!(started.load(Ordering::SeqCst), 2);
        assert_eq!(stopped.load(Ordering::SeqCst), 2);
    }

    fn idle_pool(timeout: Duration) -> WorkerPool {
        let config = WorkerPoolConfig {
            min_threads: 0,
            max_threads: 1,
            idle_timeout: timeout,
            ..WorkerPoolConfig::default()
        };
        WorkerPool::new(&config, "retire")
    }

    fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + deadline;
        while !done() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::yield_now();
        }
        true
    }

    #[test]
    fn retired_workers_do_not_accumulate_handles() {
        init_test_logging();
        crate::test_phase!("retired_workers_do_not_accumulate_handles");
        let pool = idle_pool(Duration::from_millis(5));
        for _ in 0..20 {
            let (tx, rx) = mpsc::channel();
            pool.spawn(move || tx.send(()).expect("send")).expect("spawn");
            rx.recv_timeout(Duration::from_secs(5)).expect("ran");
            assert!(wait_for(Duration::from_secs(5), || {
                pool.active_threads() == 0
                    && pool.inner.thread_handles.lock().iter().all(JoinHandle::is_finished)
            }));
        }
        let (tx, rx) = mpsc::channel();
        pool.spawn(move || tx.send(()).expect("send")).expect("spawn");
        rx.recv_timeout(Duration::from_secs(5)).expect("ran");

        let stored = pool.inner.thread_handles.lock().len();
        crate::assert_with_log!(stored == 1, "only the live worker is tracked", 1, stored);
        crate::test_complete!("retired_workers_do_not_accumulate_handles");
    }

    #[test]
    fn shutdown_and_wait_returns_once_workers_exit() {
        init_test_logging();
        let pool = pool(3, 3);
        let started = Instant::now();
        assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
        assert_eq!(pool.active_threads(), 0);
        assert!(pool.inner.thread_handles.lock().is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn shutdown_and_wait_times_out_on_a_stuck_job() {
        init_test_logging();
        let pool = pool(1, 1);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let (entered_tx, entered_rx) = mpsc::channel();
        pool.spawn(move || {
            entered_tx.send(()).expect("send");
            let _ = release_rx.recv();
        })
        .expect("spawn");
        entered_rx.recv_timeout(Duration::from_secs(5)).expect("entered");

        assert!(!pool.shutdown_and_wait(Duration::from_millis(20)));
        release_tx.send(()).expect("release");
        assert!(pool.shutdown_and_wait(Duration::from_secs(5)));
    }

    #[test]
    fn workers_know_which_pool_owns_them() {
        init_test_logging();
        let first = pool(1, 1);
        let second = pool(1, 1);
        let (tx, rx) = mpsc::channel();
        let (first_id, second_id) = (first.inner.id, second.inner.id);
        second
            .spawn(move || {
                let owner = WORKER_OF.with(Cell::get);
                tx.send((is_worker_thread(), owner == first_id, owner == second_id))
                    .expect("send");
            })
            .expect("spawn");
        let (any_pool, on_first, on_second) =
            rx.recv_timeout(Duration::from_secs(5)).expect("ran");
        assert!(any_pool);
        assert!(!on_first);
        assert!(on_second);
        assert!(!first.is_current_worker());
        assert!(!second.is_current_worker());
    }
}

//! Affinity dispatcher configuration types.
//!
//! In most cases use [`AffinityBuilder`](super::builder::AffinityBuilder)
//! rather than creating an [`AffinityConfig`] directly.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `worker.min_threads` | 0 |
//! | `worker.max_threads` | available CPU parallelism |
//! | `worker.idle_timeout` | 10 s |
//! | `thread_name_prefix` | `"affinity"` |
//! | `poll_budget` | 1024 jobs per tick |
//! | `step_budget` | 4096 steps per run per tick |

use std::sync::Arc;
use std::time::Duration;

/// Default prefix for worker thread names.
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "affinity";
/// Default number of posted jobs drained per tick.
pub const DEFAULT_POLL_BUDGET: usize = 1024;
/// Default number of interpreter steps one run may take per tick.
pub const DEFAULT_STEP_BUDGET: usize = 4096;
/// Default idle time before an excess worker retires.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for the background worker pool.
#[derive(Clone)]
pub struct WorkerPoolConfig {
    /// Minimum number of worker threads kept alive.
    pub min_threads: usize,
    /// Maximum number of worker threads.
    pub max_threads: usize,
    /// Idle time before threads above `min_threads` retire.
    pub idle_timeout: Duration,
    /// Callback executed when a worker thread starts.
    pub on_thread_start: Option<Arc<dyn Fn() + Send + Sync>>,
    /// Callback executed when a worker thread stops.
    pub on_thread_stop: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl WorkerPoolConfig {
    /// Normalize configuration values to safe defaults.
    pub fn normalize(&mut self) {
        if self.max_threads == 0 {
            self.max_threads = 1;
        }
        if self.max_threads < self.min_threads {
            self.max_threads = self.min_threads;
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            min_threads: 0,
            max_threads: AffinityConfig::default_worker_threads(),
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            on_thread_start: None,
            on_thread_stop: None,
        }
    }
}

impl std::fmt::Debug for WorkerPoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPoolConfig")
            .field("min_threads", &self.min_threads)
            .field("max_threads", &self.max_threads)
            .field("idle_timeout", &self.idle_timeout)
            .field("on_thread_start", &self.on_thread_start.is_some())
            .field("on_thread_stop", &self.on_thread_stop.is_some())
            .finish()
    }
}

/// Affinity dispatcher configuration.
#[derive(Debug, Clone)]
pub struct AffinityConfig {
    /// Background worker pool settings.
    pub worker: WorkerPoolConfig,
    /// Name prefix for worker threads.
    pub thread_name_prefix: String,
    /// Posted jobs drained per tick. Jobs posted while draining count too.
    pub poll_budget: usize,
    /// Interpreter steps a single run may take in one tick before it is
    /// treated as paused.
    pub step_budget: usize,
}

impl AffinityConfig {
    /// Normalize configuration values to safe defaults.
    pub fn normalize(&mut self) {
        if self.poll_budget == 0 {
            self.poll_budget = 1;
        }
        if self.step_budget == 0 {
            self.step_budget = 1;
        }
        if self.thread_name_prefix.is_empty() {
            self.thread_name_prefix = DEFAULT_THREAD_NAME_PREFIX.to_string();
        }
        self.worker.normalize();
    }

    pub(crate) fn default_worker_threads() -> usize {
        std::thread::available_parallelism()
            .map_or(1, std::num::NonZeroUsize::get)
            .max(1)
    }
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            worker: WorkerPoolConfig::default(),
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
            poll_budget: DEFAULT_POLL_BUDGET,
            step_budget: DEFAULT_STEP_BUDGET,
        }
    }
}

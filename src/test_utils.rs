//! Test utilities for affinity-bridge.
//!
//! Shared helpers for unit tests:
//! - Consistent tracing-based logging initialization
//! - Phase/section macros for readable test output
//! - An affinity token bound to the test thread plus a frame-loop driver
//! - Outcome assertion macros

use crate::runtime::{AffinityBuilder, AffinityToken};
use std::sync::{Mutex, MutexGuard, Once};
use std::time::{Duration, Instant};
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();
static ENV_LOCK: Mutex<()> = Mutex::new(());

/// Upper bound on frames a test loop may pump before giving up.
pub const DEFAULT_MAX_TICKS: u64 = 10_000;

/// Initialize test logging with trace-level output.
///
/// Safe to call multiple times; only initializes once.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
///
/// The first call wins; later calls are no-ops.
pub fn init_test_logging_with_level(level: tracing::Level) {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(level)
            .with_test_writer()
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_thread_ids(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_ansi(false)
            .try_init();
    });
}

/// Acquire the global environment lock for tests that mutate env vars.
pub(crate) fn env_lock() -> MutexGuard<'static, ()> {
    ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// Creates an affinity token bound to the calling test thread.
#[must_use]
pub fn test_token() -> AffinityToken {
    AffinityBuilder::new()
        .worker_threads(1, 4)
        .thread_name_prefix("affinity-test")
        .build()
        .expect("failed to build test affinity token")
}

/// Pumps ticks on the calling (affinity) thread until `done` holds.
///
/// Between ticks the loop parks until work is posted or a millisecond passes,
/// standing in for a host frame loop. Returns the number of ticks pumped.
///
/// # Panics
///
/// Panics if `done` does not hold within `max_ticks` ticks.
pub fn pump_until(token: &AffinityToken, max_ticks: u64, mut done: impl FnMut() -> bool) -> u64 {
    let started = Instant::now();
    let mut ticks = 0;
    while !done() {
        assert!(
            ticks < max_ticks,
            "condition not reached after {ticks} ticks ({:?})",
            started.elapsed()
        );
        token.pump_one_tick().expect("pump must run on the affinity thread");
        ticks += 1;
        token.park_until_posted(Duration::from_millis(1));
    }
    ticks
}

/// Pumps exactly `ticks` ticks on the calling (affinity) thread.
pub fn pump_ticks(token: &AffinityToken, ticks: u64) {
    for _ in 0..ticks {
        token.pump_one_tick().expect("pump must run on the affinity thread");
    }
}

/// Log a test phase transition with a visual separator.
#[macro_export]
macro_rules! test_phase {
    ($name:expr) => {
        tracing::info!(phase = %$name, "========================================");
        tracing::info!(phase = %$name, "TEST PHASE: {}", $name);
        tracing::info!(phase = %$name, "========================================");
    };
}

/// Log a section within a test phase.
#[macro_export]
macro_rules! test_section {
    ($name:expr) => {
        tracing::debug!(section = %$name, "--- {} ---", $name);
    };
}

/// Log test completion.
#[macro_export]
macro_rules! test_complete {
    ($name:expr) => {
        tracing::info!(test = %$name, "test completed successfully: {}", $name);
    };
}

/// Log before assertions for context.
#[macro_export]
macro_rules! assert_with_log {
    ($cond:expr, $msg:expr, $expected:expr, $actual:expr) => {
        tracing::debug!(
            expected = ?$expected,
            actual = ?$actual,
            "Asserting: {}",
            $msg
        );
        assert!($cond, "{}: expected {:?}, got {:?}", $msg, $expected, $actual);
    };
}

/// Assert that an outcome is Ok with a specific value.
#[macro_export]
macro_rules! assert_outcome_ok {
    ($outcome:expr, $expected:expr) => {
        match $outcome {
            $crate::types::Outcome::Ok(v) => assert_eq!(v, $expected),
            other => unreachable!("expected Outcome::Ok({:?}), got {:?}", $expected, other),
        }
    };
}

/// Assert that an outcome is Cancelled.
#[macro_export]
macro_rules! assert_outcome_cancelled {
    ($outcome:expr) => {
        match $outcome {
            $crate::types::Outcome::Cancelled(_) => {}
            other => unreachable!("expected Outcome::Cancelled, got {:?}", other),
        }
    };
}

/// Assert that an outcome is Err.
#[macro_export]
macro_rules! assert_outcome_err {
    ($outcome:expr) => {
        match $outcome {
            $crate::types::Outcome::Err(_) => {}
            other => unreachable!("expected Outcome::Err, got {:?}", other),
        }
    };
}

/// Assert that an outcome is Panicked.
#[macro_export]
macro_rules! assert_outcome_panicked {
    ($outcome:expr) => {
        match $outcome {
            $crate::types::Outcome::Panicked(_) => {}
            other => unreachable!("expected Outcome::Panicked, got {:?}", other),
        }
    };
}

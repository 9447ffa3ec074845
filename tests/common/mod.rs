#![allow(dead_code)]
#![allow(unused_imports)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! #[macro_use]
//! mod common;
//! use common::*;
//! ```

use affinity_bridge::host::{Host, ManualHost};
use affinity_bridge::runtime::{AffinityBuilder, AffinityToken};
use affinity_bridge::sequence::{BoxSequence, Step, StepContext, SuspendSequence};
use proptest::prelude::ProptestConfig;
use proptest::test_runner::RngSeed;
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};
use tracing_subscriber::fmt::format::FmtSpan;

static INIT_LOGGING: Once = Once::new();

/// Upper bound on ticks a test host loop may pump.
pub const DEFAULT_MAX_TICKS: u64 = 10_000;
/// Default seed for property tests when running under CI.
pub const DEFAULT_PROPTEST_SEED: u64 = 0x5EED_5EED;

const PROPTEST_SEED_ENV: &str = "AFFINITY_PROPTEST_SEED";

/// Build a ProptestConfig with deterministic seed support for CI.
#[must_use]
pub fn test_proptest_config(cases: u32) -> ProptestConfig {
    let mut config = ProptestConfig::with_cases(cases);
    // Honor an existing PROPTEST_RNG_SEED, otherwise apply our own.
    if matches!(config.rng_seed, RngSeed::Random) {
        if let Some(seed) = read_proptest_seed() {
            config.rng_seed = RngSeed::Fixed(seed);
        }
    }
    config
}

fn read_proptest_seed() -> Option<u64> {
    if let Ok(value) = std::env::var(PROPTEST_SEED_ENV) {
        return value.parse::<u64>().ok();
    }
    std::env::var("CI").ok().map(|_| DEFAULT_PROPTEST_SEED)
}

/// Initialize test logging with trace-level output.
pub fn init_test_logging() {
    init_test_logging_with_level(tracing::Level::TRACE);
}

/// Initialize test logging with a custom level.
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

/// Binds a fresh token to the calling test thread.
#[must_use]
pub fn test_token() -> AffinityToken {
    init_test_logging();
    AffinityBuilder::new()
        .worker_threads(1, 4)
        .thread_name_prefix("affinity-it")
        .build()
        .expect("failed to build test token")
}

/// A manually clocked host.
#[must_use]
pub fn manual_host() -> Arc<ManualHost> {
    Arc::new(ManualHost::new())
}

/// Same host, as the trait object the dispatcher takes.
#[must_use]
pub fn as_host(host: &Arc<ManualHost>) -> Arc<dyn Host> {
    Arc::clone(host) as Arc<dyn Host>
}

/// Host frame loop: pumps until `done` holds, parking briefly between ticks.
///
/// Returns the number of ticks pumped. Panics after `max_ticks`.
pub fn pump_until(token: &AffinityToken, max_ticks: u64, mut done: impl FnMut() -> bool) -> u64 {
    let started = Instant::now();
    let mut ticks = 0;
    while !done() {
        assert!(
            ticks < max_ticks,
            "condition not reached after {ticks} ticks ({:?})",
            started.elapsed()
        );
        token.pump_one_tick().expect("pump on the affinity thread");
        ticks += 1;
        token.park_until_posted(Duration::from_millis(1));
    }
    ticks
}

/// Pumps exactly `ticks` ticks.
pub fn pump_ticks(token: &AffinityToken, ticks: u64) {
    for _ in 0..ticks {
        token.pump_one_tick().expect("pump on the affinity thread");
    }
}

/// A sequence nesting `depth` levels; each level returns its child's value
/// plus one, so the root returns `depth`.
pub struct Nest {
    depth: u32,
    entered: bool,
}

/// Boxes a [`Nest`] of the given depth.
#[must_use]
pub fn nest(depth: u32) -> BoxSequence<u32> {
    Box::new(Nest {
        depth,
        entered: false,
    })
}

impl SuspendSequence for Nest {
    type Output = u32;

    fn resume(&mut self, cx: &mut StepContext<'_, u32>) -> affinity_bridge::Result<Step<u32>> {
        if self.depth == 0 {
            return Ok(Step::Return(0));
        }
        if !self.entered {
            self.entered = true;
            return Ok(Step::Call(nest(self.depth - 1)));
        }
        Ok(Step::Return(cx.take_returned().unwrap_or(0) + 1))
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
            ::affinity_bridge::types::Outcome::Ok(v) => assert_eq!(v, $expected),
            other => panic!("expected Outcome::Ok({:?}), got {:?}", $expected, other),
        }
    };
}

/// Assert that an outcome is Cancelled with the given kind.
#[macro_export]
macro_rules! assert_outcome_cancelled {
    ($outcome:expr, $kind:expr) => {
        match $outcome {
            ::affinity_bridge::types::Outcome::Cancelled(reason) => assert_eq!(reason.kind(), $kind),
            other => panic!("expected Outcome::Cancelled, got {:?}", other),
        }
    };
}

/// Assert that an outcome is Err.
#[macro_export]
macro_rules! assert_outcome_err {
    ($outcome:expr) => {
        match $outcome {
            ::affinity_bridge::types::Outcome::Err(e) => e,
            other => panic!("expected Outcome::Err, got {:?}", other),
        }
    };
}

//! Environment variable support for [`AffinityBuilder`](super::builder::AffinityBuilder).
//!
//! # Configuration Precedence
//!
//! Settings are resolved in this order (highest priority first):
//!
//! 1. **Programmatic**: values set via builder methods (`poll_budget(64)`)
//! 2. **Environment variables**: values from `AFFINITY_*` env vars
//! 3. **Defaults**: built-in defaults from [`AffinityConfig::default()`]
//!
//! # Supported Environment Variables
//!
//! | Variable | Type | Maps to |
//! |----------|------|---------|
//! | `AFFINITY_WORKER_MIN_THREADS` | `usize` | `worker.min_threads` |
//! | `AFFINITY_WORKER_MAX_THREADS` | `usize` | `worker.max_threads` |
//! | `AFFINITY_WORKER_IDLE_TIMEOUT_MS` | `u64` | `worker.idle_timeout` |
//! | `AFFINITY_THREAD_NAME_PREFIX` | `String` | `thread_name_prefix` |
//! | `AFFINITY_POLL_BUDGET` | `usize` | `poll_budget` |
//! | `AFFINITY_STEP_BUDGET` | `usize` | `step_budget` |

use std::time::Duration;

use thiserror::Error;

use crate::runtime::config::AffinityConfig;

/// Environment variable name for the worker pool minimum.
pub const ENV_WORKER_MIN_THREADS: &str = "AFFINITY_WORKER_MIN_THREADS";
/// Environment variable name for the worker pool maximum.
pub const ENV_WORKER_MAX_THREADS: &str = "AFFINITY_WORKER_MAX_THREADS";
/// Environment variable name for the worker idle timeout in milliseconds.
pub const ENV_WORKER_IDLE_TIMEOUT_MS: &str = "AFFINITY_WORKER_IDLE_TIMEOUT_MS";
/// Environment variable name for the worker thread name prefix.
pub const ENV_THREAD_NAME_PREFIX: &str = "AFFINITY_THREAD_NAME_PREFIX";
/// Environment variable name for jobs drained per tick.
pub const ENV_POLL_BUDGET: &str = "AFFINITY_POLL_BUDGET";
/// Environment variable name for interpreter steps per run per tick.
pub const ENV_STEP_BUDGET: &str = "AFFINITY_STEP_BUDGET";

/// Error raised when a configuration value cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An environment variable held a value of the wrong shape.
    #[error("invalid value for {var}: expected {expected}, got {value:?}")]
    InvalidValue {
        /// Variable name.
        var: &'static str,
        /// What the variable should contain.
        expected: &'static str,
        /// The raw value found.
        value: String,
    },
    /// A value parsed but is outside the accepted range.
    #[error("{var} must be {requirement}")]
    OutOfRange {
        /// Variable name.
        var: &'static str,
        /// The violated requirement.
        requirement: &'static str,
    },
}

/// Apply environment variable overrides to an [`AffinityConfig`].
///
/// Only variables that are set in the environment are applied.
pub fn apply_env_overrides(config: &mut AffinityConfig) -> Result<(), ConfigError> {
    if let Some(val) = read_env(ENV_WORKER_MIN_THREADS) {
        config.worker.min_threads = parse_usize(ENV_WORKER_MIN_THREADS, &val)?;
    }
    if let Some(val) = read_env(ENV_WORKER_MAX_THREADS) {
        config.worker.max_threads = parse_usize(ENV_WORKER_MAX_THREADS, &val)?;
    }
    if let Some(val) = read_env(ENV_WORKER_IDLE_TIMEOUT_MS) {
        let millis = parse_u64(ENV_WORKER_IDLE_TIMEOUT_MS, &val)?;
        config.worker.idle_timeout = Duration::from_millis(millis);
    }
    if let Some(val) = read_env(ENV_THREAD_NAME_PREFIX) {
        config.thread_name_prefix = val;
    }
    if let Some(val) = read_env(ENV_POLL_BUDGET) {
        config.poll_budget = parse_nonzero(ENV_POLL_BUDGET, &val)?;
    }
    if let Some(val) = read_env(ENV_STEP_BUDGET) {
        config.step_budget = parse_nonzero(ENV_STEP_BUDGET, &val)?;
    }
    Ok(())
}

/// Read an environment variable, returning `None` if unset.
fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

fn parse_usize(var: &'static str, val: &str) -> Result<usize, ConfigError> {
    val.trim()
        .parse::<usize>()
        .map_err(|_| ConfigError::InvalidValue {
            var,
            expected: "unsigned integer",
            value: val.to_string(),
        })
}

fn parse_u64(var: &'static str, val: &str) -> Result<u64, ConfigError> {
    val.trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidValue {
            var,
            expected: "milliseconds as u64",
            value: val.to_string(),
        })
}

fn parse_nonzero(var: &'static str, val: &str) -> Result<usize, ConfigError> {
    match parse_usize(var, val)? {
        0 => Err(ConfigError::OutOfRange {
            var,
            requirement: "at least 1",
        }),
        n => Ok(n),
    }
}

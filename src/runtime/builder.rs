//! Affinity token builder.

use crate::error::{Error, ErrorKind, Result};
use crate::runtime::config::AffinityConfig;
use crate::runtime::env_config::{apply_env_overrides, ConfigError};
use crate::runtime::token::AffinityToken;
use std::sync::Arc;
use std::time::Duration;

/// Builder for binding an [`AffinityToken`] to the calling thread.
#[derive(Clone, Debug)]
pub struct AffinityBuilder {
    config: AffinityConfig,
}

impl AffinityBuilder {
    /// Create a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: AffinityConfig::default(),
        }
    }

    /// Start from an explicit configuration.
    #[must_use]
    pub fn from_config(config: AffinityConfig) -> Self {
        Self { config }
    }

    /// Apply `AFFINITY_*` environment overrides to the current settings.
    ///
    /// Call this first so that builder methods chained afterwards take
    /// precedence over the environment.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        apply_env_overrides(&mut self.config)?;
        Ok(self)
    }

    /// Configure worker pool thread limits.
    #[must_use]
    pub fn worker_threads(mut self, min: usize, max: usize) -> Self {
        self.config.worker.min_threads = min;
        self.config.worker.max_threads = max;
        self
    }

    /// Set how long an idle worker above the minimum lingers.
    #[must_use]
    pub fn worker_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.worker.idle_timeout = timeout;
        self
    }

    /// Set the worker thread name prefix.
    #[must_use]
    pub fn thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    /// Set how many posted jobs one tick drains.
    #[must_use]
    pub fn poll_budget(mut self, budget: usize) -> Self {
        self.config.poll_budget = budget;
        self
    }

    /// Set how many interpreter steps one run may take per tick.
    #[must_use]
    pub fn step_budget(mut self, budget: usize) -> Self {
        self.config.step_budget = budget;
        self
    }

    /// Register a callback to run when a worker thread starts.
    #[must_use]
    pub fn on_thread_start<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.config.worker.on_thread_start = Some(Arc::new(f));
        self
    }

    /// Register a callback to run when a worker thread stops.
    #[must_use]
    pub fn on_thread_stop<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.config.worker.on_thread_stop = Some(Arc::new(f));
        self
    }

    /// The configuration as currently set.
    #[must_use]
    pub fn config(&self) -> &AffinityConfig {
        &self.config
    }

    /// Bind a token to the calling thread, which becomes its affinity
    /// thread.
    pub fn build(self) -> Result<AffinityToken> {
        Ok(AffinityToken::bind_current(self.config))
    }
}

impl Default for AffinityBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::new(ErrorKind::Config)
            .with_message(err.to_string())
            .with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::env_config::{ENV_POLL_BUDGET, ENV_STEP_BUDGET};
    use crate::test_utils::{env_lock, init_test_logging};

    #[test]
    fn build_normalizes_and_binds_the_current_thread() {
        init_test_logging();
        let token = AffinityBuilder::new()
            .worker_threads(3, 1)
            .poll_budget(0)
            .thread_name_prefix("")
            .build()
            .expect("build");
        assert!(token.is_affinity_thread());
        assert_eq!(token.thread_id(), std::thread::current().id());
        let config = token.config();
        assert_eq!(config.poll_budget, 1);
        assert_eq!(config.worker.max_threads, 3);
        assert_eq!(config.thread_name_prefix, "affinity");
    }

    #[test]
    fn later_setters_beat_environment() {
        init_test_logging();
        let _guard = env_lock();
        std::env::set_var(ENV_POLL_BUDGET, "7");
        std::env::set_var(ENV_STEP_BUDGET, "9");
        let builder = AffinityBuilder::new()
            .with_env_overrides()
            .map(|b| b.poll_budget(64));
        std::env::remove_var(ENV_POLL_BUDGET);
        std::env::remove_var(ENV_STEP_BUDGET);

        let builder = builder.expect("env parses");
        assert_eq!(builder.config().poll_budget, 64);
        assert_eq!(builder.config().step_budget, 9);
    }

    #[test]
    fn bad_environment_is_a_config_error() {
        init_test_logging();
        let _guard = env_lock();
        std::env::set_var(ENV_POLL_BUDGET, "lots");
        let result = AffinityBuilder::new().with_env_overrides();
        std::env::remove_var(ENV_POLL_BUDGET);

        let err = result.expect_err("unparseable budget");
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(std::error::Error::source(&err).is_some());
        assert!(err.to_string().contains(ENV_POLL_BUDGET));
    }
}

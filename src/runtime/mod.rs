//! The affinity dispatcher and its background worker pool.
//!
//! - [`config`]: configuration types and defaults
//! - [`env_config`]: `AFFINITY_*` environment overrides
//! - [`builder`]: fluent builder that binds a token to the calling thread
//! - [`token`]: the [`AffinityToken`], its dispatch queue and pump
//! - [`worker_pool`]: elastic pool of background threads
//!
//! # Quick Start
//!
//! ```ignore
//! use affinity_bridge::runtime::AffinityBuilder;
//!
//! // On the thread that owns the host loop:
//! let token = AffinityBuilder::new().with_env_overrides()?.build()?;
//! loop {
//!     token.pump_one_tick()?;
//!     // render, poll input, ...
//! }
//! ```
//!
//! Builder methods consume `self` and return the updated builder, so calls
//! chain without borrowing hazards.

pub mod builder;
pub mod config;
pub mod env_config;
pub(crate) mod task;
pub mod token;
pub mod worker_pool;

pub use builder::AffinityBuilder;
pub use config::{AffinityConfig, WorkerPoolConfig};
pub use env_config::ConfigError;
pub use token::{AffinityStats, AffinityToken, TickReport};
pub use worker_pool::{is_worker_thread, WorkerPool};

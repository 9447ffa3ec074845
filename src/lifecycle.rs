//! Process-wide installation of the affinity thread.
//!
//! Hosts call [`install`] once from the thread that runs their frame loop,
//! typically during module initialization, and [`on_quit`] when the process
//! is about to exit. Everything else reaches the token through [`global`].

use std::sync::OnceLock;

use crate::error::{Error, ErrorKind, Result};
use crate::runtime::{AffinityBuilder, AffinityToken};
use crate::tracing_compat::{debug, info};

static INSTALLED: OnceLock<AffinityToken> = OnceLock::new();

/// Installs the calling thread as the process-wide affinity thread with
/// default settings and environment overrides.
pub fn install() -> Result<AffinityToken> {
    install_with(AffinityBuilder::new().with_env_overrides()?)
}

/// Installs the calling thread as the affinity thread using `builder`.
///
/// Installing again from the same thread returns the existing token and
/// ignores `builder`. Installing from any other thread fails with
/// `AlreadyInstalled`.
pub fn install_with(builder: AffinityBuilder) -> Result<AffinityToken> {
    let token = match INSTALLED.get() {
        Some(token) => token,
        None => {
            let candidate = builder.build()?;
            // A racing installer may win; our candidate is then dropped.
            INSTALLED.get_or_init(|| candidate)
        }
    };
    if !token.is_affinity_thread() {
        return Err(Error::new(ErrorKind::AlreadyInstalled).with_message(format!(
            "affinity thread is {:?}",
            token.thread_id()
        )));
    }
    debug!(thread = ?token.thread_id(), "affinity thread installed");
    Ok(token.clone())
}

/// Returns the installed token, if any.
#[must_use]
pub fn installed() -> Option<AffinityToken> {
    INSTALLED.get().cloned()
}

/// Returns the installed token or fails with `NotInstalled`.
pub fn global() -> Result<AffinityToken> {
    installed().ok_or_else(|| Error::new(ErrorKind::NotInstalled))
}

/// Returns true if the calling thread is the installed affinity thread.
///
/// False when nothing is installed.
#[must_use]
pub fn is_affinity_thread() -> bool {
    INSTALLED.get().is_some_and(AffinityToken::is_affinity_thread)
}

/// Quit hook: cancels every run started without an explicit token.
///
/// Does nothing when nothing is installed. Returns the new stop generation.
pub fn on_quit() -> Option<u64> {
    let token = INSTALLED.get()?;
    let generation = token.stop_all();
    info!(generation, "quit requested; stopped all scoped runs");
    Some(generation)
}

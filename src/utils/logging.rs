//! Structured logging setup built on `tracing`.
//!
//! The transport itself only emits `tracing` events; this module is the
//! one-stop initialization an embedding application calls once at startup.

use crate::config::LoggingConfig;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initialize a console subscriber at the given level.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init(level: Level) {
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init();
}

/// Initialize from `RUST_LOG`, falling back to `info` when unset.
pub fn init_from_env() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Initialize according to a [`LoggingConfig`] section.
pub fn init_from_config(config: &LoggingConfig) {
    if !config.log_to_console {
        return;
    }
    init(config.log_level);
}

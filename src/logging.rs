//! relay-fabric/src/logging.rs
//! Logging initialization.

use std::sync::Once;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{filter::EnvFilter, fmt};

static LOG_INIT: Once = Once::new();

/// Installs the global `tracing` subscriber once. Safe to call from both the proxy
/// binary's `main` and from test setup; repeated calls after the first are no-ops.
pub fn init_logging(default_filter: &str) {
    LOG_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer());
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

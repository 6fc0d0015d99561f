//! Structured logging.
//!
//! # Responsibilities
//! - Resolve the log filter (RUST_LOG, else the configured level)
//! - Install the global `tracing` subscriber

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter from `RUST_LOG` when set and valid, otherwise `fallback`.
///
/// Must run before the environment is cleared.
pub fn resolve_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback))
}

/// Install the global subscriber. A second call is ignored.
pub fn init_logging(filter: EnvFilter) {
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

//! Structured logging.
//!
//! # Design Decisions
//! - `RUST_LOG` wins over the configured `logLevel`, which wins over `info`
//! - The level is fixed at startup; a reloaded `logLevel` is logged but not
//!   applied

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Filter directive for a configured level.
pub fn filter_directive(level: Option<&str>) -> String {
    let level = level.unwrap_or("info");
    format!("capture_proxy={level},tower_http={level},warn")
}

/// Install the global subscriber. Later calls are ignored.
pub fn init_logging(level: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(level)));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Sessions and the server produce:
//!     → logging.rs (structured log events, per-session spans)
//!     → metrics.rs (counters, gauges)
//!     → progress.rs (throttled capture progress, human byte sizes)
//!
//! Consumers:
//!     → stdout
//!     → Metrics endpoint (Prometheus scrape, optional)
//! ```

pub mod logging;
pub mod metrics;
pub mod progress;

//! Forward HTTP proxy with CONNECT tunneling, optional upstream chaining and
//! capture of matching response bodies.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ net::listener ──▶ http::server ──┬─ CONNECT ──▶ session::tunnel ──▶ target / upstream
//!                                                 │
//!                                                 └─ other ────▶ session::forward ──▶ origin / upstream
//!                                                                     │
//!                                                                     └─▶ session::capture ──▶ capturePath/
//!
//!     Cross-cutting: config (load, validate, hot reload) · latch (stage signals)
//!                    observability (logging, metrics) · lifecycle (startup, shutdown)
//! ```

pub mod config;
pub mod http;
pub mod latch;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod session;

pub use config::ProxyConfig;
pub use http::HttpServer;
pub use latch::Latch;
pub use lifecycle::Shutdown;

//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (hyper HTTP/1.1 with upgrades, CONNECT vs. Axum dispatch)
//!     → session (forward or tunnel)
//!         → headers.rs (strip proxy-* headers)
//!         → client.rs (fresh outbound connection per request / tunnel)
//!         → response.rs (head + streamed body back to the client)
//! ```

pub mod client;
pub mod headers;
pub mod response;
pub mod server;

pub use server::HttpServer;

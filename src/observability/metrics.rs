//! Metrics collection and exposition.
//!
//! # Metrics
//! - `proxy_sessions_total` (counter): sessions started, by kind
//! - `proxy_session_errors_total` (counter): failed sessions, by error kind
//! - `proxy_auth_retries_total` (counter): upstream 407 challenges answered
//! - `proxy_captures_total` (counter): captures by outcome
//! - `proxy_captured_bytes_total` (counter): bytes written to capture files
//! - `proxy_active_tunnels` (gauge): CONNECT relays currently open
//!
//! # Design Decisions
//! - Recording is a no-op until a recorder is installed, so tests and
//!   deployments without a metrics address pay nothing

use std::net::SocketAddr;

use metrics::{counter, gauge};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape listener.
pub fn init_metrics(addr: SocketAddr) {
    let builder = PrometheusBuilder::new().with_http_listener(addr);

    match builder.install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_session(kind: &'static str) {
    counter!("proxy_sessions_total", "kind" => kind).increment(1);
}

pub fn record_session_error(kind: &'static str) {
    counter!("proxy_session_errors_total", "kind" => kind).increment(1);
}

pub fn record_auth_retry() {
    counter!("proxy_auth_retries_total").increment(1);
}

/// Record a finished capture; `outcome` is `completed`, `aborted` or
/// `open_failed`.
pub fn record_capture(outcome: &'static str, bytes: u64) {
    counter!("proxy_captures_total", "outcome" => outcome).increment(1);
    counter!("proxy_captured_bytes_total").increment(bytes);
}

/// Track an open tunnel until the returned guard drops.
pub fn tunnel_opened() -> TunnelGauge {
    gauge!("proxy_active_tunnels").increment(1.0);
    TunnelGauge
}

/// Decrements `proxy_active_tunnels` on drop.
#[derive(Debug)]
pub struct TunnelGauge;

impl Drop for TunnelGauge {
    fn drop(&mut self) {
        gauge!("proxy_active_tunnels").decrement(1.0);
    }
}

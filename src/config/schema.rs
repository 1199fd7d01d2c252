//! Configuration schema definitions.
//!
//! Keys are camelCase so an existing `config.json` such as
//!
//! ```json
//! {
//!   "port": 5865,
//!   "proxy": { "hostname": "corp-proxy", "port": 8080, "username": "u", "password": "p" },
//!   "capturePattern": "\\.(iso|zip)$",
//!   "capturePath": "downloads",
//!   "logLevel": "debug"
//! }
//! ```
//!
//! deserializes unchanged.

use std::path::PathBuf;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Default partial-capture deletion delay.
pub const DEFAULT_CAPTURE_GRACE_MS: u64 = 5_000;

/// Port used when neither the config nor the command line names one.
pub const DEFAULT_PORT: u16 = 5865;

/// Root configuration for the forward proxy.
///
/// An immutable snapshot of this struct is handed to every session at
/// construction; a reload swaps in a new snapshot without touching sessions
/// already running.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Listening port.
    pub port: Option<u16>,

    /// Upstream proxy to chain through. `None` means connect directly.
    pub proxy: Option<UpstreamProxyConfig>,

    /// Regular expression matched against request paths to decide capture.
    pub capture_pattern: Option<String>,

    /// Directory captured bodies are written to.
    pub capture_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: Option<String>,

    /// Delay before a partially captured file is deleted, in milliseconds.
    pub capture_grace_ms: u64,

    /// Maximum concurrent client connections (backpressure).
    pub max_connections: usize,

    /// Prometheus scrape endpoint bind address.
    pub metrics_address: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            port: None,
            proxy: None,
            capture_pattern: None,
            capture_path: None,
            log_level: None,
            capture_grace_ms: DEFAULT_CAPTURE_GRACE_MS,
            max_connections: 10_000,
            metrics_address: None,
        }
    }
}

/// Upstream proxy used for chaining.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct UpstreamProxyConfig {
    pub hostname: String,

    #[serde(default = "default_upstream_port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

fn default_upstream_port() -> u16 {
    80
}

impl UpstreamProxyConfig {
    /// `host:port` of the upstream proxy.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    /// `Basic <base64(username:password)>`, when a username is configured.
    pub fn basic_authorization(&self) -> Option<String> {
        let username = self.username.as_deref()?;
        let password = self.password.as_deref().unwrap_or_default();
        let token = base64::engine::general_purpose::STANDARD
            .encode(format!("{username}:{password}"));
        Some(format!("Basic {token}"))
    }
}

//! Startup helpers.
//!
//! # Design Decisions
//! - A missing config file means defaults; an unreadable or invalid one is
//!   fatal
//! - Port precedence: config file, then command line / environment, then
//!   [`DEFAULT_PORT`]

use std::path::Path;

use crate::config::{load_config, ConfigError, ProxyConfig, DEFAULT_PORT};

/// Load the startup configuration from `path`.
pub fn load_initial_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "Config file not found, using defaults");
        return Ok(ProxyConfig::default());
    }

    let config = load_config(path)?;
    tracing::info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

/// Listening port for `config`, given the command-line / environment value.
pub fn resolve_port(config: &ProxyConfig, fallback: Option<u16>) -> u16 {
    config.port.or(fallback).unwrap_or(DEFAULT_PORT)
}

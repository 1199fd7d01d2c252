//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check the capture pattern compiles
//! - Validate value ranges (ports, connection limits, addresses)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use crate::config::schema::ProxyConfig;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("capturePattern is not a valid regular expression: {0}")]
    InvalidCapturePattern(String),

    #[error("proxy.hostname must not be empty")]
    EmptyUpstreamHostname,

    #[error("proxy.port must not be 0")]
    ZeroUpstreamPort,

    #[error("proxy.password is set without proxy.username")]
    PasswordWithoutUsername,

    #[error("maxConnections must be greater than 0")]
    ZeroMaxConnections,

    #[error("metricsAddress `{0}` is not a socket address")]
    InvalidMetricsAddress(String),
}

/// Validate a parsed configuration.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if let Some(pattern) = &config.capture_pattern {
        if let Err(e) = regex::Regex::new(pattern) {
            errors.push(ValidationError::InvalidCapturePattern(e.to_string()));
        }
    }

    if let Some(proxy) = &config.proxy {
        if proxy.hostname.trim().is_empty() {
            errors.push(ValidationError::EmptyUpstreamHostname);
        }
        if proxy.port == 0 {
            errors.push(ValidationError::ZeroUpstreamPort);
        }
        if proxy.password.is_some() && proxy.username.is_none() {
            errors.push(ValidationError::PasswordWithoutUsername);
        }
    }

    if config.max_connections == 0 {
        errors.push(ValidationError::ZeroMaxConnections);
    }

    if let Some(address) = &config.metrics_address {
        if address.parse::<SocketAddr>().is_err() {
            errors.push(ValidationError::InvalidMetricsAddress(address.clone()));
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

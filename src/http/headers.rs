//! Proxy header filtering.
//!
//! Any header whose name starts with `proxy-` (case-insensitive) is addressed
//! to the proxy hop it arrived on and is never forwarded, in either direction.

use axum::http::HeaderMap;

const PROXY_PREFIX: &str = "proxy-";

/// Whether `name` is a proxy hop header.
pub fn is_proxy_header(name: &str) -> bool {
    name.len() >= PROXY_PREFIX.len()
        && name.as_bytes()[..PROXY_PREFIX.len()].eq_ignore_ascii_case(PROXY_PREFIX.as_bytes())
}

/// Copy of `headers` without proxy hop headers. Repeated headers keep their
/// order.
pub fn strip_proxy_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if !is_proxy_header(name.as_str()) {
            filtered.append(name.clone(), value.clone());
        }
    }
    filtered
}

//! Outbound request descriptor.
//!
//! # Responsibilities
//! - Resolve the true destination of an absolute-form proxy request
//! - Pick the connection target: the destination itself or the upstream proxy
//! - Pick the request-target form: origin-form direct, absolute-form chained
//! - Strip proxy hop headers; pin `Host` when chaining

use axum::http::header::{HeaderName, HOST};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Method, Request, Uri};
use bytes::Bytes;
use http_body_util::Full;

use crate::config::UpstreamProxyConfig;
use crate::http::headers::strip_proxy_headers;
use crate::session::SessionError;

/// Where a request is ultimately going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    /// Parse the destination out of an absolute-form request URI.
    pub fn from_uri(uri: &Uri) -> Result<Self, SessionError> {
        let host = uri.host().ok_or_else(|| {
            SessionError::InvalidTarget(format!("`{uri}` is not an absolute URL"))
        })?;
        let port = uri.port_u16().unwrap_or(80);

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A fully prepared outbound request, minus its body.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// Host to open the TCP connection to.
    pub host: String,
    /// Port to open the TCP connection to.
    pub port: u16,
    pub method: Method,
    /// Request-target as written on the wire.
    pub target: String,
    pub headers: HeaderMap,
}

impl OutboundRequest {
    /// Derive the outbound request for an inbound proxy request.
    pub fn derive(
        inbound: &Parts,
        upstream: Option<&UpstreamProxyConfig>,
    ) -> Result<Self, SessionError> {
        let destination = Destination::from_uri(&inbound.uri)?;
        let mut headers = strip_proxy_headers(&inbound.headers);

        match upstream {
            Some(proxy) => {
                let host = HeaderValue::from_str(&destination.authority())
                    .map_err(|e| SessionError::InvalidTarget(e.to_string()))?;
                headers.insert(HOST, host);

                Ok(Self {
                    host: proxy.hostname.clone(),
                    port: proxy.port,
                    method: inbound.method.clone(),
                    target: inbound.uri.to_string(),
                    headers,
                })
            }
            None => Ok(Self {
                host: destination.host,
                port: destination.port,
                method: inbound.method.clone(),
                target: inbound
                    .uri
                    .path_and_query()
                    .map(|pq| pq.as_str().to_string())
                    .unwrap_or_else(|| "/".to_string()),
                headers,
            }),
        }
    }

    /// `host:port` the request is sent to.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Copy of this request with one more header appended.
    pub fn with_header(&self, name: HeaderName, value: HeaderValue) -> Self {
        let mut request = self.clone();
        request.headers.append(name, value);
        request
    }

    /// Build the hyper request carrying `body`.
    pub fn to_request(&self, body: Bytes) -> Result<Request<Full<Bytes>>, axum::http::Error> {
        let mut request = Request::builder()
            .method(self.method.clone())
            .uri(self.target.as_str())
            .body(Full::new(body))?;
        *request.headers_mut() = self.headers.clone();
        Ok(request)
    }
}

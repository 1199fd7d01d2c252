//! Outbound HTTP/1.1 transport.
//!
//! # Responsibilities
//! - Open one TCP connection per outbound request (no pooling)
//! - Send a prepared request and hand back the response head + streaming body
//! - Open CONNECT tunnels, directly or through an upstream proxy
//!
//! # Design Decisions
//! - Request targets are written exactly as given, so the same code sends
//!   origin-form (`/path?q`) and absolute-form (`http://host/path`) requests
//! - The connection driver runs on its own task and ends with the response body
//! - No timeouts: a hung upstream holds its session open

use axum::http::{HeaderMap, Method, Request, Response, StatusCode};
use bytes::Bytes;
use http_body_util::{Empty, Full};
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

type ClientBuilder = hyper::client::conn::http1::Builder;

/// Errors from the outbound transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {authority} failed: {source}")]
    Connect {
        authority: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Hyper(#[from] hyper::Error),

    #[error("invalid outbound request: {0}")]
    Request(#[from] axum::http::Error),

    #[error("upstream proxy answered CONNECT with {0}")]
    Rejected(StatusCode),
}

/// A byte stream that can sit on one side of a tunnel.
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelIo for T {}

/// The target side of an established tunnel.
pub type TunnelStream = Box<dyn TunnelIo>;

fn client_builder() -> ClientBuilder {
    let mut builder = ClientBuilder::new();
    builder.preserve_header_case(true).title_case_headers(true);
    builder
}

async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream, TransportError> {
    TcpStream::connect((host, port))
        .await
        .map_err(|source| TransportError::Connect {
            authority: format!("{host}:{port}"),
            source,
        })
}

/// Send `request` over a fresh connection to `host:port`.
pub async fn send_request(
    host: &str,
    port: u16,
    request: Request<Full<Bytes>>,
) -> Result<Response<Incoming>, TransportError> {
    let stream = connect_tcp(host, port).await?;
    let (mut sender, conn) = client_builder().handshake(TokioIo::new(stream)).await?;

    tokio::spawn(async move {
        if let Err(err) = conn.await {
            tracing::debug!(error = %err, "Outbound connection closed with error");
        }
    });

    Ok(sender.send_request(request).await?)
}

/// Open a raw TCP connection to `host:port` for a direct tunnel.
pub async fn connect_direct(host: &str, port: u16) -> Result<TunnelStream, TransportError> {
    let stream = connect_tcp(host, port).await?;
    Ok(Box::new(stream))
}

/// Ask the upstream proxy at `proxy_host:proxy_port` to CONNECT to `target`.
///
/// Any bytes the upstream sent past its response head travel inside the
/// returned stream.
pub async fn connect_via_proxy(
    proxy_host: &str,
    proxy_port: u16,
    target: &str,
    headers: HeaderMap,
) -> Result<TunnelStream, TransportError> {
    let stream = connect_tcp(proxy_host, proxy_port).await?;
    let (mut sender, conn) = client_builder().handshake(TokioIo::new(stream)).await?;

    tokio::spawn(async move {
        if let Err(err) = conn.with_upgrades().await {
            tracing::debug!(error = %err, "Upstream CONNECT connection closed with error");
        }
    });

    let mut request = Request::builder()
        .method(Method::CONNECT)
        .uri(target)
        .body(Empty::<Bytes>::new())?;
    *request.headers_mut() = headers;

    let response = sender.send_request(request).await?;
    if response.status() != StatusCode::OK {
        return Err(TransportError::Rejected(response.status()));
    }

    let upgraded: Upgraded = hyper::upgrade::on(response).await?;
    Ok(Box::new(TokioIo::new(upgraded)))
}

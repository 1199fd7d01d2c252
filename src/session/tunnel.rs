//! Tunnel session: one CONNECT request.
//!
//! # Data Flow
//! ```text
//! CONNECT host:port
//!     → direct TCP connect | CONNECT through the upstream proxy
//!     → connect: 200 Connection Established, then a full-duplex byte relay
//!
//!     error ◀── bad target, connect failure, non-200 from upstream;
//!               the client connection is closed without a response
//! ```
//!
//! # Design Decisions
//! - The target side is connected before the client gets its 200, so the
//!   client never sees an established tunnel that leads nowhere
//! - The relay runs on its own task once hyper hands over the client socket;
//!   bytes either side sent early travel inside the upgraded streams

use std::sync::Arc;

use axum::body::Body;
use axum::http::header::PROXY_AUTHORIZATION;
use axum::http::{HeaderValue, Request, Response, StatusCode, Uri};
use hyper::body::Incoming;
use hyper::ext::ReasonPhrase;
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::config::ProxyConfig;
use crate::http::client::{connect_direct, connect_via_proxy, TransportError, TunnelStream};
use crate::http::headers::strip_proxy_headers;
use crate::latch::Latch;
use crate::observability::metrics;
use crate::session::{SessionError, SessionId};

pub const CONNECT: &str = "connect";
pub const ERROR: &str = "error";

const DEFAULT_TUNNEL_PORT: u16 = 443;

/// How the target side of a tunnel was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    Upstream,
}

/// Payload carried by each tunnel-session flag.
#[derive(Debug, Clone)]
pub enum TunnelStage {
    Connected(Route),
    Failed(Arc<SessionError>),
}

/// Parsed CONNECT target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

impl ConnectTarget {
    pub fn from_uri(uri: &Uri) -> Result<Self, SessionError> {
        let authority = uri.authority().ok_or_else(|| {
            SessionError::InvalidTarget(format!("`{uri}` is not a host:port authority"))
        })?;

        Ok(Self {
            host: authority.host().to_string(),
            port: authority.port_u16().unwrap_or(DEFAULT_TUNNEL_PORT),
        })
    }

    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Drives one CONNECT request.
pub struct TunnelSession {
    id: SessionId,
    latch: Latch<TunnelStage>,
    stages: mpsc::UnboundedReceiver<TunnelStage>,
    request: Request<Incoming>,
    config: Arc<ProxyConfig>,
    target: Option<ConnectTarget>,
    upstream: Option<TunnelStream>,
}

impl TunnelSession {
    pub fn new(id: SessionId, request: Request<Incoming>, config: Arc<ProxyConfig>) -> Self {
        let (tx, stages) = mpsc::unbounded_channel();

        let mut latch = Latch::new();
        // Nothing has fired yet, so registration replays nothing.
        let _ = latch.register("connect error", move |stage: &TunnelStage| {
            tx.send(stage.clone())
                .map_err(|_| "tunnel session stopped".into())
        });

        Self {
            id,
            latch,
            stages,
            request,
            config,
            target: None,
            upstream: None,
        }
    }

    /// Establish the tunnel.
    ///
    /// On success the returned response must be sent to the client; the relay
    /// starts as soon as hyper upgrades the connection. On failure the client
    /// connection should be closed.
    pub async fn run(self) -> Result<Response<Body>, Arc<SessionError>> {
        let span = tracing::info_span!("tunnel", id = %self.id, authority = %self.request.uri());
        self.drive().instrument(span).await
    }

    async fn drive(mut self) -> Result<Response<Body>, Arc<SessionError>> {
        metrics::record_session("tunnel");
        self.connect().await;

        let stage = self.stages.recv().await;
        match stage {
            Some(TunnelStage::Connected(route)) => Ok(self.relay(route)),
            Some(TunnelStage::Failed(err)) => {
                metrics::record_session_error(err.kind());
                tracing::info!(error = %err, "Failed to CONNECT to {}", self.request.uri());
                Err(err)
            }
            None => Err(Arc::new(SessionError::NoResponse)),
        }
    }

    fn advance(&mut self, flag: &str, stage: TunnelStage) {
        if let Err(e) = self.latch.fire(flag, stage) {
            tracing::error!(error = %e, "Stage dispatch failed");
        }
    }

    async fn connect(&mut self) {
        let target = match ConnectTarget::from_uri(self.request.uri()) {
            Ok(target) => target,
            Err(e) => return self.advance(ERROR, TunnelStage::Failed(Arc::new(e))),
        };

        let (route, result) = match self.config.proxy.as_ref() {
            Some(upstream) => {
                let mut headers = strip_proxy_headers(self.request.headers());
                if let Some(authorization) = upstream.basic_authorization() {
                    match HeaderValue::from_str(&authorization) {
                        Ok(value) => {
                            headers.insert(PROXY_AUTHORIZATION, value);
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Upstream credentials are not a valid header value")
                        }
                    }
                }
                let result = connect_via_proxy(
                    &upstream.hostname,
                    upstream.port,
                    &target.authority(),
                    headers,
                )
                .await;
                (Route::Upstream, result)
            }
            None => (Route::Direct, connect_direct(&target.host, target.port).await),
        };

        match result {
            Ok(stream) => {
                tracing::debug!(route = ?route, "CONNECT-ed to {}", target.authority());
                self.upstream = Some(stream);
                self.target = Some(target);
                self.advance(CONNECT, TunnelStage::Connected(route));
            }
            Err(source) => {
                let err = tunnel_error(&target, source);
                self.advance(ERROR, TunnelStage::Failed(Arc::new(err)));
            }
        }
    }

    /// Spawn the byte relay and build the establishment response.
    fn relay(mut self, route: Route) -> Response<Body> {
        let client = hyper::upgrade::on(&mut self.request);
        let upstream = self.upstream.take();
        let target = self
            .target
            .take()
            .map(|target| target.authority())
            .unwrap_or_default();

        tokio::spawn(
            async move {
                let Some(mut upstream) = upstream else {
                    return;
                };
                let mut client = match client.await {
                    Ok(upgraded) => TokioIo::new(upgraded),
                    Err(e) => {
                        tracing::debug!(error = %e, "Client never switched to the tunnel");
                        return;
                    }
                };

                let _gauge = metrics::tunnel_opened();
                match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                    Ok((sent, received)) => tracing::debug!(
                        route = ?route,
                        sent,
                        received,
                        "Tunnel to {} closed",
                        target
                    ),
                    Err(e) => tracing::debug!(error = %e, "Tunnel to {} broke", target),
                }
            }
            .in_current_span(),
        );

        established()
    }
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("id", &self.id)
            .field("latch", &self.latch)
            .field("target", &self.request.uri())
            .finish_non_exhaustive()
    }
}

fn tunnel_error(target: &ConnectTarget, source: TransportError) -> SessionError {
    SessionError::TunnelConnect {
        target: target.authority(),
        source,
    }
}

/// `200 Connection Established` with an empty body.
pub fn established() -> Response<Body> {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::OK;
    response
        .extensions_mut()
        .insert(ReasonPhrase::from_static(b"Connection Established"));
    response
}

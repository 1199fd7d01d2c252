//! HTTP server setup and dispatch.
//!
//! # Responsibilities
//! - Accept client connections under the connection limit
//! - Serve HTTP/1.1 with upgrades so CONNECT can take over the socket
//! - Dispatch CONNECT to a tunnel session, everything else through the Axum
//!   router to a forward session
//! - Swap in reloaded configuration snapshots
//! - Drain in-flight connections on shutdown

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::State,
    http::{Method, Request},
    response::Response,
    BoxError, Router,
};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tower::ServiceExt;
use tower_http::trace::TraceLayer;

use crate::config::ProxyConfig;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{ConnectionPermit, Listener, ListenerError};
use crate::session::capture::CaptureRule;
use crate::session::{CaptureStore, ForwardSession, SessionId, TunnelSession};

/// How long shutdown waits for in-flight connections.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// A configuration snapshot together with its compiled capture rule.
#[derive(Debug)]
pub struct Snapshot {
    pub config: Arc<ProxyConfig>,
    pub capture: Option<Arc<CaptureRule>>,
}

impl Snapshot {
    fn compile(config: ProxyConfig) -> Self {
        let capture = CaptureRule::from_config(&config).map(Arc::new);
        Self {
            config: Arc::new(config),
            capture,
        }
    }
}

/// State shared by every connection.
#[derive(Clone)]
pub struct AppState {
    live: Arc<ArcSwap<Snapshot>>,
    captures: CaptureStore,
}

impl AppState {
    fn new(config: ProxyConfig) -> Self {
        Self {
            live: Arc::new(ArcSwap::from_pointee(Snapshot::compile(config))),
            captures: CaptureStore::new(),
        }
    }

    /// The snapshot new sessions start with.
    pub fn current(&self) -> Arc<Snapshot> {
        self.live.load_full()
    }

    /// The configuration of the current snapshot.
    pub fn snapshot(&self) -> Arc<ProxyConfig> {
        Arc::clone(&self.live.load().config)
    }

    fn apply(&self, config: ProxyConfig) {
        let previous = self.snapshot();
        if previous.log_level != config.log_level {
            tracing::warn!("logLevel changes take effect after a restart");
        }
        if previous.port != config.port {
            tracing::warn!("port changes take effect after a restart");
        }

        tracing::info!(
            chaining = config.proxy.is_some(),
            capture_pattern = ?config.capture_pattern,
            "Configuration reloaded"
        );
        self.live.store(Arc::new(Snapshot::compile(config)));
    }
}

/// HTTP server for the forward proxy.
pub struct HttpServer {
    router: Router,
    state: AppState,
}

impl HttpServer {
    pub fn new(config: ProxyConfig) -> Self {
        let state = AppState::new(config);
        let router = Self::build_router(state.clone());
        Self { router, state }
    }

    /// Every non-CONNECT request, whatever its path, becomes a forward session.
    fn build_router(state: AppState) -> Router {
        Router::new()
            .fallback(forward_handler)
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<ProxyConfig> {
        self.state.snapshot()
    }

    /// Serve until `shutdown` fires, applying configs from `config_updates`
    /// as they arrive.
    pub async fn run(
        self,
        listener: TcpListener,
        mut config_updates: mpsc::UnboundedReceiver<ProxyConfig>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let max_connections = self.state.snapshot().max_connections;
        let listener = Listener::new(listener, max_connections);
        let tracker = ConnectionTracker::new();
        let mut watching = true;

        tracing::info!(
            address = %listener.local_addr()?,
            max_connections,
            "Proxy started"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _peer, permit)) => self.spawn_connection(stream, permit, &tracker),
                    Err(ListenerError::Accept(e)) => {
                        tracing::warn!(error = %e, "Accept failed");
                    }
                    Err(e) => return Err(std::io::Error::other(e)),
                },
                update = config_updates.recv(), if watching => match update {
                    Some(config) => self.state.apply(config),
                    None => watching = false,
                },
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, no longer accepting connections");
                    break;
                }
            }
        }

        drop(listener);

        let open = tracker.active_count();
        if open > 0 {
            tracing::info!(open, "Draining connections");
            if !tracker.drain(DRAIN_TIMEOUT).await {
                tracing::warn!(
                    remaining = tracker.active_count(),
                    "Drain timed out, dropping connections"
                );
            }
        }

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    fn spawn_connection(&self, stream: TcpStream, permit: ConnectionPermit, tracker: &ConnectionTracker) {
        let guard = tracker.track();
        let router = self.router.clone();
        let state = self.state.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let io = TokioIo::new(stream);
            let service = service_fn(move |request| dispatch(router.clone(), state.clone(), request));

            // The tunnel line must reach the client with no extra headers.
            let served = http1::Builder::new()
                .preserve_header_case(true)
                .title_case_headers(true)
                .auto_date_header(false)
                .serve_connection(io, service)
                .with_upgrades()
                .await;

            if let Err(e) = served {
                tracing::debug!(connection_id = %guard.id(), error = %e, "Connection ended with error");
            }
        });
    }
}

/// Route one request: CONNECT to a tunnel, everything else to the router.
///
/// A failed tunnel returns an error, which makes hyper close the client
/// connection without a response.
async fn dispatch(
    router: Router,
    state: AppState,
    request: Request<Incoming>,
) -> Result<Response, BoxError> {
    if request.method() == Method::CONNECT {
        let session = TunnelSession::new(SessionId::tunnel(), request, state.snapshot());
        return session.run().await.map_err(BoxError::from);
    }

    match router.oneshot(request).await {
        Ok(response) => Ok(response),
        Err(infallible) => match infallible {},
    }
}

async fn forward_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let live = state.current();
    let (session, pending) = ForwardSession::new(
        SessionId::forward(),
        request,
        Arc::clone(&live.config),
        live.capture.clone(),
        state.captures.clone(),
    );
    tokio::spawn(session.run());
    pending.into_response().await
}

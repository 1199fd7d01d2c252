//! Forward session: one proxied HTTP request, end to end.
//!
//! # Data Flow
//! ```text
//! inbound request
//!     → requestbodyready (GET/HEAD: empty; otherwise whole inbound body)
//!     → firstrequest     (upstream response head + the body that was sent)
//!     → finalrequest     (after at most one Proxy-Authorization retry)
//!     → completed        (response streamed, capture closed)
//!
//!     error ◀── any stage; 502 if nothing was sent, truncated body otherwise
//! ```
//!
//! # Design Decisions
//! - Stage payloads are cheap clones (`Bytes`, response heads); the upstream
//!   response body is parked on the session and taken by the stage that
//!   streams it
//! - A capture failure never changes what the client receives

use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::config::ProxyConfig;
use crate::http::client::{send_request, TransportError};
use crate::http::headers::strip_proxy_headers;
use crate::http::response::{ClientResponder, PendingResponse};
use crate::latch::Latch;
use crate::observability::metrics;
use crate::observability::progress::format_bytes;
use crate::session::capture::{CaptureRule, CaptureSink, CaptureStore};
use crate::session::outbound::OutboundRequest;
use crate::session::{SessionError, SessionId};

pub const REQUEST_BODY_READY: &str = "requestbodyready";
pub const FIRST_REQUEST: &str = "firstrequest";
pub const FINAL_REQUEST: &str = "finalrequest";
pub const COMPLETED: &str = "completed";
pub const ERROR: &str = "error";

const ALL_STAGES: &str = "requestbodyready firstrequest finalrequest completed error";

/// Status line and headers of an upstream response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    fn of<B>(response: &Response<B>) -> Self {
        Self {
            status: response.status(),
            headers: response.headers().clone(),
        }
    }
}

/// Payload carried by each forward-session flag.
#[derive(Debug, Clone)]
pub enum Stage {
    BodyReady(Bytes),
    FirstResponse { head: ResponseHead, body: Bytes },
    FinalResponse(ResponseHead),
    Completed { bytes: u64 },
    Failed(Arc<SessionError>),
}

/// Drives one non-CONNECT request through the proxy.
pub struct ForwardSession {
    id: SessionId,
    latch: Latch<Stage>,
    stages: mpsc::UnboundedReceiver<Stage>,
    parts: Parts,
    body: Option<Body>,
    config: Arc<ProxyConfig>,
    capture_rule: Option<Arc<CaptureRule>>,
    captures: CaptureStore,
    responder: ClientResponder,
    outbound: Option<OutboundRequest>,
    upstream: Option<Response<Incoming>>,
    capture: Option<CaptureSink>,
    bytes: u64,
}

impl ForwardSession {
    /// Create a session for `request` against the configuration snapshot
    /// `config` and its compiled `capture_rule`. The returned
    /// [`PendingResponse`] resolves once the session has a response head for
    /// the client.
    pub fn new(
        id: SessionId,
        request: Request<Body>,
        config: Arc<ProxyConfig>,
        capture_rule: Option<Arc<CaptureRule>>,
        captures: CaptureStore,
    ) -> (Self, PendingResponse) {
        let (parts, body) = request.into_parts();
        let (responder, pending) = ClientResponder::channel();
        let (tx, stages) = mpsc::unbounded_channel();

        let mut latch = Latch::new();
        // Nothing has fired yet, so registration replays nothing.
        let _ = latch.register(ALL_STAGES, move |stage: &Stage| {
            tx.send(stage.clone())
                .map_err(|_| "forward session stopped".into())
        });

        let session = Self {
            id,
            latch,
            stages,
            parts,
            body: Some(body),
            config,
            capture_rule,
            captures,
            responder,
            outbound: None,
            upstream: None,
            capture: None,
            bytes: 0,
        };
        (session, pending)
    }

    /// Run every stage to completion or failure.
    pub async fn run(self) {
        let span = tracing::info_span!(
            "forward",
            id = %self.id,
            method = %self.parts.method,
            uri = %self.parts.uri,
        );
        self.drive().instrument(span).await
    }

    async fn drive(mut self) {
        metrics::record_session("forward");
        tracing::debug!("New session for {}", self.parts.uri);

        self.read_body().await;

        while let Some(stage) = self.stages.recv().await {
            match stage {
                Stage::BodyReady(body) => self.send_upstream(body).await,
                Stage::FirstResponse { head, body } => self.answer_challenge(head, body).await,
                Stage::FinalResponse(head) => self.stream_response(head).await,
                Stage::Completed { bytes } => {
                    tracing::debug!(bytes, "Completed {} {}", self.parts.method, self.parts.uri);
                    break;
                }
                Stage::Failed(err) => {
                    self.fail(&err).await;
                    break;
                }
            }
        }
    }

    fn advance(&mut self, flag: &str, stage: Stage) {
        tracing::debug!(flag, "Stage reached");
        if let Err(e) = self.latch.fire(flag, stage) {
            tracing::error!(error = %e, "Stage dispatch failed");
        }
    }

    fn fail_with(&mut self, err: SessionError) {
        self.advance(ERROR, Stage::Failed(Arc::new(err)));
    }

    async fn read_body(&mut self) {
        let outbound = match OutboundRequest::derive(&self.parts, self.config.proxy.as_ref()) {
            Ok(outbound) => outbound,
            Err(e) => return self.fail_with(e),
        };
        tracing::debug!(
            request_target = %outbound.target,
            via = %outbound.authority(),
            "Outbound request prepared"
        );
        self.outbound = Some(outbound);

        let body = self.body.take().unwrap_or_else(Body::empty);
        if self.parts.method == Method::GET || self.parts.method == Method::HEAD {
            return self.advance(REQUEST_BODY_READY, Stage::BodyReady(Bytes::new()));
        }

        tracing::debug!("Reading request body");
        match axum::body::to_bytes(body, usize::MAX).await {
            Ok(bytes) => {
                tracing::debug!("Got request body of {} bytes", bytes.len());
                self.advance(REQUEST_BODY_READY, Stage::BodyReady(bytes));
            }
            Err(e) => self.fail_with(SessionError::BodyRead(e)),
        }
    }

    async fn send_upstream(&mut self, body: Bytes) {
        let Some(outbound) = self.outbound.clone() else {
            return self.fail_with(SessionError::NoResponse);
        };

        match dispatch(&outbound, body.clone()).await {
            Ok(response) => {
                let head = ResponseHead::of(&response);
                self.upstream = Some(response);
                self.advance(FIRST_REQUEST, Stage::FirstResponse { head, body });
            }
            Err(e) => self.fail_with(e),
        }
    }

    async fn answer_challenge(&mut self, head: ResponseHead, body: Bytes) {
        let Some(authorization) = self.challenge_credentials(&head) else {
            return self.advance(FINAL_REQUEST, Stage::FinalResponse(head));
        };
        let Some(outbound) = self.outbound.as_ref() else {
            return self.fail_with(SessionError::NoResponse);
        };

        tracing::debug!("Upstream proxy asked for credentials, retrying once");
        metrics::record_auth_retry();
        let retried = outbound.with_header(PROXY_AUTHORIZATION, authorization);

        // Release the challenged connection before opening the next one.
        self.upstream = None;

        match dispatch(&retried, body).await {
            Ok(response) => {
                let head = ResponseHead::of(&response);
                self.upstream = Some(response);
                self.advance(FINAL_REQUEST, Stage::FinalResponse(head));
            }
            Err(e) => self.fail_with(e),
        }
    }

    /// `Proxy-Authorization` value to retry with, if `head` is a challenge
    /// from the configured upstream and credentials are configured.
    fn challenge_credentials(&self, head: &ResponseHead) -> Option<HeaderValue> {
        let upstream = self.config.proxy.as_ref()?;
        if head.status != StatusCode::PROXY_AUTHENTICATION_REQUIRED
            || !head.headers.contains_key(PROXY_AUTHENTICATE)
        {
            return None;
        }

        let authorization = upstream.basic_authorization()?;
        match HeaderValue::from_str(&authorization) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "Upstream credentials are not a valid header value");
                None
            }
        }
    }

    async fn stream_response(&mut self, head: ResponseHead) {
        let Some(response) = self.upstream.take() else {
            return self.fail_with(SessionError::NoResponse);
        };

        tracing::debug!(status = %head.status, "Sending response head to client");
        if let Err(e) = self
            .responder
            .send_head(head.status, strip_proxy_headers(&head.headers))
        {
            return self.fail_with(e.into());
        }

        self.open_capture(&head).await;

        let mut body = response.into_body();
        while let Some(frame) = body.frame().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::debug!("Response body aborted");
                    return self.fail_with(SessionError::StreamAborted(e));
                }
            };
            let Ok(data) = frame.into_data() else {
                continue;
            };

            self.bytes += data.len() as u64;
            self.write_capture(&data).await;

            if let Err(e) = self.responder.write(data).await {
                return self.fail_with(e.into());
            }
        }

        self.responder.finish();
        tracing::debug!("Response body finished");

        if let Some(sink) = self.capture.take() {
            if let Err(e) = sink.finish().await {
                tracing::warn!(error = %e, "Failed to flush capture file");
            }
        }

        let bytes = self.bytes;
        self.advance(COMPLETED, Stage::Completed { bytes });
    }

    async fn open_capture(&mut self, head: &ResponseHead) {
        let Some(rule) = self.capture_rule.clone() else {
            return;
        };
        let path = self.parts.uri.path();
        if !rule.applies(head.status, path) {
            return;
        }

        let file = rule.file_for(path);
        tracing::debug!(file = %file.display(), "Creating capture file");

        match self.captures.open(file, rule.grace()).await {
            Ok(sink) => {
                tracing::info!("{}", capture_banner(super::capture::basename(path), &head.headers));
                self.capture = Some(sink);
            }
            Err(e) => {
                tracing::error!(error = %e, "Capture disabled for this response");
                metrics::record_capture("open_failed", 0);
            }
        }
    }

    async fn write_capture(&mut self, chunk: &[u8]) {
        let Some(sink) = self.capture.as_mut() else {
            return;
        };
        if let Err(e) = sink.write(chunk).await {
            tracing::warn!(error = %e, "Capture write failed, capture stopped");
            if let Some(sink) = self.capture.take() {
                sink.abandon().await;
            }
        }
    }

    async fn fail(&mut self, err: &SessionError) {
        metrics::record_session_error(err.kind());
        tracing::info!(error = %err, "Request {} {} failed", self.parts.method, self.parts.uri);

        if let Some(sink) = self.capture.take() {
            sink.abandon().await;
        }

        if self.responder.head_sent() {
            self.responder.abort(&err.to_string()).await;
        } else if self
            .responder
            .send_complete(StatusCode::BAD_GATEWAY, err.to_string())
            .is_err()
        {
            tracing::debug!("Client left before the error response");
        }
    }
}

impl std::fmt::Debug for ForwardSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardSession")
            .field("id", &self.id)
            .field("latch", &self.latch)
            .field("bytes", &self.bytes)
            .finish_non_exhaustive()
    }
}

/// `Start capturing to <name>`, with the declared size when the upstream
/// sent a usable `content-length`.
fn capture_banner(name: &str, headers: &HeaderMap) -> String {
    let declared = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());

    match declared {
        Some(len) => format!("Start capturing to {name} ({})", format_bytes(len)),
        None => format!("Start capturing to {name}"),
    }
}

async fn dispatch(outbound: &OutboundRequest, body: Bytes) -> Result<Response<Incoming>, SessionError> {
    let upstream_error = |source: TransportError| SessionError::UpstreamConnect {
        authority: outbound.authority(),
        source,
    };

    let request = outbound
        .to_request(body)
        .map_err(|e| upstream_error(e.into()))?;
    send_request(&outbound.host, outbound.port, request)
        .await
        .map_err(upstream_error)
}

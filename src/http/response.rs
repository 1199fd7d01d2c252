//! Client-facing response handle.
//!
//! # Responsibilities
//! - Hand the response head to the waiting request handler exactly once
//! - Stream body chunks to the client after the head is sent
//! - Abort the client body when the upstream stream fails mid-transfer
//!
//! # Design Decisions
//! - Streaming responses avoid buffering entire body
//! - Bounded body channel: a slow client applies backpressure to the upstream
//! - Once the head is sent no second status can be emitted; callers check
//!   [`ClientResponder::head_sent`] before reporting an error

use std::io;

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

const BODY_CHANNEL_CAPACITY: usize = 16;

/// The client went away before the proxy finished answering.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("client connection closed")]
pub struct ClientGone;

type BodyItem = Result<Bytes, io::Error>;

/// Write side of a response owned by a session.
#[derive(Debug)]
pub struct ClientResponder {
    head: Option<oneshot::Sender<Response>>,
    body: Option<mpsc::Sender<BodyItem>>,
}

/// Read side awaited by the request handler.
#[derive(Debug)]
pub struct PendingResponse {
    head: oneshot::Receiver<Response>,
}

impl ClientResponder {
    /// Create a connected responder / pending response pair.
    pub fn channel() -> (Self, PendingResponse) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                head: Some(tx),
                body: None,
            },
            PendingResponse { head: rx },
        )
    }

    /// Whether a status line has already gone to the client.
    pub fn head_sent(&self) -> bool {
        self.head.is_none()
    }

    /// Send status and headers; the body follows through [`Self::write`].
    pub fn send_head(&mut self, status: StatusCode, headers: HeaderMap) -> Result<(), ClientGone> {
        let head = self.head.take().ok_or(ClientGone)?;
        let (tx, rx) = mpsc::channel::<BodyItem>(BODY_CHANNEL_CAPACITY);

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        let mut response = Response::new(Body::from_stream(stream));
        *response.status_mut() = status;
        *response.headers_mut() = headers;

        head.send(response).map_err(|_| ClientGone)?;
        self.body = Some(tx);
        Ok(())
    }

    /// Send a complete response with a plain-text body.
    pub fn send_complete(&mut self, status: StatusCode, message: String) -> Result<(), ClientGone> {
        let head = self.head.take().ok_or(ClientGone)?;
        head.send((status, message).into_response())
            .map_err(|_| ClientGone)
    }

    /// Stream one body chunk to the client.
    pub async fn write(&mut self, chunk: Bytes) -> Result<(), ClientGone> {
        let body = self.body.as_ref().ok_or(ClientGone)?;
        body.send(Ok(chunk)).await.map_err(|_| ClientGone)
    }

    /// End the body normally.
    pub fn finish(&mut self) {
        self.body = None;
    }

    /// End the body with an error so the client sees a truncated transfer
    /// instead of a clean end of message.
    pub async fn abort(&mut self, reason: &str) {
        if let Some(body) = self.body.take() {
            let _ = body
                .send(Err(io::Error::new(io::ErrorKind::ConnectionAborted, reason.to_string())))
                .await;
        }
    }
}

impl PendingResponse {
    /// Wait for the session to produce a response.
    pub async fn into_response(self) -> Response {
        match self.head.await {
            Ok(response) => response,
            Err(_) => (StatusCode::BAD_GATEWAY, "proxy session ended without a response")
                .into_response(),
        }
    }
}

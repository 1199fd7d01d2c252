//! Per-request and per-tunnel session orchestration.
//!
//! # Data Flow
//! ```text
//! Forward (any method except CONNECT):
//!     requestbodyready → firstrequest → [407 retry] → finalrequest
//!         → stream to client (+ capture) → completed
//!
//! Tunnel (CONNECT):
//!     direct TCP connect | upstream CONNECT → connect → byte relay
//!
//! Any stage may fire `error`, which ends the session.
//! ```
//!
//! # Design Decisions
//! - Each session owns a [`Latch`](crate::latch::Latch); latch handlers only
//!   enqueue the next stage, the session task executes it
//! - A stage is only ever fired by the previous stage's execution, so stages
//!   run strictly in order and at most once
//! - The configuration snapshot is read once, at construction

pub mod capture;
pub mod forward;
pub mod outbound;
pub mod tunnel;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::http::client::TransportError;
use crate::http::response::ClientGone;

pub use capture::CaptureStore;
pub use forward::ForwardSession;
pub use tunnel::TunnelSession;

static SESSION_SEQ: AtomicU64 = AtomicU64::new(1);

/// Correlation id for log lines of one session, e.g. `session#7` or
/// `tunnel#8`. Both kinds share one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    kind: &'static str,
    seq: u64,
}

impl SessionId {
    /// Allocate the next id for a forward session.
    pub fn forward() -> Self {
        Self::next("session")
    }

    /// Allocate the next id for a CONNECT tunnel.
    pub fn tunnel() -> Self {
        Self::next("tunnel")
    }

    fn next(kind: &'static str) -> Self {
        Self {
            kind,
            seq: SESSION_SEQ.fetch_add(1, Ordering::Relaxed),
        }
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.kind, self.seq)
    }
}

/// Everything that can end a session early.
///
/// All variants except [`SessionError::CaptureOpen`] end the session; the
/// message is what the client receives in the 502 body when no response has
/// been sent yet.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid request target: {0}")]
    InvalidTarget(String),

    #[error("failed to read request body: {0}")]
    BodyRead(#[source] axum::Error),

    #[error("request to {authority} failed: {source}")]
    UpstreamConnect {
        authority: String,
        #[source]
        source: TransportError,
    },

    #[error("CONNECT to {target} failed: {source}")]
    TunnelConnect {
        target: String,
        #[source]
        source: TransportError,
    },

    #[error("failed to open capture file {}: {source}", path.display())]
    CaptureOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("response stream aborted: {0}")]
    StreamAborted(#[source] hyper::Error),

    #[error("no upstream response to relay")]
    NoResponse,

    #[error(transparent)]
    ClientGone(#[from] ClientGone),
}

impl SessionError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::InvalidTarget(_) => "invalid_target",
            SessionError::BodyRead(_) => "body_read",
            SessionError::UpstreamConnect { .. } => "upstream_connect",
            SessionError::TunnelConnect { .. } => "tunnel_connect",
            SessionError::CaptureOpen { .. } => "capture_open",
            SessionError::StreamAborted(_) => "stream_aborted",
            SessionError::NoResponse => "no_response",
            SessionError::ClientGone(_) => "client_gone",
        }
    }
}

//! Best-effort capture of response bodies to local files.
//!
//! # Responsibilities
//! - Decide whether a response qualifies for capture
//! - Open, feed and close capture files
//! - Delete partial files after a grace delay when a transfer aborts
//!
//! # Design Decisions
//! - Capture never affects the client response: open and write failures are
//!   logged and capture stops
//! - Pending deletions are owned tasks keyed by path; reopening a path
//!   cancels its pending deletion so a fresh capture survives
//! - The grace delay absorbs writes still in flight on the blocking pool

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use dashmap::DashMap;
use regex::Regex;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::task::AbortHandle;

use crate::config::ProxyConfig;
use crate::observability::metrics;
use crate::observability::progress::{format_bytes, ProgressThrottle};
use crate::session::SessionError;

/// Compiled capture settings from one configuration snapshot.
#[derive(Debug, Clone)]
pub struct CaptureRule {
    pattern: Regex,
    directory: PathBuf,
    grace: Duration,
}

impl CaptureRule {
    /// `None` when no capture pattern is configured or it does not compile.
    pub fn from_config(config: &ProxyConfig) -> Option<Self> {
        let pattern = config.capture_pattern.as_deref()?;
        let pattern = match Regex::new(pattern) {
            Ok(regex) => regex,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring invalid capture pattern");
                return None;
            }
        };

        Some(Self {
            pattern,
            directory: config.capture_path.clone().unwrap_or_default(),
            grace: Duration::from_millis(config.capture_grace_ms),
        })
    }

    /// Whether a response with `status` to a request for `path` is captured.
    pub fn applies(&self, status: StatusCode, path: &str) -> bool {
        status == StatusCode::OK && self.pattern.is_match(strip_query(path))
    }

    /// File a capture of `path` is written to.
    pub fn file_for(&self, path: &str) -> PathBuf {
        self.directory.join(basename(path))
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }
}

fn strip_query(path: &str) -> &str {
    path.split_once('?').map_or(path, |(path, _)| path)
}

/// Last `/`-delimited segment of `path`, query excluded.
pub fn basename(path: &str) -> &str {
    strip_query(path).rsplit('/').next().unwrap_or_default()
}

static REMOVAL_SEQ: AtomicU64 = AtomicU64::new(1);

/// A deferred, cancelable file deletion.
#[derive(Debug)]
pub struct ScheduledRemoval {
    id: u64,
    handle: AbortHandle,
}

impl ScheduledRemoval {
    /// Cancel the deletion if it has not run yet.
    pub fn cancel(&self) {
        self.handle.abort();
    }
}

/// Opens capture files and tracks pending deletions. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct CaptureStore {
    pending: Arc<DashMap<PathBuf, ScheduledRemoval>>,
}

impl CaptureStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (truncating) a capture file, cancelling any deletion still
    /// pending for the same path.
    pub async fn open(&self, path: PathBuf, grace: Duration) -> Result<CaptureSink, SessionError> {
        if let Some((_, removal)) = self.pending.remove(&path) {
            removal.cancel();
            tracing::debug!(path = %path.display(), "Cancelled pending removal of reopened capture");
        }

        if path.file_name().is_none() {
            return Err(SessionError::CaptureOpen {
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "request path has no file name",
                ),
                path,
            });
        }

        let file = match File::create(&path).await {
            Ok(file) => file,
            Err(source) => return Err(SessionError::CaptureOpen { path, source }),
        };

        Ok(CaptureSink {
            name: display_name(&path),
            path,
            file,
            bytes: 0,
            progress: ProgressThrottle::per_second(),
            grace,
            store: self.clone(),
        })
    }

    /// Delete `path` once `grace` has elapsed.
    pub fn schedule_removal(&self, path: PathBuf, grace: Duration) {
        let id = REMOVAL_SEQ.fetch_add(1, Ordering::Relaxed);
        let pending = Arc::clone(&self.pending);
        let target = path.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            match tokio::fs::remove_file(&target).await {
                Ok(()) => tracing::debug!(path = %target.display(), "Removed partial capture"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %target.display(), error = %e, "Failed to remove partial capture")
                }
            }
            pending.remove_if(&target, |_, removal| removal.id == id);
        });

        let removal = ScheduledRemoval {
            id,
            handle: task.abort_handle(),
        };
        if let Some(previous) = self.pending.insert(path, removal) {
            previous.cancel();
        }
    }

    /// Whether a deletion is pending for `path`.
    pub fn is_pending(&self, path: &Path) -> bool {
        self.pending.contains_key(path)
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// An open capture file.
#[derive(Debug)]
pub struct CaptureSink {
    name: String,
    path: PathBuf,
    file: File,
    bytes: u64,
    progress: ProgressThrottle,
    grace: Duration,
    store: CaptureStore,
}

impl CaptureSink {
    /// Append a chunk, reporting progress at most once per second.
    pub async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.file.write_all(chunk).await?;
        self.bytes += chunk.len() as u64;

        if self.progress.ready() {
            tracing::info!(
                "Capturing to {} ({} downloaded)",
                self.name,
                format_bytes(self.bytes)
            );
        }
        Ok(())
    }

    /// Flush and close a complete capture.
    pub async fn finish(mut self) -> std::io::Result<u64> {
        self.file.flush().await?;
        tracing::info!("Captured to {} ({})", self.name, format_bytes(self.bytes));
        metrics::record_capture("completed", self.bytes);
        Ok(self.bytes)
    }

    /// Close an incomplete capture and schedule its deletion.
    pub async fn abandon(mut self) {
        tracing::warn!("Aborted during capture to {}", self.name);
        let _ = self.file.flush().await;
        metrics::record_capture("aborted", self.bytes);

        let Self {
            path, grace, store, ..
        } = self;
        store.schedule_removal(path, grace);
    }
}

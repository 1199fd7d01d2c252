//! Configuration file watcher for hot reload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::ProxyConfig;

/// A watcher that monitors the configuration file for changes.
///
/// The parent directory is watched rather than the file itself so editors
/// that save by rename keep triggering reloads.
pub struct ConfigWatcher {
    path: PathBuf,
    current: Option<ProxyConfig>,
    update_tx: mpsc::UnboundedSender<ProxyConfig>,
}

impl ConfigWatcher {
    /// Create a new ConfigWatcher.
    ///
    /// `current` is the configuration already in effect; reloads that parse to
    /// an identical value are not published. Returns the watcher and a
    /// receiver for configuration updates.
    pub fn new(
        path: &Path,
        current: Option<ProxyConfig>,
    ) -> (Self, mpsc::UnboundedReceiver<ProxyConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();

        (
            Self {
                path: path.to_path_buf(),
                current,
                update_tx,
            },
            update_rx,
        )
    }

    /// Start watching. The returned handle must be kept alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let Self {
            path,
            mut current,
            update_tx,
        } = self;

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let file_name = path.file_name().map(ToOwned::to_owned);
        let watched = path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let relevant = event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(ToOwned::to_owned) == file_name);
                    if !relevant || !(event.kind.is_modify() || event.kind.is_create()) {
                        return;
                    }

                    match load_config(&watched) {
                        Ok(new_config) if current.as_ref() == Some(&new_config) => {
                            tracing::trace!(path = ?watched, "Config file touched, content unchanged");
                        }
                        Ok(new_config) => {
                            tracing::info!(path = ?watched, "Config updated");
                            current = Some(new_config.clone());
                            let _ = update_tx.send(new_config);
                        }
                        Err(e) => {
                            tracing::error!(
                                "Failed to reload config: {}. Keeping current configuration.",
                                e
                            );
                        }
                    }
                }
                Err(e) => tracing::error!("Watch error: {:?}", e),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        tracing::info!(path = ?path, "Config watcher started");
        Ok(watcher)
    }
}

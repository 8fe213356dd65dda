//! Config source watcher for hot reload.
//!
//! Watches the discovery directory and every explicit source path,
//! signalling the service on change. The watcher only signals; merging is
//! done by the service so reload cycles can be serialized.

use std::path::Path;
use std::time::Duration;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::config::loader::ConfigSources;

/// A watcher that monitors all config sources for changes.
pub struct ConfigWatcher {
    sources: ConfigSources,
    reload_tx: mpsc::UnboundedSender<()>,
}

impl ConfigWatcher {
    /// Create a new watcher; the receiver yields one unit per detected
    /// change burst.
    pub fn new(sources: ConfigSources) -> (Self, mpsc::UnboundedReceiver<()>) {
        let (reload_tx, reload_rx) = mpsc::unbounded_channel();
        (Self { sources, reload_tx }, reload_rx)
    }

    /// Start watching in a background thread, returning the handle that
    /// keeps the watch alive.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let tx = self.reload_tx.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    if event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove() {
                        let _ = tx.send(());
                    }
                }
                Err(e) => tracing::warn!(error = ?e, "config watch error"),
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watch_path(&mut watcher, &self.sources.discovery_dir, RecursiveMode::NonRecursive);
        for path in &self.sources.explicit_paths {
            watch_path(&mut watcher, path, RecursiveMode::NonRecursive);
        }

        tracing::info!(dir = %self.sources.discovery_dir.display(), "config watcher started");
        Ok(watcher)
    }
}

fn watch_path(watcher: &mut RecommendedWatcher, path: &Path, mode: RecursiveMode) {
    if let Err(e) = watcher.watch(path, mode) {
        tracing::warn!(path = %path.display(), error = %e, "cannot watch config source");
    }
}

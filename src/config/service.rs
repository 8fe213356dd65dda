//! Configuration distribution.
//!
//! The service owns the authoritative snapshot. Workers never read config
//! sources themselves: they fetch the current snapshot over the `config.get`
//! RPC at startup and receive full-replacement pushes on `config.update`
//! whenever the master reloads. Reload cycles are serialized so no worker
//! can observe a torn snapshot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::loader::{self, ConfigSources};
use crate::config::snapshot::ConfigSnapshot;
use crate::config::watcher::ConfigWatcher;
use crate::context::AppContext;
use crate::ipc::message::{CONFIG_GET, CONFIG_UPDATE};
use crate::ipc::IpcHub;

pub struct ConfigService {
    ctx: Arc<AppContext>,
    sources: ConfigSources,
    current: ArcSwap<ConfigSnapshot>,
    generation: AtomicU64,
    reload_lock: tokio::sync::Mutex<()>,
    hub: Arc<IpcHub>,
}

impl ConfigService {
    /// Build the initial snapshot and wire up the `config.get` RPC.
    pub fn new(ctx: Arc<AppContext>, sources: ConfigSources, hub: Arc<IpcHub>) -> Arc<Self> {
        let initial = loader::build_snapshot(&ctx, &sources, 1);
        tracing::info!(keys = initial.len(), "initial config snapshot built");

        let service = Arc::new(Self {
            ctx,
            sources,
            current: ArcSwap::from_pointee(initial),
            generation: AtomicU64::new(1),
            reload_lock: tokio::sync::Mutex::new(()),
            hub: hub.clone(),
        });

        let for_rpc = service.clone();
        hub.respond(CONFIG_GET, move |_args| {
            let snapshot = for_rpc.current();
            async move { Ok(snapshot.to_value()) }
        });

        service
    }

    /// The current authoritative snapshot.
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// Rebuild the snapshot from all sources and push it whole to every
    /// worker. Concurrent calls are serialized, never interleaved.
    pub async fn reload(&self) -> Arc<ConfigSnapshot> {
        let _guard = self.reload_lock.lock().await;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let ctx = self.ctx.clone();
        let sources = self.sources.clone();
        let rebuilt = tokio::task::spawn_blocking(move || {
            loader::build_snapshot(&ctx, &sources, generation)
        })
        .await
        .unwrap_or_else(|_| loader::build_snapshot(&self.ctx, &self.sources, generation));

        let snapshot = Arc::new(rebuilt);
        self.current.store(snapshot.clone());
        self.hub.emit(CONFIG_UPDATE, snapshot.to_value());
        tracing::info!(generation, keys = snapshot.len(), "config reloaded and distributed");
        snapshot
    }

    /// Start the file watcher and the reload loop consuming its signals.
    /// Returns the watcher handle that keeps the watch alive.
    pub fn watch(self: &Arc<Self>) -> Result<notify::RecommendedWatcher, notify::Error> {
        let (watcher, mut reload_rx) = ConfigWatcher::new(self.sources.clone());
        let handle = watcher.run()?;

        let service = self.clone();
        tokio::spawn(async move {
            while reload_rx.recv().await.is_some() {
                // Collapse bursts of change events into one reload.
                while reload_rx.try_recv().is_ok() {}
                service.reload().await;
            }
        });

        Ok(handle)
    }
}

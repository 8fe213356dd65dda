//! Worker runtime.
//!
//! The startup contract every module follows: connect to the master,
//! fetch the config snapshot and block on it, run module init, then
//! announce readiness. The runtime also wires the two standing
//! obligations: replacing the local config copy atomically on pushes,
//! and answering the master's shutdown request.

use std::sync::Arc;

use arc_swap::ArcSwap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::ConfigSnapshot;
use crate::context::AppContext;
use crate::error::IpcError;
use crate::ipc::message::SHUTDOWN;
use crate::ipc::WorkerEndpoint;

pub struct WorkerRuntime {
    endpoint: Arc<WorkerEndpoint>,
    config: Arc<ArcSwap<ConfigSnapshot>>,
    shutdown: CancellationToken,
}

impl WorkerRuntime {
    /// Connect and complete the config handshake. The caller runs its own
    /// initialization afterwards and then calls [`announce_ready`].
    ///
    /// [`announce_ready`]: WorkerRuntime::announce_ready
    pub async fn init(ctx: &AppContext, name: &str) -> Result<Arc<Self>, IpcError> {
        let endpoint = WorkerEndpoint::connect(ctx, name).await?;
        let snapshot = endpoint.fetch_config().await?;
        tracing::info!(module = %name, generation = snapshot.generation(), "config snapshot received");

        let config = Arc::new(ArcSwap::from_pointee(snapshot));
        {
            let config = config.clone();
            endpoint.on_config_update(move |snapshot| {
                tracing::debug!(generation = snapshot.generation(), "config replaced");
                config.store(Arc::new(snapshot));
            });
        }

        let shutdown = CancellationToken::new();
        {
            let shutdown = shutdown.clone();
            endpoint.respond(SHUTDOWN, move |_args| {
                let shutdown = shutdown.clone();
                async move {
                    shutdown.cancel();
                    Ok(Value::Bool(true))
                }
            });
        }

        Ok(Arc::new(Self {
            endpoint,
            config,
            shutdown,
        }))
    }

    /// The worker's current config snapshot, replaced whole on pushes.
    pub fn config(&self) -> Arc<ConfigSnapshot> {
        self.config.load_full()
    }

    pub fn endpoint(&self) -> &Arc<WorkerEndpoint> {
        &self.endpoint
    }

    /// Emit the readiness handshake once module init is complete.
    pub fn announce_ready(&self) {
        self.endpoint.announce_ready();
    }

    /// Resolves when the master has requested a graceful shutdown.
    pub async fn shutdown_requested(&self) {
        self.shutdown.cancelled().await;
    }
}

//! Worker lifecycle management.
//!
//! The supervisor owns the registry of live process records. All registry
//! mutations are read-modify-write sequences under one lock; exit
//! observations arriving for a superseded record no-op against the
//! registry. Stop is the only timeout+escalation path: a shutdown RPC
//! raced against a fixed grace period, then a forced kill of the process
//! tree.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;

use crate::config::ConfigService;
use crate::context::{AppContext, ENV_APPSPACE, ENV_ARGS, ENV_AUTH, ENV_DEBUG};
use crate::error::SupervisorError;
use crate::ipc::message::SHUTDOWN;
use crate::ipc::IpcHub;
use crate::modules::ModuleSet;
use crate::supervisor::backend::{ProcessBackend, SpawnSpec};
use crate::supervisor::record::{ProcState, ProcessRecord};

/// Grace period between the shutdown request and the forced kill.
pub const STOP_GRACE: Duration = Duration::from_millis(5000);

const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Supervisor {
    ctx: Arc<AppContext>,
    modules: ModuleSet,
    hub: Arc<IpcHub>,
    config: Arc<ConfigService>,
    backend: Arc<dyn ProcessBackend>,
    registry: Mutex<HashMap<String, Arc<ProcessRecord>>>,
    generation_seq: AtomicU64,
}

impl Supervisor {
    pub fn new(
        ctx: Arc<AppContext>,
        modules: ModuleSet,
        hub: Arc<IpcHub>,
        config: Arc<ConfigService>,
        backend: Arc<dyn ProcessBackend>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            modules,
            hub,
            config,
            backend,
            registry: Mutex::new(HashMap::new()),
            generation_seq: AtomicU64::new(0),
        })
    }

    pub fn modules(&self) -> &ModuleSet {
        &self.modules
    }

    /// Names with a live (non-destroyed) record, in stable order.
    pub fn running(&self) -> Vec<String> {
        let registry = self.registry.lock().expect("registry poisoned");
        let mut names: Vec<String> = registry
            .values()
            .filter(|r| r.state() != ProcState::Destroyed)
            .map(|r| r.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn record(&self, name: &str) -> Option<Arc<ProcessRecord>> {
        self.registry.lock().expect("registry poisoned").get(name).cloned()
    }

    /// Whether the given handle is still the registered record for its
    /// name. Stale handles must treat their operations as no-ops.
    pub fn is_current(&self, record: &Arc<ProcessRecord>) -> bool {
        self.registry
            .lock()
            .expect("registry poisoned")
            .get(&record.name)
            .map(|current| Arc::ptr_eq(current, record))
            .unwrap_or(false)
    }

    /// Start a registered module and wait for its readiness handshake.
    ///
    /// A duplicate start for an already-registered, non-destroyed record
    /// warns and no-ops instead of double-spawning.
    pub async fn start(self: &Arc<Self>, name: &str) -> Result<(), SupervisorError> {
        let descriptor = self
            .modules
            .get(name)
            .ok_or_else(|| SupervisorError::UnknownModule(name.to_string()))?
            .clone();

        let record = {
            let mut registry = self.registry.lock().expect("registry poisoned");
            if let Some(existing) = registry.get(name) {
                if existing.state() != ProcState::Destroyed {
                    tracing::warn!(module = %name, state = ?existing.state(), "start ignored, module already registered");
                    return Ok(());
                }
            }
            let generation = self.generation_seq.fetch_add(1, Ordering::Relaxed) + 1;
            let record = Arc::new(ProcessRecord::new(name, generation, self.backend.kind()));
            registry.insert(name.to_string(), record.clone());
            record
        };

        let spec = self.spawn_spec(name, &descriptor.path);
        let spawned = match self.backend.spawn(&spec).await {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::error!(module = %name, error = %e, "spawn failed, module left absent");
                self.finish_destroy(&record, -1);
                return Err(e);
            }
        };
        record.set_pid(spawned.pid);

        // Exit watcher: drives Destroyed whether graceful, crashed, or killed.
        {
            let this = self.clone();
            let record = record.clone();
            tokio::spawn(async move {
                let code = spawned.exit.await.unwrap_or(-1);
                this.finish_destroy(&record, code);
            });
        }

        let timeout = self
            .config
            .current()
            .get_u64("core.start_timeout_secs")
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_START_TIMEOUT);
        if self.hub.wait_for_process_timeout(name, timeout).await {
            record.advance(ProcState::Running);
            tracing::info!(module = %name, pid = record.pid(), "worker ready");
            Ok(())
        } else {
            tracing::error!(module = %name, ?timeout, "worker never became ready, terminating it");
            self.backend.kill(name, record.pid()).await;
            Err(SupervisorError::ReadyTimeout(name.to_string(), timeout))
        }
    }

    /// Stop a module: one shutdown RPC, a fixed grace period, then a
    /// forced kill. Safe to call concurrently and repeatedly.
    pub async fn stop(&self, name: &str) -> Result<(), SupervisorError> {
        let record = self.record(name);
        match record {
            Some(record) => self.stop_record(record).await,
            None => {
                tracing::debug!(module = %name, "stop ignored, module not registered");
                Ok(())
            }
        }
    }

    async fn stop_record(&self, record: Arc<ProcessRecord>) -> Result<(), SupervisorError> {
        if record.state() == ProcState::Destroyed {
            return Ok(());
        }
        record.advance(ProcState::Stopping);

        if record.begin_stopping() {
            tracing::info!(module = %record.name, pid = record.pid(), "stopping worker");

            // Exactly one shutdown request; its response only matters for
            // logging, destruction is what we wait on.
            {
                let hub = self.hub.clone();
                let name = record.name.clone();
                tokio::spawn(async move {
                    if let Err(e) = hub.request(&name, SHUTDOWN, Value::Null, Some(STOP_GRACE)).await
                    {
                        tracing::debug!(module = %name, error = %e, "shutdown request did not complete");
                    }
                });
            }

            tokio::select! {
                _ = record.await_destroyed() => {}
                _ = tokio::time::sleep(STOP_GRACE) => {
                    self.backend.kill(&record.name, record.pid()).await;
                    if tokio::time::timeout(STOP_GRACE, record.await_destroyed()).await.is_err() {
                        tracing::error!(module = %record.name, "no exit observed after kill, forcing record destruction");
                        self.finish_destroy(&record, -1);
                    }
                }
            }
        } else {
            record.await_destroyed().await;
        }
        Ok(())
    }

    /// Stop then start. Not atomic: a crash in between leaves the module
    /// absent until the next explicit start.
    pub async fn restart(self: &Arc<Self>, name: &str) -> Result<(), SupervisorError> {
        self.stop(name).await?;
        self.start(name).await
    }

    /// Stop every live worker, used during master shutdown.
    pub async fn stop_all(&self) {
        let mut names = self.running();
        names.reverse();
        for name in names {
            if let Err(e) = self.stop(&name).await {
                tracing::warn!(module = %name, error = %e, "stop failed during shutdown");
            }
        }
    }

    /// Drive a record to `Destroyed` after its OS process is gone. Called
    /// from exit watchers; a stale (superseded) handle only updates its
    /// own state and leaves the registry alone.
    fn finish_destroy(&self, record: &Arc<ProcessRecord>, code: i32) {
        let changed = record.advance(ProcState::Destroyed);
        let was_current = {
            let mut registry = self.registry.lock().expect("registry poisoned");
            match registry.get(&record.name) {
                Some(current) if Arc::ptr_eq(current, record) => {
                    registry.remove(&record.name);
                    true
                }
                _ => false,
            }
        };

        if changed && was_current {
            tracing::info!(module = %record.name, pid = record.pid(), code, "worker destroyed");
        } else if changed {
            tracing::debug!(module = %record.name, generation = record.generation, "exit for superseded record, registry untouched");
        }
    }

    fn spawn_spec(&self, name: &str, entry: &std::path::Path) -> SpawnSpec {
        let snapshot = self.config.current();
        let inspect_port = if self.ctx.debug {
            snapshot.get_u16(&format!("{name}.inspect_port"))
        } else {
            None
        };

        let mut env = vec![
            (ENV_APPSPACE.to_string(), self.ctx.appspace.clone()),
            (ENV_ARGS.to_string(), AppContext::child_args().join(" ")),
        ];
        if self.ctx.debug {
            env.push((ENV_DEBUG.to_string(), "1".to_string()));
        }
        if self.ctx.auth_enabled {
            env.push((ENV_AUTH.to_string(), "1".to_string()));
        }

        SpawnSpec {
            name: name.to_string(),
            entry: entry.to_path_buf(),
            args: Vec::new(),
            env,
            inspect_port,
        }
    }
}

//! Process-spawning backends.
//!
//! Two interchangeable strategies share the same `ProcessRecord` state
//! machine: `NativeBackend` owns child processes directly; `ExternalBackend`
//! delegates to a separate process-supervision service and observes its
//! event feed. The supervisor never branches on which one is active.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::codec::{Framed, LinesCodec};

use crate::error::SupervisorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Native,
    External,
}

/// Everything a backend needs to start one worker.
#[derive(Debug, Clone)]
pub struct SpawnSpec {
    pub name: String,
    pub entry: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    /// Debug-mode inspect port passed through to the worker.
    pub inspect_port: Option<u16>,
}

/// A spawned worker: its pid and a one-shot exit notification.
pub struct SpawnedProcess {
    pub pid: u32,
    pub exit: oneshot::Receiver<i32>,
}

#[async_trait]
pub trait ProcessBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Start the worker process. The returned `exit` channel fires once
    /// when the OS-level process is gone, whatever the cause.
    async fn spawn(&self, spec: &SpawnSpec) -> Result<SpawnedProcess, SupervisorError>;

    /// Force-terminate the process tree rooted at `pid`. Used only after
    /// the graceful-stop grace period expires.
    async fn kill(&self, name: &str, pid: u32);
}

/// Directly-owned child processes.
pub struct NativeBackend;

#[async_trait]
impl ProcessBackend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    async fn spawn(&self, spec: &SpawnSpec) -> Result<SpawnedProcess, SupervisorError> {
        let mut cmd = tokio::process::Command::new(&spec.entry);
        cmd.args(&spec.args)
            .envs(spec.env.iter().cloned())
            .stdin(Stdio::null());
        if let Some(port) = spec.inspect_port {
            cmd.arg(format!("--inspect={port}"));
        }
        // Own process group, so the grace-period kill reaps the whole tree.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            name: spec.name.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or_default();
        tracing::info!(module = %spec.name, pid, entry = %spec.entry.display(), "worker spawned");

        let (exit_tx, exit_rx) = oneshot::channel();
        let name = spec.name.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    tracing::warn!(module = %name, error = %e, "wait on child failed");
                    -1
                }
            };
            let _ = exit_tx.send(code);
        });

        Ok(SpawnedProcess { pid, exit: exit_rx })
    }

    async fn kill(&self, name: &str, pid: u32) {
        tracing::warn!(module = %name, pid, "force-killing process tree");
        #[cfg(unix)]
        unsafe {
            // Negative pid addresses the process group created at spawn.
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
        #[cfg(not(unix))]
        {
            let _ = (name, pid);
        }
    }
}

/// One record from the external supervisor's event feed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisionEvent {
    pub name: String,
    pub kind: FeedEventKind,
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub code: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedEventKind {
    Online,
    Stopped,
    Exit,
}

/// Delegation to an external process-supervision service.
///
/// Commands and the event feed share one line-delimited JSON connection.
/// Supervised names are namespaced as `{appspace}.{module}`; feed records
/// outside this appspace's namespace belong to foreign processes and are
/// ignored.
pub struct ExternalBackend {
    namespace: String,
    commands: mpsc::UnboundedSender<serde_json::Value>,
    feed: broadcast::Sender<SupervisionEvent>,
}

impl ExternalBackend {
    pub async fn connect(socket: PathBuf, namespace: String) -> Result<Self, SupervisorError> {
        let stream = UnixStream::connect(&socket)
            .await
            .map_err(|source| SupervisorError::Spawn {
                name: "external-supervisor".into(),
                source,
            })?;
        let framed = Framed::new(stream, LinesCodec::new());
        let (mut sink, mut lines) = framed.split();

        let (commands, mut command_rx) = mpsc::unbounded_channel::<serde_json::Value>();
        tokio::spawn(async move {
            while let Some(cmd) = command_rx.recv().await {
                if sink.send(cmd.to_string()).await.is_err() {
                    break;
                }
            }
        });

        let (feed, _) = broadcast::channel(64);
        let feed_tx = feed.clone();
        let prefix = format!("{namespace}.");
        tokio::spawn(async move {
            while let Some(line) = lines.next().await {
                let Ok(line) = line else { break };
                match serde_json::from_str::<SupervisionEvent>(&line) {
                    Ok(ev) if ev.name.starts_with(&prefix) => {
                        let _ = feed_tx.send(ev);
                    }
                    Ok(_) => {} // foreign process, ignore
                    Err(e) => {
                        tracing::debug!(error = %e, "unparseable supervision feed line");
                    }
                }
            }
            tracing::warn!("supervision feed closed");
        });

        // Ask for feed delivery covering our namespace.
        let _ = commands.send(json!({ "cmd": "subscribe", "namespace": namespace }));

        Ok(Self {
            namespace,
            commands,
            feed,
        })
    }

    fn scoped(&self, module: &str) -> String {
        format!("{}.{}", self.namespace, module)
    }
}

#[async_trait]
impl ProcessBackend for ExternalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::External
    }

    async fn spawn(&self, spec: &SpawnSpec) -> Result<SpawnedProcess, SupervisorError> {
        let scoped = self.scoped(&spec.name);
        let mut feed = self.feed.subscribe();

        self.commands
            .send(json!({
                "cmd": "start",
                "name": scoped,
                "script": spec.entry,
                "args": spec.args,
                "env": spec.env.iter().cloned().collect::<std::collections::BTreeMap<_, _>>(),
            }))
            .map_err(|_| SupervisorError::Spawn {
                name: spec.name.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "supervision service connection lost",
                ),
            })?;

        // The service confirms the start with an online record for our name.
        let pid = loop {
            match feed.recv().await {
                Ok(ev) if ev.name == scoped && ev.kind == FeedEventKind::Online => break ev.pid,
                Ok(_) => {}
                Err(_) => {
                    return Err(SupervisorError::Spawn {
                        name: spec.name.clone(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::BrokenPipe,
                            "supervision feed closed before start confirmation",
                        ),
                    })
                }
            }
        };

        let (exit_tx, exit_rx) = oneshot::channel();
        let mut feed = self.feed.subscribe();
        let name = scoped.clone();
        tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(ev)
                        if ev.name == name
                            && matches!(ev.kind, FeedEventKind::Stopped | FeedEventKind::Exit) =>
                    {
                        let _ = exit_tx.send(ev.code.unwrap_or(-1));
                        break;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        tracing::info!(module = %spec.name, pid, "worker started via external supervisor");
        Ok(SpawnedProcess { pid, exit: exit_rx })
    }

    async fn kill(&self, name: &str, pid: u32) {
        tracing::warn!(module = %name, pid, "requesting forced kill from external supervisor");
        let _ = self
            .commands
            .send(json!({ "cmd": "kill", "name": self.scoped(name) }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_records_parse() {
        let ev: SupervisionEvent =
            serde_json::from_str(r#"{"name":"orchd.media","kind":"exit","pid":41,"code":0}"#)
                .unwrap();
        assert_eq!(ev.kind, FeedEventKind::Exit);
        assert_eq!(ev.code, Some(0));

        let ev: SupervisionEvent =
            serde_json::from_str(r#"{"name":"orchd.fs","kind":"online","pid":42}"#).unwrap();
        assert_eq!(ev.kind, FeedEventKind::Online);
        assert_eq!(ev.code, None);
    }
}

//! Error taxonomy for the orchestrator.
//!
//! Errors are grouped per subsystem. Transport and routing errors are
//! recovered locally (they fail one request, never the process); bind
//! failures are fatal and bubble out of `main`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Transport-level errors. Failing a request with one of these must never
/// take down the hub or any other peer.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("connection to peer closed")]
    ConnectionClosed,

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("no peer named '{0}' is connected")]
    UnknownPeer(String),

    #[error("no handler registered for method '{0}'")]
    UnknownMethod(String),

    #[error("remote handler failed: {0}")]
    Remote(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("endpoint is shutting down")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Process-supervision errors. Spawn failures leave the module absent;
/// the caller retries explicitly.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no module named '{0}' is registered")]
    UnknownModule(String),

    #[error("failed to spawn module '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("module '{0}' did not become ready within {1:?}")]
    ReadyTimeout(String, Duration),

    #[error(transparent)]
    Ipc(#[from] IpcError),
}

/// Configuration-source errors. Missing or unreadable sources are warned
/// about and skipped; only programmer errors surface as hard failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

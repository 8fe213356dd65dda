//! Socket path registry.
//!
//! All socket paths claimed by one master instance derive from
//! `(appspace, suffix)`: `{appspace}_ipc.sock` for the control channel and
//! `{appspace}_{module}_http.sock` for a module's private HTTP listener.
//! Stale files left by an unclean shutdown are unlinked before binding.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::context::AppContext;

/// Suffix of the master's control-channel socket.
pub const IPC_SUFFIX: &str = "ipc";

/// Tracks every socket path this instance has claimed so shutdown can
/// remove them all.
#[derive(Debug, Default)]
pub struct SocketRegistry {
    socket_dir: PathBuf,
    appspace: String,
    claimed: Mutex<HashSet<PathBuf>>,
}

impl SocketRegistry {
    pub fn new(ctx: &AppContext) -> Self {
        Self {
            socket_dir: ctx.socket_dir.clone(),
            appspace: ctx.appspace.clone(),
            claimed: Mutex::new(HashSet::new()),
        }
    }

    /// Path for a suffix under this appspace: `{appspace}_{suffix}.sock`.
    pub fn path_for(&self, suffix: &str) -> PathBuf {
        self.socket_dir
            .join(format!("{}_{}.sock", self.appspace, suffix))
    }

    /// The master control socket path.
    pub fn control_socket(&self) -> PathBuf {
        self.path_for(IPC_SUFFIX)
    }

    /// A module's private HTTP socket path.
    pub fn module_http_socket(&self, module: &str) -> PathBuf {
        self.path_for(&format!("{module}_http"))
    }

    /// Claim a path for binding: record it and unlink any stale file a
    /// previous unclean shutdown left behind.
    pub fn claim(&self, path: &Path) -> std::io::Result<()> {
        self.claimed
            .lock()
            .expect("socket registry poisoned")
            .insert(path.to_path_buf());
        match std::fs::remove_file(path) {
            Ok(()) => {
                tracing::warn!(path = %path.display(), "removed stale socket file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove every claimed socket file. Called on graceful shutdown.
    pub fn cleanup(&self) {
        let claimed = self.claimed.lock().expect("socket registry poisoned");
        for path in claimed.iter() {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove socket file");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_in(dir: &Path) -> AppContext {
        let mut ctx = AppContext::from_env();
        ctx.appspace = "testapp".into();
        ctx.socket_dir = dir.to_path_buf();
        ctx
    }

    #[test]
    fn naming_convention() {
        let dir = tempfile::tempdir().unwrap();
        let reg = SocketRegistry::new(&ctx_in(dir.path()));
        assert!(reg
            .control_socket()
            .ends_with("testapp_ipc.sock"));
        assert!(reg
            .module_http_socket("filemanager")
            .ends_with("testapp_filemanager_http.sock"));
    }

    #[test]
    fn claim_removes_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let reg = SocketRegistry::new(&ctx_in(dir.path()));
        let path = reg.control_socket();
        std::fs::write(&path, b"stale").unwrap();
        reg.claim(&path).unwrap();
        assert!(!path.exists());

        std::fs::write(&path, b"bound").unwrap();
        reg.cleanup();
        assert!(!path.exists());
    }
}

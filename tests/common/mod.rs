//! Shared fixtures for integration tests.

// Each test binary compiles this module separately and uses a subset.
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixListener};
use tokio::sync::oneshot;

use orchd::config::{ConfigService, ConfigSources};
use orchd::context::AppContext;
use orchd::error::SupervisorError;
use orchd::ipc::{IpcHub, SocketRegistry};
use orchd::supervisor::{BackendKind, ProcessBackend, SpawnSpec, SpawnedProcess};

/// A master instance wired against a temp directory, with a unique
/// appspace so parallel tests never collide on socket paths.
pub struct TestMaster {
    pub ctx: Arc<AppContext>,
    pub sockets: Arc<SocketRegistry>,
    pub hub: Arc<IpcHub>,
    pub config: Arc<ConfigService>,
    pub conf_dir: PathBuf,
    _dir: tempfile::TempDir,
}

pub async fn master() -> TestMaster {
    master_full(None, Vec::new()).await
}

pub async fn master_with_overrides(overrides: Vec<(String, Value)>) -> TestMaster {
    master_full(None, overrides).await
}

pub async fn master_with_ctx(mutate: impl FnOnce(&mut AppContext)) -> TestMaster {
    build(None, Vec::new(), mutate).await
}

pub async fn master_full(config_toml: Option<&str>, overrides: Vec<(String, Value)>) -> TestMaster {
    build(config_toml, overrides, |_| {}).await
}

async fn build(
    config_toml: Option<&str>,
    overrides: Vec<(String, Value)>,
    mutate: impl FnOnce(&mut AppContext),
) -> TestMaster {
    let dir = tempfile::tempdir().unwrap();
    let conf_dir = dir.path().join("conf");
    std::fs::create_dir(&conf_dir).unwrap();
    if let Some(toml) = config_toml {
        std::fs::write(conf_dir.join("config.toml"), toml).unwrap();
    }

    let mut ctx = AppContext::from_env();
    ctx.appspace = format!("t{}", uuid::Uuid::new_v4().simple());
    ctx.socket_dir = dir.path().to_path_buf();
    mutate(&mut ctx);
    let ctx = Arc::new(ctx);

    let sockets = Arc::new(SocketRegistry::new(&ctx));
    let hub = IpcHub::bind(&ctx, sockets.clone()).await.unwrap();
    let sources = ConfigSources {
        discovery_dir: conf_dir.clone(),
        explicit_paths: Vec::new(),
        overrides,
    };
    let config = ConfigService::new(ctx.clone(), sources, hub.clone());

    TestMaster {
        ctx,
        sockets,
        hub,
        config,
        conf_dir,
        _dir: dir,
    }
}

/// Poll a condition until it holds, panicking after two seconds.
pub async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Process backend that records spawns and kills instead of touching the
/// OS. Exits are fired by the test (or by `kill`, mirroring a real kill).
pub struct MockBackend {
    next_pid: AtomicU32,
    spawned: Mutex<Vec<SpawnSpec>>,
    killed: Mutex<Vec<String>>,
    exits: Mutex<HashMap<String, oneshot::Sender<i32>>>,
}

impl MockBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_pid: AtomicU32::new(1000),
            spawned: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
            exits: Mutex::new(HashMap::new()),
        })
    }

    /// Fire the exit notification for a spawned module.
    pub fn exit(&self, name: &str, code: i32) -> bool {
        match self.exits.lock().unwrap().remove(name) {
            Some(tx) => tx.send(code).is_ok(),
            None => false,
        }
    }

    pub fn spawn_count(&self, name: &str) -> usize {
        self.spawned.lock().unwrap().iter().filter(|s| s.name == name).count()
    }

    /// The most recent spawn request for a module.
    pub fn last_spec(&self, name: &str) -> Option<SpawnSpec> {
        self.spawned
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|s| s.name == name)
            .cloned()
    }

    pub fn kill_count(&self, name: &str) -> usize {
        self.killed.lock().unwrap().iter().filter(|n| *n == name).count()
    }
}

#[async_trait]
impl ProcessBackend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    async fn spawn(&self, spec: &SpawnSpec) -> Result<SpawnedProcess, SupervisorError> {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.exits.lock().unwrap().insert(spec.name.clone(), tx);
        self.spawned.lock().unwrap().push(spec.clone());
        Ok(SpawnedProcess { pid, exit: rx })
    }

    async fn kill(&self, name: &str, _pid: u32) {
        self.killed.lock().unwrap().push(name.to_string());
        // A killed process exits; mirror that.
        self.exit(name, -1);
    }
}

/// Serve a module's private HTTP socket, answering every request with its
/// own request line so tests can assert the rewritten upstream path.
pub fn serve_module_http(path: PathBuf) {
    let listener = UnixListener::bind(&path).unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let n = sock.read(&mut buf).await.unwrap_or(0);
                let text = String::from_utf8_lossy(&buf[..n]);
                let body = text.lines().next().unwrap_or("").to_string();
                let resp = format!(
                    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = sock.write_all(resp.as_bytes()).await;
                let _ = sock.shutdown().await;
            });
        }
    });
}

/// Serve a module socket that accepts protocol upgrades: it answers the
/// handshake with 101, writes one `xff:<x-forwarded-for>` banner line,
/// then echoes every byte it receives.
pub fn serve_module_upgrade(path: PathBuf) {
    let listener = UnixListener::bind(&path).unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut chunk = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = sock.read(&mut chunk).await.unwrap_or(0);
                    if n == 0 {
                        return;
                    }
                    head.extend_from_slice(&chunk[..n]);
                }
                let text = String::from_utf8_lossy(&head).to_string();
                let xff = text
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("x-forwarded-for")
                            .then(|| value.trim().to_string())
                    })
                    .unwrap_or_default();

                let resp =
                    "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
                if sock.write_all(resp.as_bytes()).await.is_err() {
                    return;
                }
                if sock.write_all(format!("xff:{xff}\n").as_bytes()).await.is_err() {
                    return;
                }
                loop {
                    let n = match sock.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if sock.write_all(&chunk[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
}

/// One raw HTTP/1.1 GET, returning the status code and body text.
pub async fn http_get(addr: SocketAddr, path: &str, host: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let req = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(req.as_bytes()).await.unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await.unwrap();
    let text = String::from_utf8_lossy(&buf).to_string();
    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let body = text.split("\r\n\r\n").nth(1).unwrap_or("").to_string();
    (status, body)
}

/// Block until a TCP listener answers on the address.
pub async fn wait_for_listener(addr: SocketAddr) {
    for _ in 0..200 {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("listener on {addr} never came up");
}

//! Forwarding agents for module sockets.
//!
//! Each module's private HTTP listener lives on a Unix socket; the cache
//! holds one hyper client per module, created lazily on first request and
//! reused for every later one.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use dashmap::DashMap;
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::UnixStream;
use tower::Service;

/// A hyper client bound to one module's private socket.
pub type Agent = Client<UnixConnector, Body>;

/// Connector that ignores the request authority and always dials one
/// fixed Unix socket path.
#[derive(Clone)]
pub struct UnixConnector {
    path: Arc<PathBuf>,
}

impl UnixConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Arc::new(path.into()),
        }
    }
}

impl Service<hyper::Uri> for UnixConnector {
    type Response = UnixIo;
    type Error = std::io::Error;
    type Future =
        Pin<Box<dyn std::future::Future<Output = Result<UnixIo, std::io::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: hyper::Uri) -> Self::Future {
        let path = self.path.clone();
        Box::pin(async move {
            let stream = UnixStream::connect(path.as_path()).await?;
            Ok(UnixIo {
                inner: TokioIo::new(stream),
            })
        })
    }
}

/// Socket IO wrapper carrying the `Connection` metadata hyper's pool needs.
pub struct UnixIo {
    inner: TokioIo<UnixStream>,
}

impl Connection for UnixIo {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl hyper::rt::Read for UnixIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: hyper::rt::ReadBufCursor<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl hyper::rt::Write for UnixIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Lazily-populated `module name → agent` cache.
#[derive(Default)]
pub struct AgentCache {
    agents: DashMap<String, Agent>,
}

impl AgentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the agent for a module, creating it against `socket_path` on
    /// first use.
    pub fn agent_for(&self, module: &str, socket_path: &Path) -> Agent {
        if let Some(agent) = self.agents.get(module) {
            return agent.clone();
        }
        let agent: Agent = Client::builder(TokioExecutor::new())
            .build(UnixConnector::new(socket_path));
        self.agents.insert(module.to_string(), agent.clone());
        agent
    }

    /// Drop a module's agent, e.g. after its socket path went away.
    pub fn invalidate(&self, module: &str) {
        self.agents.remove(module);
    }
}

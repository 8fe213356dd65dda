//! Master endpoint of the control channel.
//!
//! The hub binds the `{appspace}_ipc.sock` listener, accepts worker
//! connections, and routes all three message kinds: RPC requests to the
//! registered handler table, responses to their pending waiters, and
//! events to local listeners plus remote fan-out. A dropped connection
//! fails that peer's in-flight requests only; other peers and the hub
//! itself keep running.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::IpcError;
use crate::ipc::bus::EventBus;
use crate::ipc::codec::MessageCodec;
use crate::ipc::message::{IpcMessage, MessageKind, REGISTER_EVENT};
use crate::ipc::ready::ReadyTable;
use crate::ipc::paths::SocketRegistry;
use crate::ipc::{HandlerFuture, RpcHandler, MASTER};

struct Peer {
    tx: mpsc::UnboundedSender<IpcMessage>,
    generation: u64,
}

struct Pending {
    target: String,
    tx: oneshot::Sender<Result<Value, IpcError>>,
}

/// Master-side transport endpoint.
pub struct IpcHub {
    sockets: Arc<SocketRegistry>,
    peers: DashMap<String, Peer>,
    pending: DashMap<Uuid, Pending>,
    handlers: DashMap<String, RpcHandler>,
    bus: EventBus,
    ready: ReadyTable,
    shutdown: CancellationToken,
    peer_seq: AtomicU64,
}

impl IpcHub {
    /// Bind the control socket and start accepting workers. Failure to
    /// bind is fatal to the caller.
    pub async fn bind(
        _ctx: &AppContext,
        sockets: Arc<SocketRegistry>,
    ) -> Result<Arc<Self>, IpcError> {
        let path = sockets.control_socket();
        sockets.claim(&path)?;
        let listener = UnixListener::bind(&path)?;
        tracing::info!(path = %path.display(), "control socket bound");

        let hub = Arc::new(Self {
            sockets,
            peers: DashMap::new(),
            pending: DashMap::new(),
            handlers: DashMap::new(),
            bus: EventBus::new(),
            ready: ReadyTable::default(),
            shutdown: CancellationToken::new(),
            peer_seq: AtomicU64::new(0),
        });

        let accept_hub = hub.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = accept_hub.shutdown.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, _)) => {
                            let hub = accept_hub.clone();
                            tokio::spawn(async move { hub.handle_connection(stream).await });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed on control socket");
                        }
                    }
                }
            }
        });

        Ok(hub)
    }

    /// Register the single handler for an RPC method; a later
    /// registration for the same name replaces the earlier one.
    pub fn respond<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, String>> + Send + 'static,
    {
        let handler: RpcHandler = Arc::new(move |args| -> HandlerFuture { Box::pin(handler(args)) });
        if self.handlers.insert(method.to_string(), handler).is_some() {
            tracing::debug!(method, "rpc handler replaced");
        }
    }

    /// Send a request to the named worker and await its response.
    ///
    /// `timeout = None` waits indefinitely but stays cancellable by hub
    /// shutdown. A timeout cancels only this wait, never the remote
    /// handler's in-flight work.
    pub async fn request(
        &self,
        target: &str,
        method: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, IpcError> {
        let msg = IpcMessage::request(method, args, Some(target.to_string()));
        let id = msg.id;

        let peer_tx = match self.peers.get(target) {
            Some(peer) => peer.tx.clone(),
            None => return Err(IpcError::UnknownPeer(target.to_string())),
        };

        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            Pending {
                target: target.to_string(),
                tx,
            },
        );

        if peer_tx.send(msg).is_err() {
            self.pending.remove(&id);
            return Err(IpcError::ConnectionClosed);
        }

        let wait = async {
            match rx.await {
                Ok(result) => result,
                Err(_) => Err(IpcError::ConnectionClosed),
            }
        };

        match timeout {
            Some(limit) if !limit.is_zero() => tokio::select! {
                result = wait => result,
                _ = tokio::time::sleep(limit) => {
                    self.pending.remove(&id);
                    Err(IpcError::Timeout(limit))
                }
                _ = self.shutdown.cancelled() => {
                    self.pending.remove(&id);
                    Err(IpcError::Cancelled)
                }
            },
            _ => tokio::select! {
                result = wait => result,
                _ = self.shutdown.cancelled() => {
                    self.pending.remove(&id);
                    Err(IpcError::Cancelled)
                }
            },
        }
    }

    /// Broadcast an event to local listeners and every connected worker.
    pub fn emit(&self, name: &str, payload: Value) {
        self.bus.publish(name, payload.clone());
        let msg = IpcMessage::event(name, payload);
        for peer in self.peers.iter() {
            let _ = peer.tx.send(msg.clone());
        }
    }

    /// Deliver an event to one named worker only; logged no-op when that
    /// worker is not connected.
    pub fn emit_to(&self, target: &str, name: &str, payload: Value) {
        match self.peers.get(target) {
            Some(peer) => {
                let _ = peer.tx.send(IpcMessage::event_to(target, name, payload));
            }
            None => {
                tracing::debug!(target, event = name, "emit_to dropped, peer not connected");
            }
        }
    }

    pub fn on<F>(&self, name: &str, listener: F) -> JoinHandle<()>
    where
        F: Fn(Value) + Send + 'static,
    {
        self.bus.on(name, listener)
    }

    pub fn once<F>(&self, name: &str, listener: F) -> JoinHandle<()>
    where
        F: FnOnce(Value) + Send + 'static,
    {
        self.bus.once(name, listener)
    }

    /// Resolve once the named module's readiness handshake completes;
    /// immediately if it already has.
    pub async fn wait_for_process(&self, name: &str) -> bool {
        self.ready.wait(name).await
    }

    /// Bounded readiness wait; `false` when the deadline passes first.
    pub async fn wait_for_process_timeout(&self, name: &str, timeout: Duration) -> bool {
        self.ready.wait_timeout(name, timeout).await
    }

    pub fn is_ready(&self, name: &str) -> bool {
        self.ready.is_ready(name)
    }

    pub fn is_connected(&self, name: &str) -> bool {
        self.peers.contains_key(name)
    }

    pub fn socket_registry(&self) -> &SocketRegistry {
        &self.sockets
    }

    /// Stop accepting, fail all in-flight requests, and drop all peers.
    pub fn close(&self) {
        self.shutdown.cancel();
        for id in self.pending.iter().map(|e| *e.key()).collect::<Vec<_>>() {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.tx.send(Err(IpcError::Cancelled));
            }
        }
        self.peers.clear();
    }

    async fn handle_connection(self: Arc<Self>, stream: UnixStream) {
        let mut framed = Framed::new(stream, MessageCodec::new());

        // The first frame must be the register handshake naming the peer.
        let name = match framed.next().await {
            Some(Ok(msg)) => match msg.register_name() {
                Some(name) => name.to_string(),
                None => {
                    tracing::warn!(kind = ?msg.kind, name = %msg.name, "peer sent non-register first frame, dropping connection");
                    return;
                }
            },
            Some(Err(e)) => {
                tracing::warn!(error = %e, "malformed handshake frame, dropping connection");
                return;
            }
            None => return,
        };

        let generation = self.peer_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = mpsc::unbounded_channel::<IpcMessage>();
        if self
            .peers
            .insert(name.clone(), Peer { tx, generation })
            .is_some()
        {
            tracing::warn!(peer = %name, "peer reconnected, superseding previous connection");
        }
        tracing::info!(peer = %name, "worker connected to control channel");

        let (mut sink, mut messages) = framed.split();
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = sink.send(msg).await {
                    tracing::debug!(error = %e, "peer write failed");
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                frame = messages.next() => match frame {
                    Some(Ok(msg)) => self.dispatch(&name, msg),
                    Some(Err(e)) => {
                        tracing::warn!(peer = %name, error = %e, "dropping connection after transport error");
                        break;
                    }
                    None => break,
                }
            }
        }

        writer.abort();
        self.peer_disconnected(&name, generation);
    }

    fn dispatch(self: &Arc<Self>, from: &str, msg: IpcMessage) {
        match msg.kind {
            MessageKind::Request => self.dispatch_request(from, msg),
            MessageKind::Response => match self.pending.remove(&msg.id) {
                Some((_, pending)) => {
                    let result = match msg.error {
                        Some(error) => Err(IpcError::Remote(error)),
                        None => Ok(msg.payload),
                    };
                    let _ = pending.tx.send(result);
                }
                None => {
                    tracing::debug!(id = %msg.id, "response for unknown or expired request id, dropping");
                }
            },
            MessageKind::Event => self.dispatch_event(from, msg),
        }
    }

    fn dispatch_request(self: &Arc<Self>, from: &str, msg: IpcMessage) {
        let reply_tx = match self.peers.get(from) {
            Some(peer) => peer.tx.clone(),
            None => return,
        };
        let handler = self.handlers.get(&msg.name).map(|h| h.clone());
        let method = msg.name.clone();
        let id = msg.id;
        tokio::spawn(async move {
            let result = match handler {
                Some(handler) => handler(msg.payload).await,
                None => Err(IpcError::UnknownMethod(method.clone()).to_string()),
            };
            let _ = reply_tx.send(IpcMessage::response_to(id, &method, result));
        });
    }

    fn dispatch_event(&self, from: &str, msg: IpcMessage) {
        if msg.name == REGISTER_EVENT {
            return;
        }
        if let Some(module) = msg.name.strip_suffix(".ready") {
            self.ready.mark_ready(module);
        }

        match msg.target.as_deref() {
            Some(MASTER) => {
                self.bus.publish(&msg.name, msg.payload);
            }
            Some(target) => match self.peers.get(target) {
                Some(peer) => {
                    let _ = peer.tx.send(msg.clone());
                }
                None => {
                    tracing::debug!(target, event = %msg.name, "targeted event dropped, peer not connected");
                }
            },
            None => {
                // Broadcast: local listeners plus every peer but the sender.
                self.bus.publish(&msg.name, msg.payload.clone());
                for peer in self.peers.iter() {
                    if peer.key() != from {
                        let _ = peer.tx.send(msg.clone());
                    }
                }
            }
        }
    }

    fn peer_disconnected(&self, name: &str, generation: u64) {
        // Only tear down state if this connection is still the registered
        // one; a reconnect may have superseded it already.
        let current = self
            .peers
            .get(name)
            .map(|peer| peer.generation == generation)
            .unwrap_or(false);
        if !current {
            return;
        }
        self.peers.remove(name);
        self.ready.clear(name);

        let stale: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|e| e.target == name)
            .map(|e| *e.key())
            .collect();
        let failed = stale.len();
        for id in stale {
            if let Some((_, pending)) = self.pending.remove(&id) {
                let _ = pending.tx.send(Err(IpcError::ConnectionClosed));
            }
        }
        tracing::info!(peer = %name, failed_requests = failed, "worker disconnected");
    }
}

impl Drop for IpcHub {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

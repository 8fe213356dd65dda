//! Worker endpoint of the control channel.
//!
//! A worker connects to the master's control socket during its own
//! startup, registers under its module name, fetches the config snapshot,
//! and announces readiness once its initialization completes. Requests
//! issued from a worker implicitly target the master. Reconnection is not
//! automatic; a replacement worker process establishes its own connection.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::IpcError;
use crate::ipc::bus::EventBus;
use crate::ipc::codec::MessageCodec;
use crate::ipc::message::{
    ready_event, IpcMessage, MessageKind, CONFIG_GET, CONFIG_UPDATE, REGISTER_EVENT,
};
use crate::ipc::paths::SocketRegistry;
use crate::ipc::{HandlerFuture, RpcHandler};
use crate::config::ConfigSnapshot;

/// Worker-side transport endpoint.
pub struct WorkerEndpoint {
    name: String,
    tx: mpsc::UnboundedSender<IpcMessage>,
    pending: DashMap<Uuid, oneshot::Sender<Result<Value, IpcError>>>,
    handlers: DashMap<String, RpcHandler>,
    bus: EventBus,
    shutdown: CancellationToken,
}

impl WorkerEndpoint {
    /// Connect to the master's control socket and register under
    /// `module_name`.
    pub async fn connect(ctx: &AppContext, module_name: &str) -> Result<Arc<Self>, IpcError> {
        let path = SocketRegistry::new(ctx).control_socket();
        let stream = UnixStream::connect(&path).await?;
        let framed = Framed::new(stream, MessageCodec::new());
        let (mut sink, mut messages) = framed.split();

        sink.send(IpcMessage::event(
            REGISTER_EVENT,
            json!({ "name": module_name }),
        ))
        .await?;

        let (tx, mut rx) = mpsc::unbounded_channel::<IpcMessage>();
        let endpoint = Arc::new(Self {
            name: module_name.to_string(),
            tx,
            pending: DashMap::new(),
            handlers: DashMap::new(),
            bus: EventBus::new(),
            shutdown: CancellationToken::new(),
        });

        let writer_token = endpoint.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(msg) => {
                            if let Err(e) = sink.send(msg).await {
                                tracing::debug!(error = %e, "master write failed");
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        let reader = endpoint.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader.shutdown.cancelled() => break,
                    frame = messages.next() => match frame {
                        Some(Ok(msg)) => reader.dispatch(msg),
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "control channel transport error");
                            break;
                        }
                        None => break,
                    }
                }
            }
            reader.connection_lost();
        });

        tracing::debug!(module = %module_name, path = %path.display(), "connected to master");
        Ok(endpoint)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a request to the master and await the response. Semantics
    /// match the hub side: `None`/zero timeout waits indefinitely but is
    /// cancelled when this endpoint shuts down.
    pub async fn request(
        &self,
        method: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, IpcError> {
        let msg = IpcMessage::request(method, args, None);
        let id = msg.id;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        if self.tx.send(msg).is_err() {
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

    /// Register the single handler for an RPC method arriving from the
    /// master; a later registration replaces the earlier one.
    pub fn respond<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, String>> + Send + 'static,
    {
        let handler: RpcHandler = Arc::new(move |args| -> HandlerFuture { Box::pin(handler(args)) });
        self.handlers.insert(method.to_string(), handler);
    }

    /// Broadcast an event across the bus: local listeners plus, via the
    /// master, every other connected peer.
    pub fn emit(&self, name: &str, payload: Value) {
        self.bus.publish(name, payload.clone());
        let _ = self.tx.send(IpcMessage::event(name, payload));
    }

    /// Deliver an event to one named peer via the master.
    pub fn emit_to(&self, target: &str, name: &str, payload: Value) {
        let _ = self.tx.send(IpcMessage::event_to(target, name, payload));
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

    /// Fetch the current config snapshot from the master. Workers block
    /// on this before running their own initialization.
    pub async fn fetch_config(&self) -> Result<ConfigSnapshot, IpcError> {
        let value = self.request(CONFIG_GET, Value::Null, None).await?;
        ConfigSnapshot::from_value(value).map_err(|e| IpcError::Malformed(e.to_string()))
    }

    /// Subscribe to full-replacement config pushes from the master.
    pub fn on_config_update<F>(&self, apply: F) -> JoinHandle<()>
    where
        F: Fn(ConfigSnapshot) + Send + 'static,
    {
        self.bus.on(CONFIG_UPDATE, move |value| {
            match ConfigSnapshot::from_value(value) {
                Ok(snapshot) => apply(snapshot),
                Err(e) => tracing::warn!(error = %e, "ignoring malformed config push"),
            }
        })
    }

    /// Announce the readiness handshake, unblocking proxy routing and any
    /// `wait_for_process` callers on the master.
    pub fn announce_ready(&self) {
        self.emit(&ready_event(&self.name), json!(true));
    }

    /// Tear down the endpoint, failing all in-flight requests.
    pub fn close(&self) {
        self.connection_lost();
    }

    fn dispatch(self: &Arc<Self>, msg: IpcMessage) {
        match msg.kind {
            MessageKind::Request => {
                let handler = self.handlers.get(&msg.name).map(|h| h.clone());
                let method = msg.name.clone();
                let id = msg.id;
                let reply_tx = self.tx.clone();
                tokio::spawn(async move {
                    let result = match handler {
                        Some(handler) => handler(msg.payload).await,
                        None => Err(IpcError::UnknownMethod(method.clone()).to_string()),
                    };
                    let _ = reply_tx.send(IpcMessage::response_to(id, &method, result));
                });
            }
            MessageKind::Response => match self.pending.remove(&msg.id) {
                Some((_, tx)) => {
                    let result = match msg.error {
                        Some(error) => Err(IpcError::Remote(error)),
                        None => Ok(msg.payload),
                    };
                    let _ = tx.send(result);
                }
                None => {
                    tracing::debug!(id = %msg.id, "response for unknown or expired request id, dropping");
                }
            },
            MessageKind::Event => {
                self.bus.publish(&msg.name, msg.payload);
            }
        }
    }

    fn connection_lost(&self) {
        self.shutdown.cancel();
        for id in self.pending.iter().map(|e| *e.key()).collect::<Vec<_>>() {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(Err(IpcError::ConnectionClosed));
            }
        }
    }
}

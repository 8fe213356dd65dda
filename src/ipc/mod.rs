//! Transport: RPC and event bus over local sockets.
//!
//! # Data Flow
//! ```text
//! worker process                          master process
//!   WorkerEndpoint ──register──▶ IpcHub (accept loop)
//!   request ───────frame───────▶ handler table ──▶ response frame
//!   emit ──────────frame───────▶ local bus + fan-out to other peers
//!   "<name>.ready" ────────────▶ ReadyTable ──▶ wait_for_process waiters
//! ```
//!
//! # Design Decisions
//! - One envelope shape for requests, responses, and events
//! - Length-prefixed JSON frames; a framing error drops one connection only
//! - Responses for unknown ids are dropped and logged, never fatal
//! - No automatic reconnection; a new worker process registers itself

pub mod bus;
pub mod codec;
pub mod hub;
pub mod message;
pub mod paths;
pub mod ready;
pub mod worker;

use std::sync::Arc;

use serde_json::Value;

/// Reserved peer name for the master endpoint.
pub const MASTER: &str = "master";

/// Boxed future returned by RPC handlers.
pub type HandlerFuture = futures_util::future::BoxFuture<'static, Result<Value, String>>;
/// A registered RPC handler; errors travel back in the response envelope.
pub type RpcHandler = Arc<dyn Fn(Value) -> HandlerFuture + Send + Sync>;

pub use hub::IpcHub;
pub use message::IpcMessage;
pub use paths::SocketRegistry;
pub use worker::WorkerEndpoint;

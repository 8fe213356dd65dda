//! IPC message envelope.
//!
//! One envelope shape carries all three traffic kinds over the control
//! socket: requests, their correlated responses, and bus events. `id`
//! ties a response to its request; `target` on an event restricts
//! delivery to one named peer instead of broadcasting.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event a connecting peer must send first, naming itself.
pub const REGISTER_EVENT: &str = "ipc.register";
/// RPC a worker issues to fetch the current config snapshot.
pub const CONFIG_GET: &str = "config.get";
/// Event carrying a full replacement config snapshot.
pub const CONFIG_UPDATE: &str = "config.update";
/// RPC the supervisor sends to request a graceful worker shutdown.
pub const SHUTDOWN: &str = "shutdown";

/// Event name a worker emits once its initialization completes.
pub fn ready_event(module: &str) -> String {
    format!("{module}.ready")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Request,
    Response,
    Event,
}

/// The wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcMessage {
    pub kind: MessageKind,
    pub id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    pub name: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcMessage {
    pub fn request(method: impl Into<String>, payload: Value, target: Option<String>) -> Self {
        Self {
            kind: MessageKind::Request,
            id: Uuid::new_v4(),
            target,
            name: method.into(),
            payload,
            error: None,
        }
    }

    /// Build the response for a request, carrying either the handler's
    /// result or its error string.
    pub fn response_to(request_id: Uuid, name: &str, result: Result<Value, String>) -> Self {
        let (payload, error) = match result {
            Ok(value) => (value, None),
            Err(message) => (Value::Null, Some(message)),
        };
        Self {
            kind: MessageKind::Response,
            id: request_id,
            target: None,
            name: name.to_string(),
            payload,
            error,
        }
    }

    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: MessageKind::Event,
            id: Uuid::new_v4(),
            target: None,
            name: name.into(),
            payload,
            error: None,
        }
    }

    pub fn event_to(target: impl Into<String>, name: impl Into<String>, payload: Value) -> Self {
        let mut msg = Self::event(name, payload);
        msg.target = Some(target.into());
        msg
    }

    /// The peer name carried by a `REGISTER_EVENT` handshake, if valid.
    pub fn register_name(&self) -> Option<&str> {
        if self.kind == MessageKind::Event && self.name == REGISTER_EVENT {
            self.payload.get("name").and_then(Value::as_str)
        } else {
            None
        }
    }
}

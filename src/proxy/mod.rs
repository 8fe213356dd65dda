//! Proxy router subsystem.
//!
//! # Data Flow
//! ```text
//! Public request (HTTP/HTTPS/WebSocket upgrade)
//!     → server.rs (built-ins: favicon, modules.json, HTTPS redirect)
//!     → router.rs (module name by path prefix or Host subdomain)
//!     → readiness gate (hub) — not ready answers 503, never blocks
//!     → agent.rs (cached client over the module's private socket)
//!     → forward with X-Forwarded-*  /  websocket.rs byte tunnel
//! ```
//!
//! # Design Decisions
//! - Mode `off` is a configuration switch, not a separate code path:
//!   the server just is not started and modules bind their own ports
//! - Agents are cached per module name, created lazily
//! - Certificate rotation swaps material into the live TLS context

pub mod agent;
pub mod router;
pub mod server;
pub mod tls;
pub mod websocket;

pub use router::{resolve, RouteMode, RouteResolution};
pub use server::ProxyServer;

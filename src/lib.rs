//! orchd: single-host module orchestrator.
//!
//! Runs a fixed set of named modules as worker processes, gives them a
//! private control channel back to the master, and reverse-proxies public
//! traffic to whichever module owns a request.

// Core subsystems
pub mod config;
pub mod ipc;
pub mod proxy;
pub mod supervisor;

// Cross-cutting concerns
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod modules;
pub mod observability;

// Worker-side runtime
pub mod worker;

pub use config::{ConfigService, ConfigSnapshot, ConfigSources};
pub use context::AppContext;
pub use ipc::{IpcHub, SocketRegistry, WorkerEndpoint};
pub use lifecycle::Shutdown;
pub use modules::{ModuleDescriptor, ModuleSet};
pub use proxy::ProxyServer;
pub use supervisor::Supervisor;
pub use worker::WorkerRuntime;

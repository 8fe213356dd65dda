//! Process supervision subsystem.
//!
//! # Data Flow
//! ```text
//! start(name)
//!     → registry insert (exclusive, duplicate start warns + no-ops)
//!     → ProcessBackend::spawn (native child or external service)
//!     → readiness handshake over the control channel → Running
//!
//! stop(name)
//!     → one shutdown RPC ──race──▶ Destroyed within the grace period
//!                        └─else─▶ force-kill process tree → Destroyed
//!
//! crash → exit watcher → Destroyed directly (no Stopping)
//! ```
//!
//! # Design Decisions
//! - One state machine for both backends; no ad-hoc backend branching
//! - Record identity over name lookup: superseded handles no-op
//! - Spawn failure leaves the module absent; callers retry explicitly

pub mod backend;
pub mod record;
#[allow(clippy::module_inception)]
pub mod supervisor;

pub use backend::{
    BackendKind, ExternalBackend, NativeBackend, ProcessBackend, SpawnSpec, SpawnedProcess,
};
pub use record::{ProcState, ProcessRecord};
pub use supervisor::{Supervisor, STOP_GRACE};

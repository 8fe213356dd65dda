//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (main.rs):
//!     context → control socket → config service → supervisor → workers
//!     → proxy listeners last (traffic only once workers can be ready)
//!
//! Shutdown (shutdown.rs + signals.rs):
//!     SIGINT/SIGTERM → stop workers (reverse order) → close hub
//!     → remove socket files → exit 0
//! ```
//!
//! # Design Decisions
//! - Signal-triggered shutdown exits 0; fatal bind errors exit non-zero
//! - A master restart is a hard reset of all routing and connection state

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;

//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! defaults + config.* files + explicit paths + inline overrides
//!     → loader.rs (flatten, merge, resolve %res% placeholders)
//!     → ConfigSnapshot (immutable, one generation)
//!     → ArcSwap in service.rs, pushed whole over the control channel
//!
//! On change:
//!     watcher.rs signals → service.rs serializes the reload
//!     → new snapshot swapped and emitted as config.update
//! ```
//!
//! # Design Decisions
//! - Snapshots are rebuilt whole, never incrementally patched
//! - Later sources win per key; whole-value replace, no deep merge
//! - Workers fetch once at startup, then receive full replacements

pub mod loader;
pub mod service;
pub mod snapshot;
pub mod watcher;

pub use loader::ConfigSources;
pub use service::ConfigService;
pub use snapshot::ConfigSnapshot;

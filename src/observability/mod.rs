//! Observability subsystem.
//!
//! Structured logging is initialized in `main` via `tracing-subscriber`;
//! this module carries the metrics side: a Prometheus exporter (gated by
//! `core.metrics_address`) and the per-request recording helpers the
//! proxy handler calls.

pub mod metrics;

//! Metrics collection and exposition.
//!
//! # Metrics
//! - `orchd_proxy_requests_total` (counter): by module, status
//! - `orchd_proxy_request_duration_seconds` (histogram): by module

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter on the given scrape address.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(%addr, "metrics exporter listening"),
        Err(e) => tracing::error!(%addr, error = %e, "failed to install metrics exporter"),
    }
}

/// Record one proxied request's outcome and latency.
pub fn record_proxy_request(module: &str, status: u16, start: Instant) {
    let labels = [
        ("module", module.to_string()),
        ("status", status.to_string()),
    ];
    metrics::counter!("orchd_proxy_requests_total", &labels).increment(1);
    metrics::histogram!(
        "orchd_proxy_request_duration_seconds",
        &[("module", module.to_string())]
    )
    .record(start.elapsed().as_secs_f64());
}

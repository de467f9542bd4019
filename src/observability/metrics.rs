//! Metrics collection and exposition.
//!
//! # Metrics
//! - `relay_requests_total` (counter): gateway requests by service, outcome
//! - `relay_request_duration_seconds` (histogram): gateway latency
//! - `relay_breaker_transitions_total` (counter): breaker state changes
//! - `relay_breaker_failures_while_open_total` (counter): failures on open breakers
//! - `relay_cache_lookups_total` (counter): hits and misses by service
//! - `relay_cache_errors_total` (counter): degraded cache operations
//! - `relay_quota_usage_total` (counter): usage recorded per resource
//! - `relay_quota_rejections_total` (counter): quota denials per resource
//! - `relay_pool_active_connections` (gauge): leases held per service
//! - `relay_pool_exhausted_total` (counter): acquire timeouts per service
//!
//! # Design Decisions
//! - Recording goes through the `metrics` facade; without an installed
//!   recorder every call is a no-op, which keeps unit tests silent

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus exporter and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

/// Record a completed gateway request.
pub fn record_request(service: &str, outcome: &'static str, start: Instant) {
    metrics::counter!(
        "relay_requests_total",
        "service" => service.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    metrics::histogram!("relay_request_duration_seconds", "service" => service.to_string())
        .record(start.elapsed().as_secs_f64());
}

/// Record a breaker state transition.
pub fn record_breaker_transition(service: &str, to: &'static str) {
    metrics::counter!(
        "relay_breaker_transitions_total",
        "service" => service.to_string(),
        "to" => to
    )
    .increment(1);
}

/// Record a failure observed while the breaker was already open.
pub fn record_failure_while_open(service: &str) {
    metrics::counter!(
        "relay_breaker_failures_while_open_total",
        "service" => service.to_string()
    )
    .increment(1);
}

/// Record a cache lookup.
pub fn record_cache_lookup(service: &str, hit: bool) {
    metrics::counter!(
        "relay_cache_lookups_total",
        "service" => service.to_string(),
        "result" => if hit { "hit" } else { "miss" }
    )
    .increment(1);
}

/// Record a cache operation that degraded because of a store failure.
pub fn record_cache_error(op: &'static str) {
    metrics::counter!("relay_cache_errors_total", "op" => op).increment(1);
}

/// Record usage charged against a quota.
pub fn record_quota_usage(resource: &str, amount: u64) {
    metrics::counter!("relay_quota_usage_total", "resource" => resource.to_string())
        .increment(amount);
}

/// Record a quota denial.
pub fn record_quota_rejection(resource: &str) {
    metrics::counter!("relay_quota_rejections_total", "resource" => resource.to_string())
        .increment(1);
}

/// Record the current number of leases held for a service.
pub fn record_pool_active(service: &str, active: usize) {
    metrics::gauge!("relay_pool_active_connections", "service" => service.to_string())
        .set(active as f64);
}

/// Record an acquire that timed out.
pub fn record_pool_exhausted(service: &str) {
    metrics::counter!("relay_pool_exhausted_total", "service" => service.to_string())
        .increment(1);
}

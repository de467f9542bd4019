//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! gateway, breaker, quotas, cache, pool
//!     → logging.rs (tracing events, filtered by RUST_LOG or log_level)
//!     → metrics.rs (relay_* counters, gauges and histograms)
//!
//! Consumers:
//!     → stdout
//!     → Prometheus scrape on observability.metrics_address
//!     → admin API health snapshots (see admin/)
//! ```

pub mod logging;
pub mod metrics;

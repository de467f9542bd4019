//! Request options and health snapshots.

use serde::Serialize;
use std::time::Duration;

use crate::resilience::CircuitState;

/// Per-call options for `Gateway::request`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Cache TTL for a successful response. Falls back to the service's
    /// `cache_ttl_secs`, then `cache.default_ttl_secs`. Zero disables caching.
    pub ttl: Option<Duration>,

    /// Metered resource charged with the upstream's reported cost.
    /// Falls back to the service's `token_resource`.
    pub resource: Option<String>,

    /// Caller's guess at the cost. Informational only; usage is charged
    /// after the fact from the upstream's report.
    pub cost_estimate: Option<u64>,
}

impl RequestOptions {
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_cost_estimate(mut self, estimate: u64) -> Self {
        self.cost_estimate = Some(estimate);
        self
    }
}

/// Health snapshot for one service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceHealth {
    pub service: String,
    pub circuit_state: CircuitState,
    /// Resource reported below: the token quota if any, else the request quota.
    pub quota_resource: Option<String>,
    pub quota_used: u64,
    pub quota_limit: Option<u64>,
    pub pool_utilization: f64,
    pub cache_hit_rate: f64,
}

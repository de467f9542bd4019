//! Error taxonomy for the resilience middleware.
//!
//! # Design Decisions
//! - One enum per layer; `GatewayError` is what callers see
//! - Breaker and quota rejections are fail-fast and never retried here
//! - Pool saturation, timeouts and transport failures are retryable
//! - Cache failures never surface from the gateway (logged, treated as miss)

use std::time::Duration;
use thiserror::Error;

/// Result alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors returned to gateway callers.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The service's breaker is open (or half-open with no probe slot left).
    #[error("circuit open for service '{service}'")]
    CircuitOpen {
        service: String,
        /// Time until the breaker becomes eligible for probing, if known.
        retry_after: Option<Duration>,
    },

    /// The metered resource is at or above its limit for the current window.
    #[error("quota exceeded for '{resource}': {used}/{limit} used")]
    QuotaExceeded {
        resource: String,
        used: u64,
        limit: u64,
        resets_in: Duration,
    },

    /// No pooled connection became available in time.
    #[error("connection pool exhausted for service '{service}' after {waited:?}")]
    PoolExhausted { service: String, waited: Duration },

    /// The upstream call itself failed.
    #[error("upstream '{service}' failed: {source}")]
    Upstream {
        service: String,
        #[source]
        source: UpstreamFailure,
    },

    /// The upstream call did not complete within the request timeout.
    #[error("upstream '{service}' timed out after {after:?}")]
    Timeout { service: String, after: Duration },

    /// The service is not configured.
    #[error("unknown service '{0}'")]
    UnknownService(String),

    /// The quota resource is not configured.
    #[error("unknown quota resource '{0}'")]
    UnknownResource(String),

    /// Shared store failure on a path that must fail closed.
    #[error("shared store error: {0}")]
    Store(#[from] StoreError),
}

impl GatewayError {
    /// Whether a caller may reasonably retry the same request later with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::PoolExhausted { .. } | GatewayError::Timeout { .. } => true,
            GatewayError::Upstream { source, .. } => source.is_retryable(),
            GatewayError::Store(StoreError::Contention(_)) => true,
            _ => false,
        }
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::CircuitOpen { .. } => "circuit_open",
            GatewayError::QuotaExceeded { .. } => "quota_exceeded",
            GatewayError::PoolExhausted { .. } => "pool_exhausted",
            GatewayError::Upstream { .. } => "upstream",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::UnknownService(_) => "unknown_service",
            GatewayError::UnknownResource(_) => "unknown_resource",
            GatewayError::Store(_) => "store",
        }
    }
}

/// Failure reported by an upstream transport.
#[derive(Debug, Error)]
pub enum UpstreamFailure {
    /// The upstream answered with an error status.
    #[error("status {status}: {body}")]
    Status { status: u16, body: String },

    /// Connection-level failure (DNS, refused, reset).
    #[error("transport error: {0}")]
    Transport(String),

    /// The response could not be decoded.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl UpstreamFailure {
    /// Transport errors and 429/5xx statuses are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            UpstreamFailure::Transport(_) => true,
            UpstreamFailure::Status { status, .. } => *status == 429 || *status >= 500,
            UpstreamFailure::InvalidResponse(_) => false,
        }
    }
}

/// Errors raised by the shared store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A compare-and-swap loop gave up after repeated conflicts.
    #[error("too much contention on key '{0}'")]
    Contention(String),

    /// A stored record could not be decoded.
    #[error("corrupt record at '{key}': {reason}")]
    Corrupt { key: String, reason: String },
}

/// Response cache failures. Logged and counted, never propagated to callers.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store error: {0}")]
    Store(#[from] StoreError),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        let pool = GatewayError::PoolExhausted {
            service: "llm".into(),
            waited: Duration::from_secs(1),
        };
        assert!(pool.is_retryable());

        let open = GatewayError::CircuitOpen {
            service: "llm".into(),
            retry_after: None,
        };
        assert!(!open.is_retryable());

        let quota = GatewayError::QuotaExceeded {
            resource: "llm_tokens".into(),
            used: 120,
            limit: 100,
            resets_in: Duration::from_secs(10),
        };
        assert!(!quota.is_retryable());

        let bad_request = GatewayError::Upstream {
            service: "github".into(),
            source: UpstreamFailure::Status { status: 404, body: String::new() },
        };
        assert!(!bad_request.is_retryable());

        let throttled = GatewayError::Upstream {
            service: "github".into(),
            source: UpstreamFailure::Status { status: 429, body: String::new() },
        };
        assert!(throttled.is_retryable());
    }
}

//! Resilient request gateway.
//!
//! # Data Flow
//! ```text
//! request(service, operation, payload, options)
//!     → cache lookup                      hit → return (nothing else touched)
//!     → breaker check_state               deny → CircuitOpen
//!     → quota check (request + token)     exhausted → QuotaExceeded
//!     → pool acquire                      timeout → PoolExhausted
//!     → breaker acquire (probe slot when half-open)
//!     → upstream call under request timeout
//!     → success: record success, charge usage, cache response
//!     → failure: record failure, typed error, nothing cached
//! ```
//!
//! # Design Decisions
//! - Components are injected; the gateway owns no process-wide state
//! - Request-rate quotas are charged for every upstream attempt, token
//!   quotas only for successful calls with reported usage
//! - Failures to record an outcome are logged; they never replace the
//!   upstream's answer

pub mod request;
pub mod upstream;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use thiserror::Error;

use crate::cache::{Fingerprint, ResponseCache};
use crate::clock::Clock;
use crate::config::{ConfigError, RelayConfig, RetryConfig, ServiceConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::observability::metrics;
use crate::pool::{ConnectionPool, PoolBuildError};
use crate::resilience::{retry_with_backoff, CircuitBreaker, QuotaManager};
use crate::store::SharedStore;

pub use request::{RequestOptions, ServiceHealth};
pub use upstream::{extract_cost, HttpUpstream, Upstream, UpstreamResponse};

/// Errors raised while assembling a gateway.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Pool(#[from] PoolBuildError),
}

/// Pre-built components for `Gateway::new`.
#[derive(Debug)]
pub struct GatewayParts {
    pub services: Vec<ServiceConfig>,
    pub breaker: Arc<CircuitBreaker>,
    pub quotas: QuotaManager,
    pub cache: ResponseCache,
    pub pool: ConnectionPool,
    pub upstream: Arc<dyn Upstream>,
    pub store: Arc<dyn SharedStore>,
    pub request_timeout: Duration,
    pub retries: RetryConfig,
}

/// Composes cache, breaker, quotas and pool around upstream calls.
#[derive(Debug)]
pub struct Gateway {
    services: HashMap<String, ServiceConfig>,
    breaker: Arc<CircuitBreaker>,
    quotas: QuotaManager,
    cache: ResponseCache,
    pool: ConnectionPool,
    upstream: Arc<dyn Upstream>,
    store: Arc<dyn SharedStore>,
    request_timeout: Duration,
    retries: RetryConfig,
}

impl Gateway {
    pub fn new(parts: GatewayParts) -> Self {
        Self {
            services: parts
                .services
                .into_iter()
                .map(|s| (s.name.clone(), s))
                .collect(),
            breaker: parts.breaker,
            quotas: parts.quotas,
            cache: parts.cache,
            pool: parts.pool,
            upstream: parts.upstream,
            store: parts.store,
            request_timeout: parts.request_timeout,
            retries: parts.retries,
        }
    }

    /// Build every component from configuration.
    pub fn from_config(
        config: &RelayConfig,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
        upstream: Arc<dyn Upstream>,
    ) -> Result<Self, BuildError> {
        let breaker = Arc::new(CircuitBreaker::new(
            config.breaker.clone(),
            store.clone(),
            clock.clone(),
        )?);
        let quotas = QuotaManager::new(config.effective_quotas(), store.clone(), clock.clone());
        let cache = ResponseCache::new(config.cache.clone(), store.clone(), clock);
        let pool = ConnectionPool::new(&config.pool, &config.timeouts, &config.services)?;

        tracing::info!(
            services = config.services.len(),
            quotas = config.effective_quotas().len(),
            "Gateway assembled"
        );

        Ok(Self::new(GatewayParts {
            services: config.services.clone(),
            breaker,
            quotas,
            cache,
            pool,
            upstream,
            store,
            request_timeout: Duration::from_secs(config.timeouts.request_secs),
            retries: config.retries.clone(),
        }))
    }

    /// Execute one call through the resilience stack.
    pub async fn request(
        &self,
        service: &str,
        operation: &str,
        payload: Value,
        options: RequestOptions,
    ) -> GatewayResult<Value> {
        let started = Instant::now();
        let result = self.execute(service, operation, &payload, &options).await;

        let outcome = match &result {
            Ok((_, true)) => "cache_hit",
            Ok((_, false)) => "success",
            Err(e) => e.kind(),
        };
        metrics::record_request(service, outcome, started);

        result.map(|(value, _)| value)
    }

    /// `request`, retried with backoff while the error is retryable.
    pub async fn request_with_retry(
        &self,
        service: &str,
        operation: &str,
        payload: Value,
        options: RequestOptions,
    ) -> GatewayResult<Value> {
        retry_with_backoff(&self.retries, service, move |_| {
            self.request(service, operation, payload.clone(), options.clone())
        })
        .await
    }

    /// Returns the value and whether it came from cache.
    async fn execute(
        &self,
        service: &str,
        operation: &str,
        payload: &Value,
        options: &RequestOptions,
    ) -> GatewayResult<(Value, bool)> {
        let config = self.service_config(service)?;

        let fingerprint = Fingerprint::new(service, operation, payload);
        if let Some(cached) = self.cache.get(&fingerprint).await {
            tracing::debug!(service = %service, operation = %operation, "Cache hit");
            return Ok((cached, true));
        }

        let admission = self.breaker.check_state(service).await;
        if !admission.is_allowed() {
            return Err(GatewayError::CircuitOpen {
                service: service.to_string(),
                retry_after: admission.retry_after,
            });
        }

        let request_resource = config
            .requests_per_window
            .map(|_| config.request_resource());
        let token_resource = options
            .resource
            .clone()
            .or_else(|| config.token_resource.clone());

        if let Some(resource) = &request_resource {
            self.quotas.check(resource).await?;
        }
        if let Some(resource) = &token_resource {
            self.quotas.check(resource).await?;
        }

        let lease = self.pool.acquire(service).await?;
        let permit = self.breaker.acquire(service).await?;

        let outcome = tokio::time::timeout(
            self.request_timeout,
            self.upstream.call(&lease, config, operation, payload),
        )
        .await;
        drop(lease);

        if let Some(resource) = &request_resource {
            if let Err(e) = self.quotas.record(resource, 1).await {
                tracing::warn!(resource = %resource, error = %e, "Failed to record request usage");
            }
        }

        let failure = match outcome {
            Ok(Ok(response)) => {
                if let Err(e) = permit.success().await {
                    tracing::warn!(service = %service, error = %e, "Failed to record success");
                }

                if let (Some(resource), Some(cost)) = (&token_resource, response.cost) {
                    if cost > 0 {
                        if let Err(e) = self.quotas.record(resource, cost).await {
                            tracing::warn!(resource = %resource, cost, error = %e, "Failed to record usage");
                        }
                    }
                }

                let ttl = options
                    .ttl
                    .or_else(|| config.cache_ttl_secs.map(Duration::from_secs))
                    .unwrap_or_else(|| self.cache.default_ttl());
                self.cache.set(&fingerprint, response.body.clone(), ttl).await;

                return Ok((response.body, false));
            }
            Ok(Err(source)) => GatewayError::Upstream {
                service: service.to_string(),
                source,
            },
            Err(_) => GatewayError::Timeout {
                service: service.to_string(),
                after: self.request_timeout,
            },
        };

        tracing::warn!(service = %service, operation = %operation, error = %failure, "Upstream call failed");
        if let Err(e) = permit.failure().await {
            tracing::warn!(service = %service, error = %e, "Failed to record failure");
        }
        Err(failure)
    }

    /// Health snapshot for one service.
    pub async fn health(&self, service: &str) -> GatewayResult<ServiceHealth> {
        let config = self.service_config(service)?;
        let circuit_state = self.breaker.state(service).await;

        let quota_resource = config
            .token_resource
            .clone()
            .or_else(|| config.requests_per_window.map(|_| config.request_resource()));
        let (quota_used, quota_limit) = match &quota_resource {
            Some(resource) => {
                let status = self.quotas.status(resource).await?;
                (status.used, Some(status.limit))
            }
            None => (0, None),
        };

        Ok(ServiceHealth {
            service: service.to_string(),
            circuit_state,
            quota_resource,
            quota_used,
            quota_limit,
            pool_utilization: self
                .pool
                .health(service)
                .map(|h| h.utilization_ratio)
                .unwrap_or(0.0),
            cache_hit_rate: self.cache.hit_rate(service),
        })
    }

    /// Configured service names, sorted.
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.services.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn service_config(&self, service: &str) -> GatewayResult<&ServiceConfig> {
        self.services
            .get(service)
            .ok_or_else(|| GatewayError::UnknownService(service.to_string()))
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn quotas(&self) -> &QuotaManager {
        &self.quotas
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }
}

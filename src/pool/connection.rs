//! Bounded per-service connection pool.
//!
//! # Responsibilities
//! - Cap concurrent upstream calls per service (`limit`)
//! - Cap concurrent calls per upstream host across services (`limit_per_host`)
//! - Hand out leases that are returned on every exit path
//! - Report utilization for backpressure decisions
//!
//! # Design Decisions
//! - Slots are semaphore permits owned by the lease; dropping the lease (or
//!   the pending `acquire` future) releases them, so cancellation cannot leak
//! - Permits are always taken service first, host second
//! - The transport itself is a shared `reqwest::Client` per service; the pool
//!   bounds how many calls use it at once

use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use url::Url;

use crate::config::{PoolConfig, ServiceConfig, TimeoutConfig};
use crate::error::{GatewayError, GatewayResult};
use crate::observability::metrics;

static LEASE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Errors raised while building the pool.
#[derive(Debug, Error)]
pub enum PoolBuildError {
    #[error("service '{service}' has an invalid base_url: {source}")]
    InvalidUrl {
        service: String,
        #[source]
        source: url::ParseError,
    },

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// The transport handle a lease grants access to.
#[derive(Debug, Clone)]
pub struct Connection {
    pub service: String,
    pub host: String,
    pub base_url: Url,
    pub client: reqwest::Client,
    pub acquired_at: Instant,
    pub lease_id: u64,
}

/// Exclusive hold on one pool slot. Released on drop.
#[derive(Debug)]
pub struct Lease {
    connection: Connection,
    active: Arc<AtomicUsize>,
    _service_permit: OwnedSemaphorePermit,
    _host_permit: OwnedSemaphorePermit,
}

impl Deref for Lease {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        let remaining = self.active.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::record_pool_active(&self.connection.service, remaining);
        tracing::trace!(
            service = %self.connection.service,
            lease_id = self.connection.lease_id,
            held_ms = self.connection.acquired_at.elapsed().as_millis() as u64,
            "Lease released"
        );
    }
}

/// Utilization snapshot for one service.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolHealth {
    pub service: String,
    pub active_connections: usize,
    pub limit: usize,
    pub utilization_ratio: f64,
}

#[derive(Debug)]
struct ServicePool {
    host: String,
    base_url: Url,
    client: reqwest::Client,
    slots: Arc<Semaphore>,
    host_slots: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
}

#[derive(Debug)]
pub struct ConnectionPool {
    config: PoolConfig,
    services: HashMap<String, ServicePool>,
}

impl ConnectionPool {
    pub fn new(
        config: &PoolConfig,
        timeouts: &TimeoutConfig,
        services: &[ServiceConfig],
    ) -> Result<Self, PoolBuildError> {
        let mut hosts: HashMap<String, Arc<Semaphore>> = HashMap::new();
        let mut pools = HashMap::new();

        for service in services {
            let base_url =
                Url::parse(&service.base_url).map_err(|source| PoolBuildError::InvalidUrl {
                    service: service.name.clone(),
                    source,
                })?;
            let host = match (base_url.host_str(), base_url.port_or_known_default()) {
                (Some(h), Some(p)) => format!("{}:{}", h, p),
                (Some(h), None) => h.to_string(),
                (None, _) => service.name.clone(),
            };

            let client = reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(timeouts.connect_secs))
                .pool_max_idle_per_host(config.limit_per_host)
                .build()?;

            let host_slots = hosts
                .entry(host.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(config.limit_per_host)))
                .clone();

            tracing::debug!(service = %service.name, host = %host, limit = config.limit, "Pool created");
            pools.insert(
                service.name.clone(),
                ServicePool {
                    host,
                    base_url,
                    client,
                    slots: Arc::new(Semaphore::new(config.limit)),
                    host_slots,
                    active: Arc::new(AtomicUsize::new(0)),
                },
            );
        }

        Ok(Self {
            config: config.clone(),
            services: pools,
        })
    }

    /// Wait for a free slot, up to the configured acquire timeout.
    ///
    /// Dropping the returned future before it completes releases anything it
    /// had already reserved.
    pub async fn acquire(&self, service: &str) -> GatewayResult<Lease> {
        let pool = self
            .services
            .get(service)
            .ok_or_else(|| GatewayError::UnknownService(service.to_string()))?;

        let started = Instant::now();
        let reserve = async {
            let service_permit = pool.slots.clone().acquire_owned().await?;
            let host_permit = pool.host_slots.clone().acquire_owned().await?;
            Ok::<_, tokio::sync::AcquireError>((service_permit, host_permit))
        };

        let (service_permit, host_permit) =
            match tokio::time::timeout(self.config.acquire_timeout(), reserve).await {
                Ok(Ok(permits)) => permits,
                Ok(Err(_)) | Err(_) => {
                    let waited = started.elapsed();
                    metrics::record_pool_exhausted(service);
                    tracing::warn!(
                        service = %service,
                        waited_ms = waited.as_millis() as u64,
                        "Connection pool exhausted"
                    );
                    return Err(GatewayError::PoolExhausted {
                        service: service.to_string(),
                        waited,
                    });
                }
            };

        let active = pool.active.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::record_pool_active(service, active);

        let lease_id = LEASE_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(service = %service, lease_id, active, "Lease granted");

        Ok(Lease {
            connection: Connection {
                service: service.to_string(),
                host: pool.host.clone(),
                base_url: pool.base_url.clone(),
                client: pool.client.clone(),
                acquired_at: Instant::now(),
                lease_id,
            },
            active: pool.active.clone(),
            _service_permit: service_permit,
            _host_permit: host_permit,
        })
    }

    pub fn health(&self, service: &str) -> Option<PoolHealth> {
        self.services.get(service).map(|pool| {
            let active = pool.active.load(Ordering::SeqCst);
            PoolHealth {
                service: service.to_string(),
                active_connections: active,
                limit: self.config.limit,
                utilization_ratio: if self.config.limit == 0 {
                    1.0
                } else {
                    active as f64 / self.config.limit as f64
                },
            }
        })
    }

    /// Utilization of every service pool, sorted by service name.
    pub fn health_check(&self) -> Vec<PoolHealth> {
        let mut names: Vec<&String> = self.services.keys().collect();
        names.sort();
        names
            .into_iter()
            .filter_map(|name| self.health(name))
            .collect()
    }

    /// Free slots for a service, ignoring the host limit.
    pub fn available(&self, service: &str) -> Option<usize> {
        self.services
            .get(service)
            .map(|pool| pool.slots.available_permits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, base_url: &str) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            base_url: base_url.to_string(),
            ..ServiceConfig::default()
        }
    }

    fn pool(limit: usize, limit_per_host: usize, services: &[ServiceConfig]) -> ConnectionPool {
        let config = PoolConfig {
            limit,
            limit_per_host,
            acquire_timeout_ms: 50,
        };
        ConnectionPool::new(&config, &TimeoutConfig::default(), services).unwrap()
    }

    #[tokio::test]
    async fn never_exceeds_limit() {
        let pool = pool(2, 10, &[service("x", "http://x.test")]);
        let a = pool.acquire("x").await.unwrap();
        let _b = pool.acquire("x").await.unwrap();

        match pool.acquire("x").await {
            Err(GatewayError::PoolExhausted { service, waited }) => {
                assert_eq!(service, "x");
                assert!(waited >= Duration::from_millis(50));
            }
            other => panic!("expected exhaustion, got {:?}", other.map(|l| l.lease_id)),
        }

        drop(a);
        assert!(pool.acquire("x").await.is_ok());
    }

    #[tokio::test]
    async fn cancelled_acquire_does_not_leak() {
        let config = PoolConfig {
            limit: 1,
            limit_per_host: 1,
            acquire_timeout_ms: 10_000,
        };
        let pool = Arc::new(
            ConnectionPool::new(&config, &TimeoutConfig::default(), &[service("x", "http://x.test")])
                .unwrap(),
        );

        let held = pool.acquire("x").await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire("x").await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        drop(held);
        assert_eq!(pool.available("x"), Some(1));
        assert_eq!(pool.health("x").unwrap().active_connections, 0);
        let again = pool.acquire("x").await.unwrap();
        assert_eq!(again.service, "x");
    }

    #[tokio::test]
    async fn host_limit_is_shared_across_services() {
        let pool = pool(
            10,
            1,
            &[
                service("a", "https://api.shared.test/v1"),
                service("b", "https://api.shared.test/v2"),
                service("c", "https://other.test"),
            ],
        );
        let lease = pool.acquire("a").await.unwrap();
        assert_eq!(lease.host, "api.shared.test:443");
        assert!(matches!(
            pool.acquire("b").await,
            Err(GatewayError::PoolExhausted { .. })
        ));
        assert!(pool.acquire("c").await.is_ok());
    }

    #[tokio::test]
    async fn reports_utilization() {
        let pool = pool(4, 4, &[service("x", "http://x.test"), service("y", "http://y.test")]);
        let _l1 = pool.acquire("x").await.unwrap();
        let _l2 = pool.acquire("x").await.unwrap();

        let health = pool.health_check();
        assert_eq!(health.len(), 2);
        assert_eq!(health[0].service, "x");
        assert_eq!(health[0].active_connections, 2);
        assert_eq!(health[0].limit, 4);
        assert!((health[0].utilization_ratio - 0.5).abs() < f64::EPSILON);
        assert_eq!(health[1].active_connections, 0);
    }

    #[tokio::test]
    async fn unknown_service_is_rejected() {
        let pool = pool(1, 1, &[]);
        assert!(matches!(
            pool.acquire("nope").await,
            Err(GatewayError::UnknownService(_))
        ));
    }

    #[test]
    fn invalid_url_fails_construction() {
        let result = ConnectionPool::new(
            &PoolConfig::default(),
            &TimeoutConfig::default(),
            &[service("x", "not a url")],
        );
        assert!(matches!(result, Err(PoolBuildError::InvalidUrl { .. })));
    }
}

//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the relay.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the relay.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Upstream services (metrics providers and the LLM endpoint).
    pub services: Vec<ServiceConfig>,

    /// Metered resources and their per-window limits.
    pub quotas: Vec<QuotaConfig>,

    /// Circuit breaker thresholds.
    pub breaker: BreakerConfig,

    /// Response cache settings.
    pub cache: CacheConfig,

    /// Connection pool limits.
    pub pool: PoolConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Retry configuration.
    pub retries: RetryConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API settings.
    pub admin: AdminConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let metrics_providers = [
            ("coingecko", "https://api.coingecko.com/api/v3", "COINGECKO_API_KEY", 50),
            ("coinmarketcap", "https://pro-api.coinmarketcap.com/v1", "COINMARKETCAP_API_KEY", 30),
            ("social_searcher", "https://api.social-searcher.com/v2", "SOCIAL_SEARCHER_API_KEY", 100),
            ("github", "https://api.github.com", "GITHUB_TOKEN", 5000),
        ];

        let mut services: Vec<ServiceConfig> = metrics_providers
            .iter()
            .map(|(name, url, key_env, requests)| ServiceConfig {
                name: name.to_string(),
                base_url: url.to_string(),
                method: HttpMethod::Get,
                api_key_env: Some(key_env.to_string()),
                api_key_header: None,
                requests_per_window: Some(*requests),
                rate_window_secs: default_window_secs(),
                token_resource: None,
                cache_ttl_secs: None,
            })
            .collect();

        services.push(ServiceConfig {
            name: "llm".to_string(),
            base_url: "https://api.anthropic.com/v1".to_string(),
            method: HttpMethod::Post,
            api_key_env: Some("CLAUDE_API_KEY".to_string()),
            api_key_header: Some("x-api-key".to_string()),
            requests_per_window: None,
            rate_window_secs: default_window_secs(),
            token_resource: Some("llm_tokens".to_string()),
            cache_ttl_secs: Some(3600),
        });

        Self {
            services,
            quotas: vec![QuotaConfig {
                resource: "llm_tokens".to_string(),
                limit: 100_000,
                window_secs: 60,
            }],
            breaker: BreakerConfig::default(),
            cache: CacheConfig::default(),
            pool: PoolConfig::default(),
            timeouts: TimeoutConfig::default(),
            retries: RetryConfig::default(),
            observability: ObservabilityConfig::default(),
            admin: AdminConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Look up a service by name.
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    /// All quotas, including the request-rate quota derived from each
    /// service's `requests_per_window`. An explicit `quotas` entry with the
    /// same resource name takes precedence over the derived one.
    pub fn effective_quotas(&self) -> Vec<QuotaConfig> {
        let mut quotas = self.quotas.clone();
        for service in &self.services {
            let Some(limit) = service.requests_per_window else {
                continue;
            };
            let resource = service.request_resource();
            if quotas.iter().any(|q| q.resource == resource) {
                continue;
            }
            quotas.push(QuotaConfig {
                resource,
                limit,
                window_secs: service.rate_window_secs,
            });
        }
        quotas
    }
}

/// HTTP method used to reach an upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HttpMethod {
    /// Payload is sent as query parameters.
    #[default]
    Get,
    /// Payload is sent as a JSON body.
    Post,
}

/// One upstream dependency.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Service identity used to partition breaker, pool and cache state.
    pub name: String,

    /// Base URL; operations are appended as paths.
    pub base_url: String,

    /// HTTP method used for every operation.
    #[serde(default)]
    pub method: HttpMethod,

    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Header carrying the API key. Defaults to `Authorization: Bearer`.
    #[serde(default)]
    pub api_key_header: Option<String>,

    /// Request-rate ceiling per rate window (metered as `requests:{name}`).
    #[serde(default)]
    pub requests_per_window: Option<u64>,

    /// Length of the request-rate window, in seconds.
    #[serde(default = "default_window_secs")]
    pub rate_window_secs: u64,

    /// Token quota charged with the upstream's reported usage.
    #[serde(default)]
    pub token_resource: Option<String>,

    /// Per-service default cache TTL, overriding `cache.default_ttl_secs`.
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_url: String::new(),
            method: HttpMethod::default(),
            api_key_env: None,
            api_key_header: None,
            requests_per_window: None,
            rate_window_secs: default_window_secs(),
            token_resource: None,
            cache_ttl_secs: None,
        }
    }
}

impl ServiceConfig {
    /// Name of the request-rate quota for this service.
    pub fn request_resource(&self) -> String {
        format!("requests:{}", self.name)
    }
}

/// A metered resource.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QuotaConfig {
    /// Resource name (e.g. "llm_tokens").
    pub resource: String,

    /// Maximum usage per window.
    pub limit: u64,

    /// Window length in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl QuotaConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

fn default_window_secs() -> u64 {
    60
}

/// Circuit breaker configuration (shared by all services).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed breaker.
    pub failure_threshold: u32,

    /// Time an open breaker waits before admitting probes, in milliseconds.
    pub recovery_timeout_ms: u64,

    /// Concurrent probes admitted while half-open; also the number of
    /// successful probes needed to close.
    pub half_open_limit: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            half_open_limit: 1,
        }
    }
}

impl BreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Response cache configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Enable response caching.
    pub enabled: bool,

    /// TTL applied when neither the request nor the service sets one.
    pub default_ttl_secs: u64,

    /// Maximum entries held in the local tier.
    pub max_local_entries: usize,

    /// Interval between sweeps of expired local entries and shared-store keys.
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: 300,
            max_local_entries: 10_000,
            sweep_interval_secs: 30,
        }
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum concurrent connections per service.
    pub limit: usize,

    /// Maximum concurrent connections per upstream host.
    pub limit_per_host: usize,

    /// How long `acquire` waits before giving up, in milliseconds.
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            limit_per_host: 30,
            acquire_timeout_ms: 5_000,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Connection establishment timeout in seconds.
    pub connect_secs: u64,

    /// Upstream request timeout in seconds.
    pub request_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_secs: 5,
            request_secs: 30,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries in `Gateway::request_with_retry`.
    pub enabled: bool,

    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,

    /// Base delay for exponential backoff in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 2000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

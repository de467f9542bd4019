//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (token quotas reference declared resources)
//! - Validate value ranges (thresholds > 0, limits > 0)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: RelayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use url::Url;

use crate::config::schema::RelayConfig;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path of the offending field.
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &RelayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.breaker.failure_threshold == 0 {
        errors.push(ValidationError::new("breaker.failure_threshold", "must be greater than 0"));
    }
    if config.breaker.half_open_limit == 0 {
        errors.push(ValidationError::new("breaker.half_open_limit", "must be greater than 0"));
    }
    if config.breaker.recovery_timeout_ms == 0 {
        errors.push(ValidationError::new("breaker.recovery_timeout_ms", "must be greater than 0"));
    }

    if config.pool.limit == 0 {
        errors.push(ValidationError::new("pool.limit", "must be greater than 0"));
    }
    if config.pool.limit_per_host == 0 {
        errors.push(ValidationError::new("pool.limit_per_host", "must be greater than 0"));
    }
    if config.pool.limit_per_host > config.pool.limit {
        errors.push(ValidationError::new("pool.limit_per_host", "must not exceed pool.limit"));
    }
    if config.cache.sweep_interval_secs == 0 {
        errors.push(ValidationError::new("cache.sweep_interval_secs", "must be greater than 0"));
    }
    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be greater than 0"));
    }
    if config.retries.enabled && config.retries.max_attempts == 0 {
        errors.push(ValidationError::new("retries.max_attempts", "must be greater than 0"));
    }

    let mut resources = HashSet::new();
    for (i, quota) in config.quotas.iter().enumerate() {
        if quota.limit == 0 {
            errors.push(ValidationError::new(format!("quotas[{}].limit", i), "must be greater than 0"));
        }
        if quota.window_secs == 0 {
            errors.push(ValidationError::new(format!("quotas[{}].window_secs", i), "must be greater than 0"));
        }
        if !resources.insert(quota.resource.as_str()) {
            errors.push(ValidationError::new(
                format!("quotas[{}].resource", i),
                format!("duplicate resource '{}'", quota.resource),
            ));
        }
    }

    let mut names = HashSet::new();
    for (i, service) in config.services.iter().enumerate() {
        if service.name.is_empty() {
            errors.push(ValidationError::new(format!("services[{}].name", i), "must not be empty"));
        }
        if service.name.contains(':') {
            errors.push(ValidationError::new(
                format!("services[{}].name", i),
                "must not contain ':' (reserved as the cache key separator)",
            ));
        }
        if !names.insert(service.name.as_str()) {
            errors.push(ValidationError::new(
                format!("services[{}].name", i),
                format!("duplicate service '{}'", service.name),
            ));
        }
        if let Err(e) = Url::parse(&service.base_url) {
            errors.push(ValidationError::new(
                format!("services[{}].base_url", i),
                format!("invalid URL '{}': {}", service.base_url, e),
            ));
        }
        if service.requests_per_window == Some(0) {
            errors.push(ValidationError::new(
                format!("services[{}].requests_per_window", i),
                "must be greater than 0",
            ));
        }
        if service.requests_per_window.is_some() && service.rate_window_secs == 0 {
            errors.push(ValidationError::new(
                format!("services[{}].rate_window_secs", i),
                "must be greater than 0",
            ));
        }
        if let Some(resource) = &service.token_resource {
            if !resources.contains(resource.as_str()) {
                errors.push(ValidationError::new(
                    format!("services[{}].token_resource", i),
                    format!("references undeclared quota '{}'", resource),
                ));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

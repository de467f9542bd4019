//! Fixed-window usage quotas.
//!
//! # Responsibilities
//! - Admit or deny work against a per-resource limit
//! - Charge actual usage after the fact
//! - Roll windows over exactly once across all instances
//!
//! # Design Decisions
//! - The window start lives at `quota:{resource}:window`; rollover is a
//!   compare-and-swap, so concurrent instances agree on a single start
//! - Usage is counted at `quota:{resource}:used:{window_start}` with an
//!   atomic increment; a new window is a new key, so a reset can never
//!   clobber increments racing with it
//! - Check and record are separate steps: concurrent callers may all pass the
//!   check and overshoot the limit. The overshoot is kept and denies further
//!   work until the window rolls over.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::clock::{duration_ms, Clock};
use crate::config::QuotaConfig;
use crate::error::{GatewayError, GatewayResult, StoreError};
use crate::observability::metrics;
use crate::store::{decode_counter, SharedStore, StoreResult, QUOTA_NAMESPACE};

const MAX_CAS_ATTEMPTS: usize = 32;

/// Usage snapshot for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub resource: String,
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    /// Milliseconds since epoch when the current window began.
    pub window_start_ms: u64,
    pub resets_in: Duration,
}

impl QuotaStatus {
    pub fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }
}

/// Tracks usage against configured limits in the shared store.
#[derive(Debug)]
pub struct QuotaManager {
    quotas: HashMap<String, QuotaConfig>,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
}

impl QuotaManager {
    pub fn new(
        quotas: impl IntoIterator<Item = QuotaConfig>,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            quotas: quotas
                .into_iter()
                .map(|q| (q.resource.clone(), q))
                .collect(),
            store,
            clock,
        }
    }

    /// Configured resource names.
    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.quotas.keys().map(String::as_str)
    }

    pub fn limit(&self, resource: &str) -> Option<u64> {
        self.quotas.get(resource).map(|q| q.limit)
    }

    /// Admit work if the resource is under its limit.
    ///
    /// Does not reserve anything; charge usage with `record` afterwards.
    pub async fn check(&self, resource: &str) -> GatewayResult<QuotaStatus> {
        let status = self.status(resource).await?;
        if status.is_exhausted() {
            metrics::record_quota_rejection(resource);
            tracing::debug!(
                resource = %resource,
                used = status.used,
                limit = status.limit,
                "Quota exceeded"
            );
            return Err(GatewayError::QuotaExceeded {
                resource: status.resource,
                used: status.used,
                limit: status.limit,
                resets_in: status.resets_in,
            });
        }
        Ok(status)
    }

    /// Charge `amount` against the current window. Returns the new total.
    pub async fn record(&self, resource: &str, amount: u64) -> GatewayResult<u64> {
        let quota = self.quota(resource)?;
        let window_start = self.current_window(quota).await?;
        let key = Self::used_key(resource, window_start);
        let total = self
            .store
            .incr_by(&key, amount, Some(quota.window() * 2))
            .await?;

        metrics::record_quota_usage(resource, amount);
        tracing::trace!(resource = %resource, amount, total, "Quota usage recorded");
        Ok(total)
    }

    /// Current usage without admission side effects.
    pub async fn status(&self, resource: &str) -> GatewayResult<QuotaStatus> {
        let quota = self.quota(resource)?;
        let window_start = self.current_window(quota).await?;
        let key = Self::used_key(resource, window_start);
        let used = match self.store.get(&key).await? {
            Some(v) => decode_counter(&key, &v.value)?,
            None => 0,
        };

        let window_ms = duration_ms(quota.window());
        let elapsed = self.clock.now_ms().saturating_sub(window_start);
        Ok(QuotaStatus {
            resource: resource.to_string(),
            used,
            limit: quota.limit,
            remaining: quota.limit.saturating_sub(used),
            window_start_ms: window_start,
            resets_in: Duration::from_millis(window_ms.saturating_sub(elapsed)),
        })
    }

    fn quota(&self, resource: &str) -> GatewayResult<&QuotaConfig> {
        self.quotas
            .get(resource)
            .ok_or_else(|| GatewayError::UnknownResource(resource.to_string()))
    }

    fn window_key(resource: &str) -> String {
        format!("{}{}:window", QUOTA_NAMESPACE, resource)
    }

    fn used_key(resource: &str, window_start: u64) -> String {
        format!("{}{}:used:{}", QUOTA_NAMESPACE, resource, window_start)
    }

    /// Start of the active window, rolling over when the previous one elapsed.
    async fn current_window(&self, quota: &QuotaConfig) -> StoreResult<u64> {
        let key = Self::window_key(&quota.resource);
        let window_ms = duration_ms(quota.window());
        let ttl = Some(quota.window() * 2);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let now = self.clock.now_ms();
            let (start, version) = match self.store.get(&key).await? {
                Some(v) => (Some(decode_counter(&key, &v.value)?), Some(v.version)),
                None => (None, None),
            };

            if let Some(start) = start {
                if now.saturating_sub(start) < window_ms {
                    return Ok(start);
                }
            }

            let value = now.to_string().into_bytes();
            if self
                .store
                .compare_and_swap(&key, version, value, ttl)
                .await?
            {
                tracing::debug!(resource = %quota.resource, window_start = now, "Quota window started");
                return Ok(now);
            }
            // Another instance rolled the window first; adopt its start.
        }
        Err(StoreError::Contention(key))
    }
}

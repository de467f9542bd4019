//! Two-tier response cache.
//!
//! # Responsibilities
//! - Serve repeated requests without touching the upstream
//! - Keep a bounded local tier in front of the shared `cache:` namespace
//! - Propagate invalidations to every instance's local tier
//!
//! # Design Decisions
//! - Expiry is lazy: reads ignore expired entries, `sweep_expired` reclaims them
//! - Writes are last-writer-wins; entries are replaced, never mutated
//! - Store failures degrade to a miss (logged and counted), never an error

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::cache::fingerprint::Fingerprint;
use crate::clock::{duration_ms, Clock};
use crate::config::CacheConfig;
use crate::error::{CacheError, StoreError};
use crate::observability::metrics;
use crate::store::{SharedStore, CACHE_CHANNEL, CACHE_NAMESPACE};

/// A cached response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub value: Value,
    pub stored_at_ms: u64,
    pub expires_at_ms: u64,
}

impl CacheEntry {
    fn is_live(&self, now: u64) -> bool {
        now < self.expires_at_ms
    }
}

/// What an invalidation removes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Invalidation {
    Key(String),
    Prefix(String),
}

#[derive(Debug, Serialize, Deserialize)]
struct InvalidationMessage {
    target: Invalidation,
    origin: Uuid,
}

/// Hit/miss counts for one service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Fraction of lookups served from cache; 0.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug)]
pub struct ResponseCache {
    config: CacheConfig,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    local: DashMap<String, CacheEntry>,
    counters: DashMap<String, Counters>,
    instance_id: Uuid,
}

impl ResponseCache {
    pub fn new(config: CacheConfig, store: Arc<dyn SharedStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
            local: DashMap::new(),
            counters: DashMap::new(),
            instance_id: Uuid::new_v4(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// TTL used when neither the caller nor the service config sets one.
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.config.default_ttl_secs)
    }

    /// Look up a response. Store failures read as a miss.
    pub async fn get(&self, fp: &Fingerprint) -> Option<Value> {
        if !self.config.enabled {
            return None;
        }

        let found = match self.try_get(fp).await {
            Ok(found) => found,
            Err(e) => {
                metrics::record_cache_error("get");
                tracing::warn!(key = %fp, error = %e, "Cache lookup failed, treating as miss");
                None
            }
        };

        self.count(fp.service(), found.is_some());
        found
    }

    /// Store a response for `ttl`. Failures are logged and swallowed.
    pub async fn set(&self, fp: &Fingerprint, value: Value, ttl: Duration) {
        if !self.config.enabled || ttl.is_zero() {
            return;
        }
        if let Err(e) = self.try_set(fp, value, ttl).await {
            metrics::record_cache_error("set");
            tracing::warn!(key = %fp, error = %e, "Cache write failed");
        }
    }

    /// Local tier first, then the shared store.
    pub async fn try_get(&self, fp: &Fingerprint) -> Result<Option<Value>, CacheError> {
        let now = self.clock.now_ms();

        if let Some(entry) = self.local.get(fp.as_str()) {
            if entry.is_live(now) {
                return Ok(Some(entry.value.clone()));
            }
        }

        let Some(stored) = self.store.get(&Self::store_key(fp.as_str())).await? else {
            return Ok(None);
        };
        let entry: CacheEntry = serde_json::from_slice(&stored.value)?;
        if !entry.is_live(now) {
            return Ok(None);
        }

        let value = entry.value.clone();
        self.insert_local(fp.as_str(), entry);
        Ok(Some(value))
    }

    /// Write to both tiers unconditionally.
    pub async fn try_set(
        &self,
        fp: &Fingerprint,
        value: Value,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let now = self.clock.now_ms();
        let entry = CacheEntry {
            value,
            stored_at_ms: now,
            expires_at_ms: now.saturating_add(duration_ms(ttl)),
        };

        let bytes = serde_json::to_vec(&entry)?;
        self.insert_local(fp.as_str(), entry);
        self.store
            .put(&Self::store_key(fp.as_str()), bytes, Some(ttl))
            .await?;
        tracing::trace!(key = %fp, ttl_ms = duration_ms(ttl), "Cached response");
        Ok(())
    }

    /// Remove one entry from every tier on every instance.
    pub async fn invalidate(&self, key: &str) -> Result<bool, CacheError> {
        self.local.remove(key);
        let existed = self.store.delete(&Self::store_key(key)).await?;
        self.broadcast(Invalidation::Key(key.to_string())).await?;
        tracing::info!(key = %key, existed, "Cache entry invalidated");
        Ok(existed)
    }

    /// Remove every entry whose key starts with `prefix`.
    pub async fn invalidate_prefix(&self, prefix: &str) -> Result<usize, CacheError> {
        self.local.retain(|k, _| !k.starts_with(prefix));
        let removed = self
            .store
            .delete_prefix(&Self::store_key(prefix))
            .await?;
        self.broadcast(Invalidation::Prefix(prefix.to_string()))
            .await?;
        tracing::info!(prefix = %prefix, removed, "Cache prefix invalidated");
        Ok(removed)
    }

    /// Apply an invalidation received from the store bus to the local tier.
    pub fn handle_message(&self, payload: &[u8]) {
        match serde_json::from_slice::<InvalidationMessage>(payload) {
            Ok(msg) if msg.origin == self.instance_id => {}
            Ok(msg) => self.apply_local(&msg.target),
            Err(e) => tracing::warn!(error = %e, "Discarding malformed cache invalidation"),
        }
    }

    /// Drop an invalidated key or prefix from the local tier.
    pub fn apply_local(&self, target: &Invalidation) {
        match target {
            Invalidation::Key(key) => {
                self.local.remove(key);
            }
            Invalidation::Prefix(prefix) => self.local.retain(|k, _| !k.starts_with(prefix.as_str())),
        }
    }

    /// Physically remove expired local entries.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.local.len();
        self.local.retain(|_, e| e.is_live(now));
        let removed = before.saturating_sub(self.local.len());
        if removed > 0 {
            tracing::debug!(removed, "Swept expired cache entries");
        }
        removed
    }

    /// Entries held in the local tier, live or expired.
    pub fn local_len(&self) -> usize {
        self.local.len()
    }

    pub fn stats(&self, service: &str) -> CacheStats {
        self.counters
            .get(service)
            .map(|c| CacheStats {
                hits: c.hits.load(Ordering::Relaxed),
                misses: c.misses.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }

    pub fn hit_rate(&self, service: &str) -> f64 {
        self.stats(service).hit_rate()
    }

    fn store_key(key: &str) -> String {
        format!("{}{}", CACHE_NAMESPACE, key)
    }

    fn count(&self, service: &str, hit: bool) {
        let counters = self.counters.entry(service.to_string()).or_default();
        if hit {
            counters.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            counters.misses.fetch_add(1, Ordering::Relaxed);
        }
        metrics::record_cache_lookup(service, hit);
    }

    fn insert_local(&self, key: &str, entry: CacheEntry) {
        if self.config.max_local_entries == 0 {
            return;
        }
        if self.local.len() >= self.config.max_local_entries && !self.local.contains_key(key) {
            self.sweep_expired();
            if self.local.len() >= self.config.max_local_entries {
                self.evict_soonest_expiring();
            }
        }
        self.local.insert(key.to_string(), entry);
    }

    fn evict_soonest_expiring(&self) {
        let victim = self
            .local
            .iter()
            .min_by_key(|e| e.value().expires_at_ms)
            .map(|e| e.key().clone());
        if let Some(key) = victim {
            self.local.remove(&key);
        }
    }

    async fn broadcast(&self, target: Invalidation) -> Result<(), StoreError> {
        let message = InvalidationMessage {
            target,
            origin: self.instance_id,
        };
        let payload = serde_json::to_vec(&message).map_err(|e| StoreError::Corrupt {
            key: CACHE_CHANNEL.to_string(),
            reason: e.to_string(),
        })?;
        self.store.publish(CACHE_CHANNEL, payload).await
    }
}

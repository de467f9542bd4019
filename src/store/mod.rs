//! Shared state store subsystem.
//!
//! # Data Flow
//! ```text
//! circuit_breaker ─┐                      ┌─ breaker:{service}
//! quota ───────────┼─▶ SharedStore ──────▶├─ quota:{resource}:window / :used:{start}
//! cache ───────────┘   (atomic ops)       └─ cache:{fingerprint}
//!                          │
//!                          └─▶ publish(channel) ─▶ every subscribed instance
//! ```
//!
//! # Design Decisions
//! - Cross-instance correctness relies only on the store's atomic primitives
//!   (versioned compare-and-swap and atomic increment); no distributed locks
//! - Versions are globally monotonic, so a delete followed by a re-create
//!   never satisfies a stale compare-and-swap
//! - Pub/sub is best effort; consumers must tolerate missed messages

pub mod memory;

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::StoreError;

pub use memory::MemoryStore;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Key prefix for circuit breaker records.
pub const BREAKER_NAMESPACE: &str = "breaker:";
/// Key prefix for quota windows and counters.
pub const QUOTA_NAMESPACE: &str = "quota:";
/// Key prefix for cached responses.
pub const CACHE_NAMESPACE: &str = "cache:";

/// Channel carrying breaker state changes.
pub const BREAKER_CHANNEL: &str = "breaker";
/// Channel carrying cache invalidations.
pub const CACHE_CHANNEL: &str = "cache";

/// A value read from the store together with its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub version: u64,
}

/// A message delivered over the store's pub/sub bus.
#[derive(Debug, Clone)]
pub struct StoreMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Operations the middleware needs from the external shared store.
#[async_trait]
pub trait SharedStore: Send + Sync + std::fmt::Debug {
    /// Read a key. Expired keys read as absent.
    async fn get(&self, key: &str) -> StoreResult<Option<Versioned>>;

    /// Unconditionally write a key. Returns the new version.
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StoreResult<u64>;

    /// Write only if the key's current version is `expected`
    /// (`None` means the key must be absent). Returns whether the write happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    /// Atomically add to an integer counter, creating it at zero.
    /// The TTL only applies when the counter is created.
    async fn incr_by(&self, key: &str, amount: u64, ttl: Option<Duration>) -> StoreResult<u64>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Delete every key starting with `prefix`. Returns the number removed.
    async fn delete_prefix(&self, prefix: &str) -> StoreResult<usize>;

    /// Physically reclaim expired keys. Returns the number removed.
    ///
    /// Stores that expire keys on their own may return `Ok(0)`.
    async fn purge_expired(&self) -> StoreResult<usize>;

    /// Publish a message to every subscriber.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> StoreResult<()>;

    /// Subscribe to all channels.
    fn subscribe(&self) -> broadcast::Receiver<StoreMessage>;
}

/// Parse a counter value written by `incr_by`.
pub fn decode_counter(key: &str, bytes: &[u8]) -> StoreResult<u64> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or_else(|| StoreError::Corrupt {
            key: key.to_string(),
            reason: "counter is not an unsigned integer".to_string(),
        })
}

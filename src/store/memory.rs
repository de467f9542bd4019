//! In-process shared store.
//!
//! Several gateway instances holding clones of the same `MemoryStore` behave
//! like several processes attached to one external store: every mutation is
//! atomic per key and every published message reaches every subscriber.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::clock::{duration_ms, Clock, SystemClock};
use crate::error::StoreError;
use crate::store::{decode_counter, SharedStore, StoreMessage, StoreResult, Versioned};

const BUS_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct StoredValue {
    value: Vec<u8>,
    version: u64,
    expires_at: Option<u64>,
}

impl StoredValue {
    fn is_live(&self, now: u64) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

#[derive(Debug)]
struct Inner {
    entries: DashMap<String, StoredValue>,
    next_version: AtomicU64,
    available: AtomicBool,
    bus: broadcast::Sender<StoreMessage>,
    clock: Arc<dyn Clock>,
}

/// A `SharedStore` backed by a concurrent in-memory map.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    /// Create a store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that evaluates TTLs against the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                next_version: AtomicU64::new(1),
                available: AtomicBool::new(true),
                bus,
                clock,
            }),
        }
    }

    /// Simulate the store going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Number of keys physically held, live or expired.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    /// Whether the store holds no keys at all.
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    fn ensure_available(&self) -> StoreResult<()> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store marked unavailable".to_string()))
        }
    }

    fn next_version(&self) -> u64 {
        self.inner.next_version.fetch_add(1, Ordering::SeqCst)
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<u64> {
        ttl.map(|t| self.inner.clock.now_ms().saturating_add(duration_ms(t)))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Versioned>> {
        self.ensure_available()?;
        let now = self.inner.clock.now_ms();
        Ok(self
            .inner
            .entries
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| Versioned {
                value: v.value.clone(),
                version: v.version,
            }))
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> StoreResult<u64> {
        self.ensure_available()?;
        let version = self.next_version();
        self.inner.entries.insert(
            key.to_string(),
            StoredValue {
                value,
                version,
                expires_at: self.expiry(ttl),
            },
        );
        Ok(version)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        self.ensure_available()?;
        let now = self.inner.clock.now_ms();
        let expires_at = self.expiry(ttl);

        match self.inner.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let current_version = current.is_live(now).then_some(current.version);
                if current_version != expected {
                    return Ok(false);
                }
                occupied.insert(StoredValue {
                    value,
                    version: self.next_version(),
                    expires_at,
                });
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(StoredValue {
                    value,
                    version: self.next_version(),
                    expires_at,
                });
                Ok(true)
            }
        }
    }

    async fn incr_by(&self, key: &str, amount: u64, ttl: Option<Duration>) -> StoreResult<u64> {
        self.ensure_available()?;
        let now = self.inner.clock.now_ms();

        match self.inner.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) if occupied.get().is_live(now) => {
                let current = decode_counter(key, &occupied.get().value)?;
                let updated = current.saturating_add(amount);
                let version = self.next_version();
                let slot = occupied.get_mut();
                slot.value = updated.to_string().into_bytes();
                slot.version = version;
                Ok(updated)
            }
            Entry::Occupied(mut occupied) => {
                occupied.insert(StoredValue {
                    value: amount.to_string().into_bytes(),
                    version: self.next_version(),
                    expires_at: self.expiry(ttl),
                });
                Ok(amount)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue {
                    value: amount.to_string().into_bytes(),
                    version: self.next_version(),
                    expires_at: self.expiry(ttl),
                });
                Ok(amount)
            }
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.ensure_available()?;
        let now = self.inner.clock.now_ms();
        Ok(self
            .inner
            .entries
            .remove(key)
            .is_some_and(|(_, v)| v.is_live(now)))
    }

    async fn delete_prefix(&self, prefix: &str) -> StoreResult<usize> {
        self.ensure_available()?;
        let now = self.inner.clock.now_ms();
        let mut removed = 0;
        self.inner.entries.retain(|k, v| {
            if k.starts_with(prefix) {
                if v.is_live(now) {
                    removed += 1;
                }
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    async fn purge_expired(&self) -> StoreResult<usize> {
        self.ensure_available()?;
        let now = self.inner.clock.now_ms();
        let before = self.inner.entries.len();
        self.inner.entries.retain(|_, v| v.is_live(now));
        Ok(before.saturating_sub(self.inner.entries.len()))
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> StoreResult<()> {
        self.ensure_available()?;
        // No subscribers is not an error.
        let _ = self.inner.bus.send(StoreMessage {
            channel: channel.to_string(),
            payload,
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreMessage> {
        self.inner.bus.subscribe()
    }
}

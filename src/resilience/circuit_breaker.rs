//! Circuit breaker for upstream protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: upstream assumed down, calls fail fast
//! - Half-Open: a bounded number of probe calls test recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= failure_threshold (consecutive)
//! Open → Half-Open: recovery_timeout elapsed (claimed by the first probe)
//! Half-Open → Closed: half_open_successes >= half_open_limit
//! Half-Open → Open: any probe fails (or is cancelled)
//! ```
//!
//! # Design Decisions
//! - One record per service at `breaker:{service}` in the shared store,
//!   mutated only through versioned compare-and-swap
//! - `check_state` is a pure read; probe accounting happens in `acquire`
//! - Probe permits are RAII guards: an abandoned probe is settled as a failure
//! - Probe permits carry the `opened_at` of the recovery attempt that admitted
//!   them; only a success from a current probe counts toward closing
//! - Transitions are broadcast; the local view is a fallback, never the authority

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::clock::{duration_ms, Clock};
use crate::config::{BreakerConfig, ConfigError, ValidationError};
use crate::error::{GatewayError, GatewayResult, StoreError};
use crate::observability::metrics;
use crate::store::{SharedStore, StoreResult, BREAKER_CHANNEL, BREAKER_NAMESPACE};

/// Upper bound on compare-and-swap retries before reporting contention.
const MAX_CAS_ATTEMPTS: usize = 32;

const EVENT_BUFFER: usize = 256;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted breaker state for one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitRecord {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    /// Milliseconds since epoch of the most recent recorded failure.
    pub last_failure_time: Option<u64>,
    /// Milliseconds since epoch when the breaker last opened.
    pub opened_at: Option<u64>,
    pub half_open_probes_in_flight: u32,
    pub half_open_successes: u32,
}

impl CircuitRecord {
    /// A fresh closed record.
    pub fn closed(service: &str) -> Self {
        Self {
            service: service.to_string(),
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_time: None,
            opened_at: None,
            half_open_probes_in_flight: 0,
            half_open_successes: 0,
        }
    }

    fn opened(&self, now: u64) -> Self {
        Self {
            service: self.service.clone(),
            state: CircuitState::Open,
            failure_count: self.failure_count.saturating_add(1),
            last_failure_time: Some(now),
            opened_at: Some(now),
            half_open_probes_in_flight: 0,
            half_open_successes: 0,
        }
    }
}

/// Admission decision returned by `check_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

/// Result of a side-effect-free state check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// State as it currently applies (an expired Open reads as HalfOpen).
    pub state: CircuitState,
    pub decision: Decision,
    /// Remaining time before an open breaker admits probes.
    pub retry_after: Option<Duration>,
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        self.decision == Decision::Allow
    }
}

/// A state change, broadcast to every instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerEvent {
    pub record: CircuitRecord,
    /// Instance that performed the transition.
    pub origin: Uuid,
}

/// Per-service circuit breaker backed by the shared store.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    store: Arc<dyn SharedStore>,
    clock: Arc<dyn Clock>,
    local: DashMap<String, CircuitRecord>,
    events: broadcast::Sender<BreakerEvent>,
    instance_id: Uuid,
}

impl CircuitBreaker {
    /// Create a breaker. A zero `half_open_limit` or `failure_threshold` is rejected.
    pub fn new(
        config: BreakerConfig,
        store: Arc<dyn SharedStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        let mut errors = Vec::new();
        if config.half_open_limit == 0 {
            errors.push(ValidationError::new(
                "breaker.half_open_limit",
                "must be greater than 0",
            ));
        }
        if config.failure_threshold == 0 {
            errors.push(ValidationError::new(
                "breaker.failure_threshold",
                "must be greater than 0",
            ));
        }
        if !errors.is_empty() {
            return Err(ConfigError::Validation(errors));
        }

        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Ok(Self {
            config,
            store,
            clock,
            local: DashMap::new(),
            events,
            instance_id: Uuid::new_v4(),
        })
    }

    /// Identifier stamped on events published by this instance.
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    /// Subscribe to state changes (local and remote).
    pub fn subscribe(&self) -> broadcast::Receiver<BreakerEvent> {
        self.events.subscribe()
    }

    /// Last record this instance has seen for a service.
    pub fn local_view(&self, service: &str) -> Option<CircuitRecord> {
        self.local.get(service).map(|r| r.value().clone())
    }

    /// Decide whether a call may proceed, without mutating any state.
    pub async fn check_state(&self, service: &str) -> Admission {
        let record = match self.load(service).await {
            Ok((record, _)) => record,
            Err(e) => {
                tracing::warn!(service = %service, error = %e, "Breaker store unavailable, using local view");
                self.local_view(service)
                    .unwrap_or_else(|| CircuitRecord::closed(service))
            }
        };
        self.admission(&record, self.clock.now_ms())
    }

    /// Current record for a service, from the store or the local view.
    pub async fn snapshot(&self, service: &str) -> CircuitRecord {
        match self.load(service).await {
            Ok((record, _)) => record,
            Err(_) => self
                .local_view(service)
                .unwrap_or_else(|| CircuitRecord::closed(service)),
        }
    }

    /// State as it currently applies to callers.
    pub async fn state(&self, service: &str) -> CircuitState {
        self.check_state(service).await.state
    }

    /// Admit a call, claiming a probe slot when half-open.
    pub async fn acquire(self: &Arc<Self>, service: &str) -> GatewayResult<CallPermit> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (record, version) = self.load(service).await?;
            let now = self.clock.now_ms();

            let next = match record.state {
                CircuitState::Closed => {
                    return Ok(CallPermit::new(self.clone(), service, None));
                }
                CircuitState::Open if !self.recovery_elapsed(&record, now) => {
                    return Err(GatewayError::CircuitOpen {
                        service: service.to_string(),
                        retry_after: self.retry_after(&record, now),
                    });
                }
                CircuitState::Open => CircuitRecord {
                    state: CircuitState::HalfOpen,
                    half_open_probes_in_flight: 1,
                    half_open_successes: 0,
                    ..record.clone()
                },
                CircuitState::HalfOpen => {
                    if !self.probe_slot_free(&record) {
                        return Err(GatewayError::CircuitOpen {
                            service: service.to_string(),
                            retry_after: None,
                        });
                    }
                    CircuitRecord {
                        half_open_probes_in_flight: record.half_open_probes_in_flight + 1,
                        ..record.clone()
                    }
                }
            };

            if self.swap(service, version, &next).await? {
                if record.state == CircuitState::Open {
                    self.announce(&next).await;
                }
                return Ok(CallPermit::new(
                    self.clone(),
                    service,
                    Some(Self::epoch(&next)),
                ));
            }
        }
        Err(StoreError::Contention(Self::key(service)).into())
    }

    /// Record a successful upstream call that did not hold a probe slot.
    ///
    /// Resets the failure count of a closed breaker. While half-open only
    /// probe successes count, so this leaves the record untouched.
    pub async fn record_success(&self, service: &str) -> GatewayResult<CircuitState> {
        self.settle_success(service, None).await
    }

    /// `probe` is the recovery epoch of the settling probe, if any.
    async fn settle_success(&self, service: &str, probe: Option<u64>) -> GatewayResult<CircuitState> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (record, version) = self.load(service).await?;

            let next = match record.state {
                CircuitState::Closed if record.failure_count == 0 => {
                    return Ok(CircuitState::Closed);
                }
                CircuitState::Closed => CircuitRecord {
                    failure_count: 0,
                    ..record.clone()
                },
                CircuitState::HalfOpen if probe != Some(Self::epoch(&record)) => {
                    tracing::debug!(
                        service = %service,
                        stale_probe = probe.is_some(),
                        "Ignoring success from a call outside the current recovery attempt"
                    );
                    return Ok(CircuitState::HalfOpen);
                }
                CircuitState::HalfOpen => {
                    let successes = record.half_open_successes.saturating_add(1);
                    if successes >= self.config.half_open_limit {
                        CircuitRecord::closed(service)
                    } else {
                        CircuitRecord {
                            half_open_probes_in_flight: record
                                .half_open_probes_in_flight
                                .saturating_sub(1),
                            half_open_successes: successes,
                            ..record.clone()
                        }
                    }
                }
                // A late success from a call admitted before the breaker opened
                // says nothing about recovery.
                CircuitState::Open => return Ok(CircuitState::Open),
            };

            if self.swap(service, version, &next).await? {
                if next.state != record.state {
                    self.announce(&next).await;
                } else {
                    self.local.insert(service.to_string(), next.clone());
                }
                return Ok(next.state);
            }
        }
        Err(StoreError::Contention(Self::key(service)).into())
    }

    /// Record a failed upstream call.
    pub async fn record_failure(&self, service: &str) -> GatewayResult<CircuitState> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let (record, version) = self.load(service).await?;
            let now = self.clock.now_ms();

            let next = match record.state {
                CircuitState::Closed => {
                    let failures = record.failure_count.saturating_add(1);
                    if failures >= self.config.failure_threshold {
                        record.opened(now)
                    } else {
                        CircuitRecord {
                            failure_count: failures,
                            last_failure_time: Some(now),
                            ..record.clone()
                        }
                    }
                }
                CircuitState::HalfOpen => record.opened(now),
                CircuitState::Open => {
                    metrics::record_failure_while_open(service);
                    tracing::debug!(service = %service, "Failure recorded while breaker open");
                    return Ok(CircuitState::Open);
                }
            };

            if self.swap(service, version, &next).await? {
                if next.state != record.state {
                    self.announce(&next).await;
                } else {
                    self.local.insert(service.to_string(), next.clone());
                }
                return Ok(next.state);
            }
        }
        Err(StoreError::Contention(Self::key(service)).into())
    }

    /// Apply a breaker event received from the store bus.
    pub fn handle_message(&self, payload: &[u8]) {
        match serde_json::from_slice::<BreakerEvent>(payload) {
            Ok(event) if event.origin == self.instance_id => {}
            Ok(event) => self.apply_event(event),
            Err(e) => tracing::warn!(error = %e, "Discarding malformed breaker event"),
        }
    }

    /// Adopt a state published by another instance.
    pub fn apply_event(&self, event: BreakerEvent) {
        tracing::debug!(
            service = %event.record.service,
            state = %event.record.state,
            origin = %event.origin,
            "Adopting remote breaker state"
        );
        self.local
            .insert(event.record.service.clone(), event.record.clone());
        let _ = self.events.send(event);
    }

    /// Identifies one open/half-open cycle.
    fn epoch(record: &CircuitRecord) -> u64 {
        record.opened_at.unwrap_or(0)
    }

    fn key(service: &str) -> String {
        format!("{}{}", BREAKER_NAMESPACE, service)
    }

    fn recovery_elapsed(&self, record: &CircuitRecord, now: u64) -> bool {
        let opened_at = record.opened_at.unwrap_or(0);
        now.saturating_sub(opened_at) >= duration_ms(self.config.recovery_timeout())
    }

    fn retry_after(&self, record: &CircuitRecord, now: u64) -> Option<Duration> {
        let opened_at = record.opened_at?;
        let ready_at = opened_at.saturating_add(duration_ms(self.config.recovery_timeout()));
        Some(Duration::from_millis(ready_at.saturating_sub(now)))
    }

    /// Probes in flight plus probes already succeeded stay within the limit.
    fn probe_slot_free(&self, record: &CircuitRecord) -> bool {
        record
            .half_open_probes_in_flight
            .saturating_add(record.half_open_successes)
            < self.config.half_open_limit
    }

    fn admission(&self, record: &CircuitRecord, now: u64) -> Admission {
        match record.state {
            CircuitState::Closed => Admission {
                state: CircuitState::Closed,
                decision: Decision::Allow,
                retry_after: None,
            },
            CircuitState::Open if self.recovery_elapsed(record, now) => Admission {
                state: CircuitState::HalfOpen,
                decision: Decision::Allow,
                retry_after: None,
            },
            CircuitState::Open => Admission {
                state: CircuitState::Open,
                decision: Decision::Deny,
                retry_after: self.retry_after(record, now),
            },
            CircuitState::HalfOpen => Admission {
                state: CircuitState::HalfOpen,
                decision: if self.probe_slot_free(record) {
                    Decision::Allow
                } else {
                    Decision::Deny
                },
                retry_after: None,
            },
        }
    }

    async fn load(&self, service: &str) -> StoreResult<(CircuitRecord, Option<u64>)> {
        let key = Self::key(service);
        let loaded = match self.store.get(&key).await? {
            None => (CircuitRecord::closed(service), None),
            Some(versioned) => {
                let record: CircuitRecord =
                    serde_json::from_slice(&versioned.value).map_err(|e| StoreError::Corrupt {
                        key: key.clone(),
                        reason: e.to_string(),
                    })?;
                (record, Some(versioned.version))
            }
        };
        self.local.insert(service.to_string(), loaded.0.clone());
        Ok(loaded)
    }

    async fn swap(
        &self,
        service: &str,
        version: Option<u64>,
        record: &CircuitRecord,
    ) -> StoreResult<bool> {
        let key = Self::key(service);
        let bytes = serde_json::to_vec(record).map_err(|e| StoreError::Corrupt {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        self.store.compare_and_swap(&key, version, bytes, None).await
    }

    /// Log, count and broadcast a transition that this instance performed.
    async fn announce(&self, record: &CircuitRecord) {
        match record.state {
            CircuitState::Open => tracing::warn!(
                service = %record.service,
                failures = record.failure_count,
                "Circuit opened"
            ),
            state => tracing::info!(service = %record.service, state = %state, "Circuit state changed"),
        }
        metrics::record_breaker_transition(&record.service, record.state.as_str());

        self.local.insert(record.service.clone(), record.clone());
        let event = BreakerEvent {
            record: record.clone(),
            origin: self.instance_id,
        };

        match serde_json::to_vec(&event) {
            Ok(payload) => {
                if let Err(e) = self.store.publish(BREAKER_CHANNEL, payload).await {
                    tracing::warn!(service = %record.service, error = %e, "Failed to publish breaker event");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to encode breaker event"),
        }
        let _ = self.events.send(event);
    }
}

/// Admission granted by `CircuitBreaker::acquire`.
///
/// Settle it with `success` or `failure`. A probe permit dropped unsettled
/// (for example because the caller was cancelled) is recorded as a failure
/// so the probe slot is released.
#[derive(Debug)]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    service: String,
    /// Recovery epoch the probe slot was claimed in.
    probe: Option<u64>,
    settled: bool,
}

impl CallPermit {
    fn new(breaker: Arc<CircuitBreaker>, service: &str, probe: Option<u64>) -> Self {
        Self {
            breaker,
            service: service.to_string(),
            probe,
            settled: false,
        }
    }

    /// Whether this permit holds a half-open probe slot.
    pub fn is_probe(&self) -> bool {
        self.probe.is_some()
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Settle as a success.
    pub async fn success(mut self) -> GatewayResult<CircuitState> {
        let result = self.breaker.settle_success(&self.service, self.probe).await;
        self.settled = true;
        result
    }

    /// Settle as a failure.
    pub async fn failure(mut self) -> GatewayResult<CircuitState> {
        let result = self.breaker.record_failure(&self.service).await;
        self.settled = true;
        result
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if self.settled || self.probe.is_none() {
            return;
        }
        let breaker = self.breaker.clone();
        let service = std::mem::take(&mut self.service);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tracing::debug!(service = %service, "Probe abandoned, recording failure");
                    if let Err(e) = breaker.record_failure(&service).await {
                        tracing::warn!(service = %service, error = %e, "Failed to settle abandoned probe");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(service = %service, "Probe abandoned outside a runtime; slot not released");
            }
        }
    }
}

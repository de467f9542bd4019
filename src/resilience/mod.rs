//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Request to a service:
//!     → circuit_breaker.rs (fail fast while the upstream is known bad)
//!     → quota.rs (fail fast while the resource is used up)
//!     → upstream call
//!     → circuit_breaker.rs / quota.rs (record outcome and usage)
//!     → On retryable failure: retries.rs (backoff.rs delays)
//! ```
//!
//! # Design Decisions
//! - Breaker and quota state live in the shared store so every instance
//!   sees the same picture
//! - Rejections are cheap: no upstream traffic, no pool slot taken

pub mod backoff;
pub mod circuit_breaker;
pub mod quota;
pub mod retries;

pub use circuit_breaker::{
    Admission, BreakerEvent, CallPermit, CircuitBreaker, CircuitRecord, CircuitState, Decision,
};
pub use quota::{QuotaManager, QuotaStatus};
pub use retries::retry_with_backoff;

//! Resilience middleware for crypto-market and LLM API calls.
//!
//! Every outbound call goes through one `Gateway` that composes a response
//! cache, a per-service circuit breaker, usage quotas and a bounded
//! connection pool. Breaker, quota and cache state live in a `SharedStore`
//! so several instances behave as one.

// Core subsystems
pub mod cache;
pub mod config;
pub mod gateway;
pub mod pool;
pub mod resilience;
pub mod store;

// Cross-cutting concerns
pub mod admin;
pub mod clock;
pub mod error;
pub mod lifecycle;
pub mod observability;

pub use config::RelayConfig;
pub use error::{GatewayError, GatewayResult};
pub use gateway::{Gateway, RequestOptions};
pub use lifecycle::Shutdown;

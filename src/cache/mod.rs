//! Response caching subsystem.
//!
//! # Data Flow
//! ```text
//! Gateway request
//!     → fingerprint.rs (service:operation:sha256 of canonical payload)
//!     → response.rs local tier (DashMap)
//!     → response.rs shared tier (store, cache:{fingerprint})
//!     → hit: returned before any breaker, quota or pool work
//!
//! invalidate / invalidate_prefix
//!     → shared tier delete
//!     → "cache" channel → every instance drops its local copy
//! ```

pub mod fingerprint;
pub mod response;

pub use fingerprint::Fingerprint;
pub use response::{CacheEntry, CacheStats, Invalidation, ResponseCache};

//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Background tasks (tasks.rs):
//!     store bus → breaker events / cache invalidations → local views
//!     ticker → cache sweep of expired local entries
//!
//! Shutdown (shutdown.rs):
//!     Signal received (signals.rs) → broadcast → tasks exit → admin server drains
//! ```
//!
//! # Design Decisions
//! - Every long-running task takes a shutdown receiver and exits on it
//! - Missing a bus message is tolerated; the store stays authoritative

pub mod shutdown;
pub mod signals;
pub mod tasks;

pub use shutdown::Shutdown;

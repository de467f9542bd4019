//! Connection pooling subsystem.
//!
//! # Data Flow
//! ```text
//! Gateway (after breaker and quota admit the call)
//!     → connection.rs acquire(service)
//!         → service semaphore (limit)
//!         → host semaphore (limit_per_host, shared by services on one host)
//!     → Lease (derefs to Connection: client + base_url)
//!     → dropped on every exit path → permits return
//! ```

pub mod connection;

pub use connection::{Connection, ConnectionPool, Lease, PoolBuildError, PoolHealth};

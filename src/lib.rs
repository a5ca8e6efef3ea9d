//! A generic, asynchronous database-connection pool.
//!
//! Opening a new database connection every time one is needed is both
//! inefficient and can lead to resource exhaustion under high traffic
//! conditions. This pool maintains a bounded set of live connections,
//! handing them out for repeated use and enforcing freshness, idleness,
//! and lifetime policies on the connections it manages.
//!
//! The crate is agnostic to the connection type it manages. Implementors
//! of [`ConnectionManager`] provide the driver-specific logic to open a
//! connection and check its health; this crate supplies the pool
//! mechanics: a lock-light concurrent bag for borrow/return traffic, a
//! lifecycle manager that opens and retires connections, and the
//! background tasks (housekeeper, per-entry lifetime timers) that keep
//! the pool's invariants honest under concurrent use.
//!
//! # Example
//!
//! Using an imaginary "foodb" database.
//!
//! ```ignore
//! use conveyor_pool::{ConnectionManager, Pool};
//!
//! #[tokio::main]
//! async fn main() {
//!     let manager = foodb::FooConnectionManager::new("localhost:1234");
//!     let pool = Pool::builder().build(manager).await.unwrap();
//!
//!     for _ in 0..20 {
//!         let pool = pool.clone();
//!         tokio::spawn(async move {
//!             let conn = pool.get().await.unwrap();
//!             // use the connection; it returns to the pool when dropped.
//!         });
//!     }
//! }
//! ```
#![deny(missing_debug_implementations)]
#![warn(missing_docs)]

mod bag;
mod cache;
mod config;
mod entry;
mod error;
mod housekeeper;
mod manager;
mod pool;
mod scheduler;

pub use config::{Builder, PoolConfig};
pub use error::{EventSink, NopEventSink, PoolError};
pub use manager::ConnectionManager;
pub use pool::{Pool, PooledConnection, State};

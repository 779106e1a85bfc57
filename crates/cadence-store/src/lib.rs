//! `cadence-store`: bounded SQLite connection pool and collision-free ID
//! allocation for scheduled batch jobs.
//!
//! # Overview
//!
//! [`ConnectionPool`] shares a small number of driver connections between
//! worker threads. A caller borrows one through a [`Lease`], which is never
//! shared and goes back to the pool when released or dropped.
//!
//! [`Store`] is the narrow query surface (`execute_query`,
//! `execute_non_query`, `update_record`) that business code sees, and
//! [`IdAllocator`] assigns sequential row IDs without relying on SQLite's
//! autoincrement.

pub mod allocator;
pub mod error;
pub mod manager;
pub mod pool;
pub mod store;

pub use allocator::{Allocator, IdAllocator};
pub use error::{Result, StoreError};
pub use manager::{ConnectionManager, SqliteManager};
pub use pool::{ConnectionPool, Lease, PoolStats, Released};
pub use store::{Record, SqlitePool, Store, Value};

//! Shared configuration and error types for the cadence crates.

pub mod config;
pub mod error;

pub use config::{AllocatorConfig, CadenceConfig, DatabaseConfig, PoolConfig, TaskConfig};
pub use error::{CadenceError, Result};

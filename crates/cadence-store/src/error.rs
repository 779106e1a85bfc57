use thiserror::Error;

/// Errors surfaced by the pool, the query helpers and the ID allocator.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Every connection stayed leased for the whole acquire timeout.
    #[error("connection pool exhausted: no connection free after {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    /// `acquire` was called after `close`.
    #[error("connection pool is closed")]
    PoolClosed,

    /// The store could not be reached even after one transparent reconnect.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Every allocation attempt collided with a concurrent writer.
    #[error("id allocation failed for {table}.{column} after {attempts} attempts")]
    AllocationFailed {
        table: String,
        column: String,
        attempts: u32,
    },

    /// A table or column name is not a plain SQL identifier.
    #[error("invalid identifier: {0:?}")]
    InvalidIdentifier(String),

    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Underlying SQLite / rusqlite error.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

impl StoreError {
    /// True for conditions a caller may reasonably back off and retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::PoolExhausted { .. } | StoreError::ConnectionLost(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

use cadence_store::StoreError;
use thiserror::Error;

/// Errors that can occur while deciding on, running or recording a task.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The pool, a query or the ID allocator failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The task body returned an error.
    #[error("Task {task} failed: {reason}")]
    TaskBody { task: String, reason: String },

    /// The task body panicked; the panic was contained at the coordinator.
    #[error("Task {task} panicked: {message}")]
    Panicked { task: String, message: String },

    /// A persisted row could not be decoded.
    #[error("Invalid execution record: {0}")]
    InvalidRecord(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

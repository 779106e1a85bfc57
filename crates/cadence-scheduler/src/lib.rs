//! `cadence-scheduler`: frequency-gated execution of recurring batch tasks.
//!
//! # Overview
//!
//! A [`TaskExecutionCoordinator`] wraps one [`TaskBody`] with a frequency in
//! days. On each invocation it reads the task's completion marker from the
//! `task_execution` table, runs the body when at least `frequency_days` have
//! passed (or when forced), and writes the new run date only after the body
//! succeeds. Every real run is also appended to `task_run_log`, whose IDs
//! come from the store's [`IdAllocator`](cadence_store::IdAllocator).
//!
//! | Situation                         | Body runs | Run date recorded |
//! |-----------------------------------|-----------|-------------------|
//! | Never run / due                   | yes       | on success        |
//! | Not due, not forced               | no        | no                |
//! | Forced                            | yes       | on success        |
//! | Dry run                           | yes       | never             |
//! | Body errors or panics             | yes       | no                |

pub mod body;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod runner;
pub mod types;

pub use body::{from_fn, FnBody, TaskBody, TaskContext};
pub use coordinator::TaskExecutionCoordinator;
pub use db::{init_db, list_records, recent_runs};
pub use error::{Result, SchedulerError};
pub use runner::{run_all, run_all_on};
pub use types::{ExecutionOutcome, RunLogEntry, RunOutcome, TaskExecutionRecord, TaskState};

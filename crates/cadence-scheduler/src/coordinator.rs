use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use cadence_core::TaskConfig;
use cadence_store::{Allocator, Store};
use chrono::{Local, NaiveDate, Utc};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::body::{TaskBody, TaskContext};
use crate::db::{self, NewRunLog};
use crate::error::{Result, SchedulerError};
use crate::types::{ExecutionOutcome, RunOutcome, TaskExecutionRecord, TaskState};

/// Runs one scheduled task at most once per `frequency_days`.
///
/// The completion marker is written through the store only after the body
/// succeeds, so a crashed or failed run leaves the task due and it is
/// retried on the next invocation.
pub struct TaskExecutionCoordinator {
    name: String,
    frequency_days: u32,
    body: Box<dyn TaskBody>,
    store: Arc<dyn Store>,
    allocator: Arc<dyn Allocator>,
    state: Mutex<TaskState>,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag however `execute_on` exits.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl TaskExecutionCoordinator {
    pub fn new(
        name: impl Into<String>,
        frequency_days: u32,
        body: impl TaskBody + 'static,
        store: Arc<dyn Store>,
        allocator: Arc<dyn Allocator>,
    ) -> Self {
        Self {
            name: name.into(),
            frequency_days,
            body: Box::new(body),
            store,
            allocator,
            state: Mutex::new(TaskState::Idle),
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn from_config(
        task: &TaskConfig,
        body: impl TaskBody + 'static,
        store: Arc<dyn Store>,
        allocator: Arc<dyn Allocator>,
    ) -> Self {
        Self::new(task.name.clone(), task.frequency_days, body, store, allocator)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn frequency_days(&self) -> u32 {
        self.frequency_days
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: TaskState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// The persisted completion marker, if the task has ever completed.
    pub fn record(&self) -> Result<Option<TaskExecutionRecord>> {
        db::load_record(&*self.store, &self.name)
    }

    /// True when the task has never completed or its last completion is at
    /// least `frequency_days` before `today`.
    pub fn should_run(&self, today: NaiveDate) -> Result<bool> {
        Ok(self
            .record()?
            .map_or(true, |rec| rec.is_due(today, self.frequency_days)))
    }

    /// Run the task for today's local date if it is due (or `force` is set).
    pub fn execute(&self, force: bool, dry_run: bool) -> ExecutionOutcome {
        self.execute_on(Local::now().date_naive(), force, dry_run)
    }

    /// Run the task for `today` if it is due (or `force` is set).
    ///
    /// A dry run invokes the body but does not record completion. Errors and
    /// panics from the body are returned as [`ExecutionOutcome::Failed`] and
    /// never record completion.
    #[instrument(skip(self), fields(task = %self.name))]
    pub fn execute_on(&self, today: NaiveDate, force: bool, dry_run: bool) -> ExecutionOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("task already running in this process; skipping overlapping invocation");
            return ExecutionOutcome::Skipped;
        }
        let _in_flight = InFlight(&self.in_flight);
        self.set_state(TaskState::Idle);

        if !force {
            match self.should_run(today) {
                Ok(true) => {}
                Ok(false) => {
                    info!(%today, frequency_days = self.frequency_days, "task not due; skipping");
                    self.set_state(TaskState::Skipped);
                    return ExecutionOutcome::Skipped;
                }
                Err(e) => {
                    error!(error = %e, "could not read execution record");
                    self.set_state(TaskState::Failed);
                    return ExecutionOutcome::Failed(e);
                }
            }
        }

        self.set_state(TaskState::Running);
        let run_id = Uuid::now_v7();
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(%run_id, %today, force, dry_run, "task starting");

        let result = self.run_body(run_id, today, dry_run).and_then(|()| {
            if dry_run {
                info!(%run_id, "dry run; completion not recorded");
                Ok(())
            } else {
                db::upsert_record(&*self.store, &self.name, today, self.frequency_days)
            }
        });

        let finished_at = Utc::now();
        if !dry_run {
            let error_text = result.as_ref().err().map(ToString::to_string);
            let entry = NewRunLog {
                run_id: &run_id.to_string(),
                task_name: &self.name,
                run_date: today,
                forced: force,
                outcome: if result.is_ok() {
                    RunOutcome::Succeeded
                } else {
                    RunOutcome::Failed
                },
                error: error_text.as_deref(),
                started_at: &started_at.to_rfc3339(),
                finished_at: &finished_at.to_rfc3339(),
            };
            if let Err(e) = db::append_run_log(&*self.allocator, &entry) {
                warn!(%run_id, error = %e, "could not append to run log");
            }
        }

        let elapsed_ms = clock.elapsed().as_millis() as u64;
        match result {
            Ok(()) => {
                self.set_state(TaskState::Completed);
                info!(%run_id, elapsed_ms, "task completed");
                ExecutionOutcome::Succeeded
            }
            Err(e) => {
                self.set_state(TaskState::Failed);
                error!(
                    %run_id,
                    at = %finished_at.to_rfc3339(),
                    elapsed_ms,
                    error = %e,
                    "task failed; completion not recorded"
                );
                ExecutionOutcome::Failed(e)
            }
        }
    }

    fn run_body(&self, run_id: Uuid, today: NaiveDate, dry_run: bool) -> Result<()> {
        let ctx = TaskContext {
            task_name: &self.name,
            run_id,
            today,
            dry_run,
            store: &*self.store,
            allocator: &*self.allocator,
        };
        match panic::catch_unwind(AssertUnwindSafe(|| self.body.run(&ctx))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SchedulerError::TaskBody {
                task: self.name.clone(),
                reason: format!("{e:#}"),
            }),
            Err(payload) => Err(SchedulerError::Panicked {
                task: self.name.clone(),
                message: panic_message(payload.as_ref()),
            }),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

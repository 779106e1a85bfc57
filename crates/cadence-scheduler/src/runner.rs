use std::sync::Arc;

use chrono::{Local, NaiveDate};
use tracing::{error, info};

use crate::coordinator::TaskExecutionCoordinator;
use crate::error::SchedulerError;
use crate::types::ExecutionOutcome;

/// Execute every coordinator on its own worker thread for today's local date.
///
/// Returns `(task name, outcome)` pairs in the order the coordinators were
/// given. One task failing never stops the others.
pub fn run_all(
    coordinators: &[Arc<TaskExecutionCoordinator>],
    force: bool,
    dry_run: bool,
) -> Vec<(String, ExecutionOutcome)> {
    run_all_on(coordinators, Local::now().date_naive(), force, dry_run)
}

/// [`run_all`] with an explicit date.
pub fn run_all_on(
    coordinators: &[Arc<TaskExecutionCoordinator>],
    today: NaiveDate,
    force: bool,
    dry_run: bool,
) -> Vec<(String, ExecutionOutcome)> {
    info!(tasks = coordinators.len(), %today, force, dry_run, "dispatching tasks");

    let results: Vec<(String, ExecutionOutcome)> = std::thread::scope(|s| {
        let handles: Vec<_> = coordinators
            .iter()
            .map(|coord| {
                let handle = s.spawn(move || coord.execute_on(today, force, dry_run));
                (coord.name().to_string(), handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(name, handle)| {
                // Bodies are already wrapped in catch_unwind; this only
                // trips if the coordinator itself panicked.
                let outcome = handle.join().unwrap_or_else(|_| {
                    error!(task = %name, "worker thread panicked");
                    ExecutionOutcome::Failed(SchedulerError::Panicked {
                        task: name.clone(),
                        message: "worker thread panicked".into(),
                    })
                });
                (name, outcome)
            })
            .collect()
    });

    let failed = results.iter().filter(|(_, o)| o.is_failure()).count();
    info!(tasks = results.len(), failed, "all tasks finished");
    results
}

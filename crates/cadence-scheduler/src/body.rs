use cadence_store::{Allocator, Store};
use chrono::NaiveDate;
use uuid::Uuid;

/// Everything a task body may touch during one run.
pub struct TaskContext<'a> {
    pub task_name: &'a str,
    /// Correlates the body's log lines with its `task_run_log` row.
    pub run_id: Uuid,
    /// The day this run counts for.
    pub today: NaiveDate,
    /// When set, the body should avoid side effects it can skip.
    pub dry_run: bool,
    pub store: &'a dyn Store,
    pub allocator: &'a dyn Allocator,
}

/// Task-specific work driven by a [`TaskExecutionCoordinator`].
///
/// Any error returned here fails the run and leaves the task due.
///
/// [`TaskExecutionCoordinator`]: crate::coordinator::TaskExecutionCoordinator
pub trait TaskBody: Send + Sync {
    fn run(&self, ctx: &TaskContext<'_>) -> anyhow::Result<()>;
}

/// Task body backed by a closure. Build one with [`from_fn`].
pub struct FnBody<F>(F);

/// Wrap a closure as a [`TaskBody`].
pub fn from_fn<F>(f: F) -> FnBody<F>
where
    F: Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    FnBody(f)
}

impl<F> TaskBody for FnBody<F>
where
    F: Fn(&TaskContext<'_>) -> anyhow::Result<()> + Send + Sync,
{
    fn run(&self, ctx: &TaskContext<'_>) -> anyhow::Result<()> {
        (self.0)(ctx)
    }
}

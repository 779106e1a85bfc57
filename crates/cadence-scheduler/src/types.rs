use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Where a coordinator is in its most recent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Not yet invoked, or deciding whether to run.
    Idle,
    /// The task body is executing.
    Running,
    /// The body succeeded and, outside dry runs, the run date was recorded.
    Completed,
    /// The body or the completion write failed; nothing was recorded.
    Failed,
    /// Not due and not forced; nothing ran.
    Skipped,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Idle => "idle",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "idle" => Ok(TaskState::Idle),
            "running" => Ok(TaskState::Running),
            "completed" => Ok(TaskState::Completed),
            "failed" => Ok(TaskState::Failed),
            "skipped" => Ok(TaskState::Skipped),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

/// Completion marker persisted in `task_execution`, one row per task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskExecutionRecord {
    pub task_name: String,
    /// Date of the last successful, non-dry-run execution.
    pub last_run_date: NaiveDate,
    pub frequency_days: u32,
    /// RFC 3339 timestamp of the last write.
    pub updated_at: String,
}

impl TaskExecutionRecord {
    /// True once at least `frequency_days` have passed since the last run.
    /// A last-run date in the future (clock moved back) is never due.
    pub fn is_due(&self, today: NaiveDate, frequency_days: u32) -> bool {
        today.signed_duration_since(self.last_run_date).num_days() >= i64::from(frequency_days)
    }
}

/// Result of one `execute` call.
#[derive(Debug)]
pub enum ExecutionOutcome {
    Succeeded,
    Skipped,
    Failed(SchedulerError),
}

impl ExecutionOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, ExecutionOutcome::Failed(_))
    }

    /// Process exit status a runner should report for this outcome.
    pub fn exit_code(&self) -> i32 {
        if self.is_failure() {
            1
        } else {
            0
        }
    }
}

impl std::fmt::Display for ExecutionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionOutcome::Succeeded => write!(f, "succeeded"),
            ExecutionOutcome::Skipped => write!(f, "skipped"),
            ExecutionOutcome::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// Outcome column of `task_run_log`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Succeeded => write!(f, "succeeded"),
            RunOutcome::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RunOutcome {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(RunOutcome::Succeeded),
            "failed" => Ok(RunOutcome::Failed),
            other => Err(format!("unknown run outcome: {other}")),
        }
    }
}

/// One row of the append-only `task_run_log`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLogEntry {
    /// Assigned by the ID allocator.
    pub id: i64,
    /// UUID v7 shared with the run's log lines.
    pub run_id: String,
    pub task_name: String,
    pub run_date: NaiveDate,
    pub forced: bool,
    pub outcome: RunOutcome,
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(last: NaiveDate) -> TaskExecutionRecord {
        TaskExecutionRecord {
            task_name: "weekly_report".into(),
            last_run_date: last,
            frequency_days: 3,
            updated_at: String::new(),
        }
    }

    #[test]
    fn due_after_frequency_days() {
        let d = NaiveDate::from_ymd_opt(2026, 2, 27).unwrap();
        let rec = record(d);
        assert!(!rec.is_due(d, 3));
        assert!(!rec.is_due(d + chrono::Days::new(1), 3));
        assert!(!rec.is_due(d + chrono::Days::new(2), 3));
        // crosses a month boundary
        assert!(rec.is_due(d + chrono::Days::new(3), 3));
    }

    #[test]
    fn future_last_run_is_not_due() {
        let d = NaiveDate::from_ymd_opt(2026, 5, 10).unwrap();
        let rec = record(d);
        assert!(!rec.is_due(d - chrono::Days::new(1), 0));
    }

    #[test]
    fn state_roundtrips_through_strings() {
        for state in [
            TaskState::Idle,
            TaskState::Running,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Skipped,
        ] {
            assert_eq!(state.to_string().parse::<TaskState>(), Ok(state));
        }
        assert!("paused".parse::<TaskState>().is_err());
    }

    #[test]
    fn exit_code_reflects_failure() {
        assert_eq!(ExecutionOutcome::Succeeded.exit_code(), 0);
        assert_eq!(ExecutionOutcome::Skipped.exit_code(), 0);
        let failed = ExecutionOutcome::Failed(SchedulerError::TaskBody {
            task: "t".into(),
            reason: "boom".into(),
        });
        assert_eq!(failed.exit_code(), 1);
    }
}

use cadence_store::{Allocator, Record, Store, Value};
use chrono::{NaiveDate, Utc};

use crate::error::{Result, SchedulerError};
use crate::types::{RunLogEntry, RunOutcome, TaskExecutionRecord};

pub const EXECUTION_TABLE: &str = "task_execution";
pub const RUN_LOG_TABLE: &str = "task_run_log";

/// Initialise the scheduler schema through `store`.
///
/// Creates the completion-marker table and the run log (idempotent). Both
/// live in the same database as the business data.
pub fn init_db(store: &dyn Store) -> Result<()> {
    store.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS task_execution (
            task_name       TEXT    NOT NULL PRIMARY KEY,
            last_run_date   TEXT    NOT NULL,   -- YYYY-MM-DD
            frequency_days  INTEGER NOT NULL,
            updated_at      TEXT    NOT NULL
        ) STRICT;

        -- ids come from IdAllocator, never from SQLite's rowid assignment
        CREATE TABLE IF NOT EXISTS task_run_log (
            id           INTEGER NOT NULL PRIMARY KEY,
            run_id       TEXT    NOT NULL,
            task_name    TEXT    NOT NULL,
            run_date     TEXT    NOT NULL,
            forced       INTEGER NOT NULL,
            outcome      TEXT    NOT NULL,
            error        TEXT,
            started_at   TEXT    NOT NULL,
            finished_at  TEXT    NOT NULL
        ) STRICT;

        CREATE INDEX IF NOT EXISTS idx_run_log_task ON task_run_log (task_name, id);
        ",
    )?;
    Ok(())
}

pub fn load_record(store: &dyn Store, task_name: &str) -> Result<Option<TaskExecutionRecord>> {
    let rows = store.execute_query(
        "SELECT task_name, last_run_date, frequency_days, updated_at
         FROM task_execution WHERE task_name = ?1",
        &[Value::Text(task_name.to_string())],
    )?;
    rows.first().map(row_to_record).transpose()
}

pub fn list_records(store: &dyn Store) -> Result<Vec<TaskExecutionRecord>> {
    store
        .execute_query(
            "SELECT task_name, last_run_date, frequency_days, updated_at
             FROM task_execution ORDER BY task_name",
            &[],
        )?
        .iter()
        .map(row_to_record)
        .collect()
}

/// Record `run_date` as the task's last run. Re-running the same write is
/// harmless, so a retried completion cannot corrupt the marker.
pub fn upsert_record(
    store: &dyn Store,
    task_name: &str,
    run_date: NaiveDate,
    frequency_days: u32,
) -> Result<()> {
    store.execute_non_query(
        "INSERT INTO task_execution (task_name, last_run_date, frequency_days, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(task_name) DO UPDATE SET
             last_run_date  = excluded.last_run_date,
             frequency_days = excluded.frequency_days,
             updated_at     = excluded.updated_at",
        &[
            Value::Text(task_name.to_string()),
            Value::Text(run_date.to_string()),
            Value::Integer(i64::from(frequency_days)),
            Value::Text(Utc::now().to_rfc3339()),
        ],
    )?;
    Ok(())
}

/// Fields of a run-log row before the allocator assigns its ID.
#[derive(Debug, Clone)]
pub struct NewRunLog<'a> {
    pub run_id: &'a str,
    pub task_name: &'a str,
    pub run_date: NaiveDate,
    pub forced: bool,
    pub outcome: RunOutcome,
    pub error: Option<&'a str>,
    pub started_at: &'a str,
    pub finished_at: &'a str,
}

/// Append a row to `task_run_log` and return its allocated ID.
pub fn append_run_log(allocator: &dyn Allocator, entry: &NewRunLog<'_>) -> Result<i64> {
    let row = Record::from([
        ("run_id".to_string(), Value::Text(entry.run_id.to_string())),
        ("task_name".to_string(), Value::Text(entry.task_name.to_string())),
        ("run_date".to_string(), Value::Text(entry.run_date.to_string())),
        ("forced".to_string(), Value::Integer(i64::from(entry.forced))),
        ("outcome".to_string(), Value::Text(entry.outcome.to_string())),
        (
            "error".to_string(),
            entry
                .error
                .map(|e| Value::Text(e.to_string()))
                .unwrap_or(Value::Null),
        ),
        ("started_at".to_string(), Value::Text(entry.started_at.to_string())),
        ("finished_at".to_string(), Value::Text(entry.finished_at.to_string())),
    ]);
    Ok(allocator.allocate_and_insert(RUN_LOG_TABLE, "id", &row)?)
}

/// Most recent runs of `task_name`, newest first.
pub fn recent_runs(store: &dyn Store, task_name: &str, limit: usize) -> Result<Vec<RunLogEntry>> {
    store
        .execute_query(
            "SELECT id, run_id, task_name, run_date, forced, outcome, error,
                    started_at, finished_at
             FROM task_run_log
             WHERE task_name = ?1
             ORDER BY id DESC
             LIMIT ?2",
            &[
                Value::Text(task_name.to_string()),
                Value::Integer(limit as i64),
            ],
        )?
        .iter()
        .map(row_to_run)
        .collect()
}

fn row_to_record(row: &Record) -> Result<TaskExecutionRecord> {
    Ok(TaskExecutionRecord {
        task_name: text(row, "task_name")?,
        last_run_date: date(row, "last_run_date")?,
        frequency_days: u32::try_from(integer(row, "frequency_days")?)
            .map_err(|e| SchedulerError::InvalidRecord(format!("frequency_days: {e}")))?,
        updated_at: text(row, "updated_at")?,
    })
}

fn row_to_run(row: &Record) -> Result<RunLogEntry> {
    let outcome = text(row, "outcome")?;
    Ok(RunLogEntry {
        id: integer(row, "id")?,
        run_id: text(row, "run_id")?,
        task_name: text(row, "task_name")?,
        run_date: date(row, "run_date")?,
        forced: integer(row, "forced")? != 0,
        outcome: outcome.parse().map_err(SchedulerError::InvalidRecord)?,
        error: match row.get("error") {
            Some(Value::Text(e)) => Some(e.clone()),
            _ => None,
        },
        started_at: text(row, "started_at")?,
        finished_at: text(row, "finished_at")?,
    })
}

fn text(row: &Record, column: &str) -> Result<String> {
    match row.get(column) {
        Some(Value::Text(s)) => Ok(s.clone()),
        other => Err(SchedulerError::InvalidRecord(format!(
            "{column}: expected text, got {other:?}"
        ))),
    }
}

fn integer(row: &Record, column: &str) -> Result<i64> {
    match row.get(column) {
        Some(Value::Integer(n)) => Ok(*n),
        other => Err(SchedulerError::InvalidRecord(format!(
            "{column}: expected integer, got {other:?}"
        ))),
    }
}

fn date(row: &Record, column: &str) -> Result<NaiveDate> {
    let raw = text(row, column)?;
    raw.parse()
        .map_err(|e| SchedulerError::InvalidRecord(format!("{column}: {raw:?}: {e}")))
}

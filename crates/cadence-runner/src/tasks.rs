use anyhow::Context;
use cadence_scheduler::{TaskBody, TaskContext};
use tracing::info;

/// Task body that runs a fixed list of SQL statements from the config file.
pub struct SqlTask {
    statements: Vec<String>,
}

impl SqlTask {
    pub fn new(statements: Vec<String>) -> Self {
        Self { statements }
    }
}

impl TaskBody for SqlTask {
    fn run(&self, ctx: &TaskContext<'_>) -> anyhow::Result<()> {
        for (i, sql) in self.statements.iter().enumerate() {
            if ctx.dry_run {
                info!(task = ctx.task_name, run_id = %ctx.run_id, step = i + 1, %sql, "dry run: would execute");
                continue;
            }
            let changed = ctx
                .store
                .execute_non_query(sql, &[])
                .with_context(|| format!("statement {} of {}", i + 1, self.statements.len()))?;
            info!(task = ctx.task_name, run_id = %ctx.run_id, step = i + 1, changed, "statement executed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::AllocatorConfig;
    use cadence_scheduler::{db, ExecutionOutcome, SchedulerError, TaskExecutionCoordinator};
    use cadence_store::{ConnectionPool, IdAllocator, SqliteManager, SqlitePool, Store, Value};
    use chrono::NaiveDate;
    use std::sync::Arc;
    use std::time::Duration;

    fn pool(dir: &tempfile::TempDir) -> SqlitePool {
        let pool = ConnectionPool::with_limits(
            SqliteManager::new(dir.path().join("cadence.db"), Duration::from_secs(5)),
            2,
            Duration::from_secs(5),
            Duration::from_secs(300),
        );
        db::init_db(&pool).unwrap();
        pool.execute_batch(
            "CREATE TABLE sessions (id INTEGER PRIMARY KEY, expired INTEGER NOT NULL);
             INSERT INTO sessions (id, expired) VALUES (1, 1), (2, 0), (3, 1);",
        )
        .unwrap();
        pool
    }

    fn coordinator(pool: &SqlitePool, statements: &[&str]) -> TaskExecutionCoordinator {
        TaskExecutionCoordinator::new(
            "purge_sessions",
            7,
            SqlTask::new(statements.iter().map(|s| s.to_string()).collect()),
            Arc::new(pool.clone()),
            Arc::new(IdAllocator::new(pool.clone(), &AllocatorConfig::default())),
        )
    }

    fn remaining(pool: &SqlitePool) -> usize {
        pool.execute_query("SELECT id FROM sessions", &[]).unwrap().len()
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 6, 15).unwrap()
    }

    #[test]
    fn statements_run_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);
        let coord = coordinator(
            &pool,
            &[
                "UPDATE sessions SET expired = 1 WHERE id = 2",
                "DELETE FROM sessions WHERE expired = 1",
            ],
        );

        assert!(matches!(coord.execute_on(today(), false, false), ExecutionOutcome::Succeeded));
        assert_eq!(remaining(&pool), 0);
        assert_eq!(coord.record().unwrap().map(|r| r.last_run_date), Some(today()));
    }

    #[test]
    fn dry_run_leaves_data_alone() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);
        let coord = coordinator(&pool, &["DELETE FROM sessions WHERE expired = 1"]);

        assert!(matches!(coord.execute_on(today(), false, true), ExecutionOutcome::Succeeded));
        assert_eq!(remaining(&pool), 3);
        assert!(coord.record().unwrap().is_none());
    }

    #[test]
    fn bad_statement_fails_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let pool = pool(&dir);
        let coord = coordinator(
            &pool,
            &["DELETE FROM sessions WHERE expired = 1", "DELETE FROM no_such_table"],
        );

        match coord.execute_on(today(), false, false) {
            ExecutionOutcome::Failed(SchedulerError::TaskBody { reason, .. }) => {
                assert!(reason.contains("statement 2 of 2"), "{reason}");
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(coord.record().unwrap().is_none());
        let rows = pool
            .execute_query("SELECT outcome FROM task_run_log", &[])
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["outcome"], Value::Text("failed".into()));
    }
}

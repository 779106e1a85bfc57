use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use cadence_core::AllocatorConfig;
use dashmap::DashMap;
use rusqlite::{ffi, params_from_iter};
use tracing::{debug, instrument, warn};

use crate::error::{Result, StoreError};
use crate::store::{build_insert, quote_ident, Record, SqlitePool, Value};

/// Inserts rows under freshly assigned sequential identifiers.
pub trait Allocator: Send + Sync {
    /// Insert `row` into `table` with `id_column` set to the next free ID
    /// and return that ID. On error the row is not inserted.
    fn allocate_and_insert(&self, table: &str, id_column: &str, row: &Record) -> Result<i64>;
}

#[derive(Default)]
struct TableSlot {
    /// Serializes same-process read-max/insert windows for one table.
    window: Mutex<()>,
    /// Highest ID this process has committed for the table.
    high_water: AtomicI64,
}

/// `MAX(id) + 1` allocator that does not depend on SQLite's autoincrement.
///
/// Two writers can read the same maximum; the loser's insert trips the
/// uniqueness constraint on the ID column and is retried against a fresh
/// maximum. That constraint is what keeps IDs unique, across processes as
/// well as threads. The per-table lock only stops threads of this process
/// from racing each other for nothing.
///
/// Share one allocator per process: each instance keeps its own locks and
/// high-water marks.
pub struct IdAllocator {
    pool: SqlitePool,
    max_attempts: u32,
    serialize_in_process: bool,
    tables: DashMap<(String, String), Arc<TableSlot>>,
}

impl IdAllocator {
    pub fn new(pool: SqlitePool, config: &AllocatorConfig) -> Self {
        Self {
            pool,
            max_attempts: config.max_allocation_retries.max(1),
            serialize_in_process: config.serialize_in_process,
            tables: DashMap::new(),
        }
    }

    fn slot(&self, table: &str, id_column: &str) -> Arc<TableSlot> {
        let key = (table.to_ascii_lowercase(), id_column.to_ascii_lowercase());
        Arc::clone(self.tables.entry(key).or_default().value())
    }
}

impl Allocator for IdAllocator {
    #[instrument(skip(self, row))]
    fn allocate_and_insert(&self, table: &str, id_column: &str, row: &Record) -> Result<i64> {
        if row.contains_key(id_column) {
            return Err(StoreError::InvalidRecord(format!(
                "row must not set the allocated column {id_column}"
            )));
        }
        let max_sql = format!(
            "SELECT COALESCE(MAX({}), 0) FROM {}",
            quote_ident(id_column)?,
            quote_ident(table)?
        );
        let mut record = row.clone();
        record.insert(id_column.to_string(), Value::Null);
        let (insert_sql, mut params) = build_insert(table, &record)?;
        let id_index = record
            .keys()
            .position(|k| k == id_column)
            .unwrap_or_default();

        let slot = self.slot(table, id_column);
        // Lease first, then the table lock: a thread holding the lock must
        // never be queued behind lease holders that are waiting for it.
        let mut lease = self.pool.acquire()?;

        for attempt in 1..=self.max_attempts {
            let _window = self
                .serialize_in_process
                .then(|| slot.window.lock().unwrap_or_else(PoisonError::into_inner));

            let current_max: i64 = match lease.query_row(&max_sql, [], |r| r.get(0)) {
                Ok(max) => max,
                Err(e) => {
                    lease.mark_failed();
                    return Err(e.into());
                }
            };
            let candidate = current_max.max(slot.high_water.load(Ordering::Acquire)) + 1;
            params[id_index] = Value::Integer(candidate);

            match lease.execute(&insert_sql, params_from_iter(params.iter())) {
                Ok(_) => {
                    slot.high_water.fetch_max(candidate, Ordering::AcqRel);
                    debug!(id = candidate, attempt, "id allocated");
                    return Ok(candidate);
                }
                Err(e) if is_id_conflict(&e, table, id_column) => {
                    debug!(candidate, attempt, "id taken by a concurrent writer; retrying");
                }
                Err(e) => {
                    lease.mark_failed();
                    return Err(e.into());
                }
            }
        }

        lease.mark_failed();
        warn!(attempts = self.max_attempts, "id allocation gave up after repeated conflicts");
        Err(StoreError::AllocationFailed {
            table: table.to_string(),
            column: id_column.to_string(),
            attempts: self.max_attempts,
        })
    }
}

/// True when `err` is a uniqueness violation on exactly `table.column`.
///
/// SQLite reports the violated columns as `table.col[, table.col]` using
/// their declared spelling, while identifiers match case-insensitively.
fn is_id_conflict(err: &rusqlite::Error, table: &str, column: &str) -> bool {
    let rusqlite::Error::SqliteFailure(e, Some(msg)) = err else {
        return false;
    };
    if !matches!(
        e.extended_code,
        ffi::SQLITE_CONSTRAINT_PRIMARYKEY | ffi::SQLITE_CONSTRAINT_UNIQUE
    ) {
        return false;
    }
    let Some((_, columns)) = msg.split_once("constraint failed: ") else {
        return false;
    };
    columns.split(", ").any(|entry| {
        entry.split_once('.').is_some_and(|(t, c)| {
            t.eq_ignore_ascii_case(table) && c.eq_ignore_ascii_case(column)
        })
    })
}

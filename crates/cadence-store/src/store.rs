use std::collections::BTreeMap;

use rusqlite::{params_from_iter, Connection};
use tracing::instrument;

use crate::error::{Result, StoreError};
use crate::manager::SqliteManager;
use crate::pool::ConnectionPool;

pub use rusqlite::types::Value;

/// One row: column name to value. Column order carries no meaning.
pub type Record = BTreeMap<String, Value>;

/// Pool of SQLite connections; the concrete store used in production.
pub type SqlitePool = ConnectionPool<SqliteManager>;

/// Narrow data-access surface handed to task bodies and the coordinator.
///
/// Every call borrows a pooled connection for its own duration only.
pub trait Store: Send + Sync {
    /// Run a SELECT and return its rows in store order.
    fn execute_query(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>>;

    /// Run a write statement and return the number of affected rows.
    fn execute_non_query(&self, sql: &str, params: &[Value]) -> Result<usize>;

    /// `UPDATE table SET column_values WHERE conditions`, with conditions
    /// matched by null-safe equality and joined by `AND`. Returns whether
    /// any row changed.
    fn update_record(
        &self,
        table: &str,
        column_values: &Record,
        conditions: &Record,
    ) -> Result<bool>;

    /// Run several statements without parameters (schema setup).
    fn execute_batch(&self, sql: &str) -> Result<()>;
}

impl SqlitePool {
    /// Build the pool described by `config`.
    pub fn open(config: &cadence_core::CadenceConfig) -> Self {
        ConnectionPool::new(SqliteManager::from_config(&config.database), &config.pool)
    }

    /// Run `f` on a leased connection. An error from `f` is counted as a
    /// failed operation in the pool stats.
    pub fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut lease = self.acquire()?;
        let result = f(&*lease);
        if result.is_err() {
            lease.mark_failed();
        }
        lease.release();
        result
    }
}

impl Store for SqlitePool {
    #[instrument(skip(self, params), fields(params = params.len()))]
    fn execute_query(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>> {
        self.with_connection(|conn| query_rows(conn, sql, params))
    }

    #[instrument(skip(self, params), fields(params = params.len()))]
    fn execute_non_query(&self, sql: &str, params: &[Value]) -> Result<usize> {
        self.with_connection(|conn| Ok(conn.execute(sql, params_from_iter(params.iter()))?))
    }

    #[instrument(skip(self, column_values, conditions))]
    fn update_record(
        &self,
        table: &str,
        column_values: &Record,
        conditions: &Record,
    ) -> Result<bool> {
        let (sql, params) = build_update(table, column_values, conditions)?;
        let changed = self.execute_non_query(&sql, &params)?;
        Ok(changed > 0)
    }

    fn execute_batch(&self, sql: &str) -> Result<()> {
        self.with_connection(|conn| Ok(conn.execute_batch(sql)?))
    }
}

pub(crate) fn query_rows(conn: &Connection, sql: &str, params: &[Value]) -> Result<Vec<Record>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let rows = stmt.query_map(params_from_iter(params.iter()), |row| {
        columns
            .iter()
            .enumerate()
            .map(|(i, name)| Ok((name.clone(), row.get::<_, Value>(i)?)))
            .collect::<rusqlite::Result<Record>>()
    })?;
    let rows = rows.collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

/// Validate a table or column name and return it double-quoted.
///
/// Names cannot be bound as parameters, so only plain identifiers
/// (`[A-Za-z_][A-Za-z0-9_]*`) are accepted.
pub(crate) fn quote_ident(name: &str) -> Result<String> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(StoreError::InvalidIdentifier(name.to_string()));
    }
    Ok(format!("\"{name}\""))
}

pub(crate) fn build_insert(table: &str, record: &Record) -> Result<(String, Vec<Value>)> {
    if record.is_empty() {
        return Err(StoreError::InvalidRecord("insert needs at least one column".into()));
    }
    let columns = record
        .keys()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<_>>>()?;
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(table)?,
        columns.join(", "),
        placeholders.join(", ")
    );
    Ok((sql, record.values().cloned().collect()))
}

fn build_update(
    table: &str,
    column_values: &Record,
    conditions: &Record,
) -> Result<(String, Vec<Value>)> {
    if column_values.is_empty() {
        return Err(StoreError::InvalidRecord("update needs at least one column".into()));
    }
    if conditions.is_empty() {
        return Err(StoreError::InvalidRecord(
            "update without conditions would touch every row".into(),
        ));
    }

    let mut n = 0;
    let mut assignments = Vec::with_capacity(column_values.len());
    for column in column_values.keys() {
        n += 1;
        assignments.push(format!("{} = ?{n}", quote_ident(column)?));
    }
    let mut predicates = Vec::with_capacity(conditions.len());
    for column in conditions.keys() {
        n += 1;
        predicates.push(format!("{} IS ?{n}", quote_ident(column)?));
    }

    let sql = format!(
        "UPDATE {} SET {} WHERE {}",
        quote_ident(table)?,
        assignments.join(", "),
        predicates.join(" AND ")
    );
    let params = column_values
        .values()
        .chain(conditions.values())
        .cloned()
        .collect();
    Ok((sql, params))
}

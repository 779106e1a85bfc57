use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::Connection;
use tracing::debug;

use crate::error::{Result, StoreError};

/// Opens and health-checks the connections a [`ConnectionPool`] hands out.
///
/// [`ConnectionPool`]: crate::pool::ConnectionPool
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a fresh connection to the store.
    fn connect(&self) -> Result<Self::Connection>;

    /// Cheap liveness probe, run on checkout of an idle connection and on
    /// release. Returning `false` discards the connection.
    fn is_valid(&self, conn: &mut Self::Connection) -> bool;
}

/// Connection manager for a single SQLite database file.
#[derive(Debug, Clone)]
pub struct SqliteManager {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteManager {
    pub fn new(path: impl AsRef<Path>, busy_timeout: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            busy_timeout,
        }
    }

    pub fn from_config(config: &cadence_core::DatabaseConfig) -> Self {
        Self::new(&config.path, config.busy_timeout())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConnectionManager for SqliteManager {
    type Connection = Connection;

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path)
            .map_err(|e| StoreError::ConnectionLost(format!("{}: {e}", self.path.display())))?;
        conn.busy_timeout(self.busy_timeout)?;
        // WAL lets readers proceed while the single writer holds the lock.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        debug!(path = %self.path.display(), "sqlite connection opened");
        Ok(conn)
    }

    fn is_valid(&self, conn: &mut Connection) -> bool {
        // A connection handed back mid-transaction would leak that
        // transaction to the next holder; closing it rolls back instead.
        conn.is_autocommit()
            && conn
                .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .is_ok()
    }
}

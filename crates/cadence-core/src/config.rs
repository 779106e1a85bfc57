use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{CadenceError, Result};

pub const DEFAULT_MAX_CONNECTIONS: usize = 4;
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_IDLE_TTL_SECS: u64 = 300;
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_MAX_ALLOCATION_RETRIES: u32 = 5;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
///
/// Built once at startup and handed by reference to the pool, allocator and
/// coordinator constructors.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub allocator: AllocatorConfig,
    /// Scheduled tasks known to the runner.
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    /// How long a writer waits on SQLite's file lock before giving up.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    /// Create the directory the database file lives in, if missing.
    pub fn ensure_parent_dir(&self) -> Result<()> {
        if let Some(parent) = std::path::Path::new(&self.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

/// Connection pool sizing and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Hard ceiling on live connections (idle + leased).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// How long `acquire` blocks before reporting the pool as exhausted.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Idle connections older than this are closed instead of reused.
    #[serde(default = "default_idle_ttl_secs")]
    pub idle_connection_ttl_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            idle_connection_ttl_secs: DEFAULT_IDLE_TTL_SECS,
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_connection_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_connection_ttl_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(CadenceError::Config(
                "pool.max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Attempts per insert before giving up with `AllocationFailed`.
    #[serde(default = "default_max_allocation_retries")]
    pub max_allocation_retries: u32,
    /// Serialize same-process allocations per table. Only cuts down on
    /// wasted retries; uniqueness comes from the store's constraint.
    #[serde(default = "bool_true")]
    pub serialize_in_process: bool,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            max_allocation_retries: DEFAULT_MAX_ALLOCATION_RETRIES,
            serialize_in_process: true,
        }
    }
}

/// One scheduled unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    /// Minimum number of days between two runs. 0 means every invocation.
    #[serde(default = "default_frequency_days")]
    pub frequency_days: u32,
    /// SQL statements executed in order when the task runs.
    #[serde(default)]
    pub statements: Vec<String>,
}

fn bool_true() -> bool {
    true
}
fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}
fn default_acquire_timeout_ms() -> u64 {
    DEFAULT_ACQUIRE_TIMEOUT_MS
}
fn default_idle_ttl_secs() -> u64 {
    DEFAULT_IDLE_TTL_SECS
}
fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}
fn default_max_allocation_retries() -> u32 {
    DEFAULT_MAX_ALLOCATION_RETRIES
}
fn default_frequency_days() -> u32 {
    1
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `CADENCE_POOL__MAX_CONNECTIONS=8`. A missing file yields defaults.
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| CadenceError::Config(e.to_string()))?;

        config.validate()?;
        tracing::debug!(%path, tasks = config.tasks.len(), "configuration loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.pool.validate()?;
        if self.allocator.max_allocation_retries == 0 {
            return Err(CadenceError::Config(
                "allocator.max_allocation_retries must be at least 1".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for task in &self.tasks {
            if task.name.trim().is_empty() {
                return Err(CadenceError::Config("task name must not be empty".to_string()));
            }
            if !seen.insert(task.name.as_str()) {
                return Err(CadenceError::Config(format!(
                    "duplicate task name: {}",
                    task.name
                )));
            }
        }
        Ok(())
    }

    pub fn task(&self, name: &str) -> Option<&TaskConfig> {
        self.tasks.iter().find(|t| t.name == name)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(body: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cadence.toml");
        std::fs::write(&path, body).expect("write config");
        let path = path.to_string_lossy().into_owned();
        (dir, path)
    }

    #[test]
    fn database_parent_dir_is_created() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = DatabaseConfig {
            path: dir.path().join("a/b/cadence.db").to_string_lossy().into_owned(),
            ..DatabaseConfig::default()
        };
        db.ensure_parent_dir().expect("create parent");
        assert!(dir.path().join("a/b").is_dir());
    }

    #[test]
    fn unwritable_parent_dir_is_an_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").expect("write file");
        let db = DatabaseConfig {
            path: blocker.join("cadence.db").to_string_lossy().into_owned(),
            ..DatabaseConfig::default()
        };
        let err = db.ensure_parent_dir().unwrap_err();
        assert!(matches!(err, CadenceError::Io(_)));
        assert_eq!(err.code(), "IO_ERROR");
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("absent.toml");
        let config = CadenceConfig::load(path.to_str()).expect("load");
        assert_eq!(config.pool.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.allocator.max_allocation_retries, 5);
        assert!(config.allocator.serialize_in_process);
        assert!(config.tasks.is_empty());
    }

    #[test]
    fn reads_pool_and_tasks_from_toml() {
        let (_dir, path) = write_config(
            r#"
            [database]
            path = "/tmp/reports.db"

            [pool]
            max_connections = 2
            acquire_timeout_ms = 250

            [[tasks]]
            name = "weekly_report"
            frequency_days = 7
            statements = ["DELETE FROM outbox WHERE sent = 1"]

            [[tasks]]
            name = "daily_digest"
            "#,
        );
        let config = CadenceConfig::load(Some(&path)).expect("load");
        assert_eq!(config.database.path, "/tmp/reports.db");
        assert_eq!(config.pool.max_connections, 2);
        assert_eq!(config.pool.acquire_timeout(), Duration::from_millis(250));
        assert_eq!(config.pool.idle_connection_ttl_secs, DEFAULT_IDLE_TTL_SECS);
        assert_eq!(config.tasks.len(), 2);
        assert_eq!(config.task("weekly_report").map(|t| t.frequency_days), Some(7));
        assert_eq!(config.task("daily_digest").map(|t| t.frequency_days), Some(1));
    }

    #[test]
    fn zero_connections_rejected() {
        let (_dir, path) = write_config("[pool]\nmax_connections = 0\n");
        let err = CadenceConfig::load(Some(&path)).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn duplicate_task_names_rejected() {
        let (_dir, path) = write_config(
            "[[tasks]]\nname = \"a\"\n[[tasks]]\nname = \"a\"\n",
        );
        let err = CadenceConfig::load(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("duplicate task name"));
    }
}

mod entries;
mod work_items;

use rfs_core::{Clock, CoordinationError};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

pub const STORE_SCHEMA_VERSION: i64 = 4;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
    #[error("store connection lock poisoned")]
    LockPoisoned,
}

impl From<StorageError> for CoordinationError {
    fn from(err: StorageError) -> Self {
        CoordinationError::backend(err)
    }
}

pub(crate) fn sql(err: rusqlite::Error) -> CoordinationError {
    StorageError::Sqlite(err).into()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqliteCoordinatorConfig {
    pub tolerable_clock_drift: Duration,
    pub busy_timeout: Duration,
}

impl Default for SqliteCoordinatorConfig {
    fn default() -> Self {
        Self {
            tolerable_clock_drift: Duration::from_secs(5),
            busy_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared coordination store on one SQLite file. Every worker process opens its own
/// connection; SQLite's write lock linearizes the conditional updates.
///
/// SQLite has no clock of its own. Store time is the `store_clock` high-water mark: the
/// latest worker time any committed lease write carried. A worker lagging behind it by
/// more than the drift tolerance is refused.
pub struct SqliteCoordinator {
    conn: Mutex<Connection>,
    worker_id: String,
    clock: Arc<dyn Clock>,
    config: SqliteCoordinatorConfig,
}

impl SqliteCoordinator {
    /// Opens the store without creating its schema; call `setup()` before use.
    pub fn open(
        path: impl AsRef<Path>,
        worker_id: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        Self::from_connection(Connection::open(path)?, worker_id, clock)
    }

    pub fn open_in_memory(
        worker_id: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        let store = Self::from_connection(Connection::open_in_memory()?, worker_id, clock)?;
        store.migrate()?;
        Ok(store)
    }

    fn from_connection(
        conn: Connection,
        worker_id: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StorageError> {
        let config = SqliteCoordinatorConfig::default();
        conn.busy_timeout(config.busy_timeout)?;
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        Ok(Self {
            conn: Mutex::new(conn),
            worker_id: worker_id.into(),
            clock,
            config,
        })
    }

    pub fn with_config(self, config: SqliteCoordinatorConfig) -> Result<Self, StorageError> {
        self.lock()?.busy_timeout(config.busy_timeout)?;
        Ok(Self { config, ..self })
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .lock()?
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut current: i64 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if current > STORE_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: STORE_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            tx.execute_batch(include_str!("../migrations/0001_work_items.sql"))?;
            tx.execute_batch("PRAGMA user_version = 1")?;
            current = 1;
        }

        if current < 2 {
            tx.execute_batch(include_str!("../migrations/0002_migration_entries.sql"))?;
            tx.execute_batch("PRAGMA user_version = 2")?;
            current = 2;
        }

        if current < 3 {
            tx.execute_batch(include_str!("../migrations/0003_work_item_failures.sql"))?;
            tx.execute_batch("PRAGMA user_version = 3")?;
            current = 3;
        }

        if current < 4 {
            tx.execute_batch(include_str!("../migrations/0004_store_clock.sql"))?;
            tx.execute_batch("PRAGMA user_version = 4")?;
        }

        tx.commit()?;
        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .lock()?
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }
}

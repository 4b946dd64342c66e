//! SQLite persistence layer for shelfsync.
//!
//! Provides a [`Database`] handle with WAL-mode journaling, automatic schema
//! migrations, and query helpers for the mirrored tables (the Local Store),
//! the per-table sync cursors, the change queue, the audit log and `kv_state`.

pub mod cursor;
pub mod queries;
pub mod queue;
pub mod schema;
pub mod store;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::StorageError;
use crate::record::Table;

/// Main database handle wrapping a SQLite connection.
///
/// The connection is opened in WAL mode and uses `PRAGMA foreign_keys = ON`.
/// The inner connection is wrapped in a `Mutex` so that `Database` is
/// `Send + Sync`, enabling use inside `Arc`.
///
/// Each mirrored table additionally has its own writer lock. A batch write
/// takes the table lock first and the connection lock second; the table lock
/// is never held across a network round-trip.
pub struct Database {
    conn: Mutex<Connection>,
    table_locks: [Mutex<()>; Table::COUNT],
}

impl Database {
    /// Open (or create) a SQLite database at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;

        debug!("database opened successfully with WAL mode");
        Ok(Self::from_connection(conn))
    }

    /// Open an in-memory database (useful for testing).
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            table_locks: std::array::from_fn(|_| Mutex::new(())),
        }
    }

    /// Run all schema migrations to bring the database up to date.
    pub fn initialize(&self) -> Result<(), StorageError> {
        info!("initializing database schema");
        let conn = self.conn();
        schema::run_migrations(&conn)?;
        debug!("database schema is up to date");
        Ok(())
    }

    /// Obtain a lock on the underlying connection.
    ///
    /// If the Mutex is poisoned (a previous holder panicked), the lock is
    /// recovered rather than propagating a panic.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Acquire the single-writer lock for `table`.
    pub fn lock_table(&self, table: Table) -> MutexGuard<'_, ()> {
        self.table_locks[table.index()]
            .lock()
            .unwrap_or_else(|poisoned| {
                tracing::warn!(table = %table, "table lock was poisoned, recovering");
                poisoned.into_inner()
            })
    }

    /// Execute a closure inside a SQLite transaction. If the closure returns
    /// `Ok`, the transaction is committed; otherwise it is rolled back.
    pub fn transaction<F, T>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError>,
    {
        let mut conn = self.conn();
        let tx = conn.transaction().map_err(StorageError::classify)?;
        let result = f(&tx)?;
        tx.commit().map_err(StorageError::classify)?;
        Ok(result)
    }

    /// Execute a transaction while holding the writer lock for `table`.
    ///
    /// Every batch that touches a mirrored table goes through here, so a local
    /// edit can never interleave with an in-flight sync batch for that table.
    pub fn write_batch<F, T>(&self, table: Table, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&Connection) -> Result<T, StorageError>,
    {
        let _guard = self.lock_table(table);
        self.transaction(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_database() {
        let db = Database::in_memory().expect("failed to create in-memory db");
        db.initialize().expect("failed to initialize schema");
    }

    #[test]
    fn test_file_database_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("shelfsync.db");
        let db = Database::new(&path).expect("failed to create file db");
        db.initialize().expect("failed to initialize schema");
        assert!(path.exists());
    }

    #[test]
    fn test_transaction_commit() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();

        db.transaction(|conn| {
            conn.execute(
                "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)",
                rusqlite::params!["test", "42", "2025-01-01T00:00:00Z"],
            )?;
            Ok(())
        })
        .unwrap();

        assert_eq!(db.get_state("test").unwrap().as_deref(), Some("42"));
    }

    #[test]
    fn test_write_batch_rollback() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();

        let result: Result<(), StorageError> = db.write_batch(Table::Books, |conn| {
            conn.execute(
                "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)",
                rusqlite::params!["rollback_test", "99", "2025-01-01T00:00:00Z"],
            )?;
            Err(StorageError::NotFound {
                entity: "test".into(),
                id: "forced".into(),
            })
        });
        assert!(result.is_err());
        assert!(db.get_state("rollback_test").unwrap().is_none());

        // The table lock was released by the failed batch.
        drop(db.lock_table(Table::Books));
    }
}

//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The `schema_version`
//! user-version pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::StorageError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
/// Versions start at 1. The current schema version is stored in the SQLite
/// `user_version` pragma.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "mirrored entity tables",
        r#"
        CREATE TABLE IF NOT EXISTS categories (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL,
            description TEXT,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS classes (
            id                TEXT PRIMARY KEY,
            name              TEXT NOT NULL,
            grade_level       INTEGER,
            max_books_allowed INTEGER NOT NULL DEFAULT 0,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS books (
            id               TEXT PRIMARY KEY,
            title            TEXT NOT NULL,
            author           TEXT NOT NULL,
            isbn             TEXT,
            category_id      TEXT,
            total_copies     INTEGER NOT NULL DEFAULT 0,
            available_copies INTEGER NOT NULL DEFAULT 0,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL,
            CHECK (available_copies >= 0 AND available_copies <= total_copies)
        );

        CREATE INDEX IF NOT EXISTS idx_books_category_id ON books (category_id);

        CREATE TABLE IF NOT EXISTS students (
            id          TEXT PRIMARY KEY,
            student_id  TEXT NOT NULL,
            name        TEXT NOT NULL,
            email       TEXT,
            class_id    TEXT,
            status      TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS staff (
            id          TEXT PRIMARY KEY,
            staff_id    TEXT NOT NULL,
            name        TEXT NOT NULL,
            role        TEXT,
            department  TEXT,
            status      TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS borrowings (
            id          TEXT PRIMARY KEY,
            book_id     TEXT NOT NULL,
            student_id  TEXT NOT NULL,
            borrow_date TEXT NOT NULL,
            due_date    TEXT NOT NULL,
            return_date TEXT,
            status      TEXT NOT NULL CHECK (status IN ('borrowed', 'returned', 'overdue')),
            fine_amount REAL,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS fines (
            id           TEXT PRIMARY KEY,
            borrowing_id TEXT NOT NULL,
            student_id   TEXT NOT NULL,
            amount       REAL NOT NULL,
            reason       TEXT NOT NULL,
            status       TEXT NOT NULL CHECK (status IN ('pending', 'paid', 'waived')),
            paid_date    TEXT,
            created_at   TEXT NOT NULL,
            updated_at   TEXT NOT NULL
        );
        "#,
    ),
    (
        2,
        "sync metadata, change queue, audit log",
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            table_name     TEXT PRIMARY KEY,
            last_sync      TEXT,
            synced_records INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS change_queue (
            seq                 INTEGER PRIMARY KEY AUTOINCREMENT,
            table_name          TEXT NOT NULL,
            record_id           TEXT NOT NULL,
            op                  TEXT NOT NULL CHECK (op IN ('create', 'update', 'delete')),
            payload             TEXT,
            snapshot_updated_at TEXT NOT NULL,
            enqueued_at         TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_change_queue_table ON change_queue (table_name, seq);
        CREATE INDEX IF NOT EXISTS idx_change_queue_record ON change_queue (table_name, record_id);

        CREATE TABLE IF NOT EXISTS audit_log (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            action       TEXT NOT NULL,
            description  TEXT NOT NULL,
            severity     TEXT NOT NULL CHECK (severity IN ('info', 'warning', 'error', 'success')),
            component    TEXT NOT NULL,
            metadata     TEXT,
            created_at   TEXT NOT NULL,
            repeat_count INTEGER NOT NULL DEFAULT 1,
            last_seen_at TEXT NOT NULL,
            forwarded    INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_audit_log_created_at ON audit_log (created_at);
        CREATE INDEX IF NOT EXISTS idx_audit_log_forwarded ON audit_log (forwarded);

        CREATE TABLE IF NOT EXISTS kv_state (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), StorageError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| StorageError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
fn get_schema_version(conn: &Connection) -> Result<u32, StorageError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), StorageError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

//! Sync State Tracker: the per-table pull cursor stored in `sync_state`.
//!
//! A cursor only moves forward. [`advance_cursor_in`] is meant to run inside
//! the same transaction as the batch it cursors; [`Database::reset_cursor`]
//! is the single way to rewind it.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use super::Database;
use crate::errors::StorageError;
use crate::models::{format_ts, parse_ts, SyncCursor};
use crate::record::Table;

/// Read the cursor for `table`, or the zero value if it never synced.
pub fn get_cursor_in(conn: &Connection, table: Table) -> Result<SyncCursor, StorageError> {
    let row: Option<(Option<String>, i64)> = conn
        .query_row(
            "SELECT last_sync, synced_records FROM sync_state WHERE table_name = ?1",
            params![table.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    Ok(match row {
        Some((last_sync, synced_records)) => SyncCursor {
            table_name: table.as_str().to_string(),
            last_sync: last_sync.as_deref().and_then(parse_ts),
            synced_records,
        },
        None => SyncCursor::empty(table),
    })
}

/// Move the cursor forward.
///
/// `last_sync` becomes the later of the stored value and `seen`; a `None` or
/// older `seen` leaves it where it is. The row is created on first use.
pub fn advance_cursor_in(
    conn: &Connection,
    table: Table,
    seen: Option<DateTime<Utc>>,
    synced_records: i64,
) -> Result<SyncCursor, StorageError> {
    let current = get_cursor_in(conn, table)?;
    let last_sync = match (current.last_sync, seen) {
        (Some(prev), Some(new)) => Some(prev.max(new)),
        (prev, new) => prev.or(new),
    };

    conn.execute(
        "INSERT INTO sync_state (table_name, last_sync, synced_records) VALUES (?1, ?2, ?3)
         ON CONFLICT(table_name) DO UPDATE SET last_sync = excluded.last_sync,
                                               synced_records = excluded.synced_records",
        params![table.as_str(), last_sync.as_ref().map(format_ts), synced_records],
    )?;

    Ok(SyncCursor {
        table_name: table.as_str().to_string(),
        last_sync,
        synced_records,
    })
}

impl Database {
    /// Cursor for `table` (zero value for a never-synced table).
    pub fn get_cursor(&self, table: Table) -> Result<SyncCursor, StorageError> {
        let conn = self.conn();
        get_cursor_in(&conn, table)
    }

    /// Advance the cursor on its own. The synchronizer advances it together
    /// with the pulled batch instead.
    pub fn advance_cursor(
        &self,
        table: Table,
        seen: Option<DateTime<Utc>>,
        synced_records: i64,
    ) -> Result<SyncCursor, StorageError> {
        let cursor =
            self.write_batch(table, |conn| advance_cursor_in(conn, table, seen, synced_records))?;
        debug!(table = %table, last_sync = ?cursor.last_sync, synced_records, "advanced cursor");
        Ok(cursor)
    }

    /// Rewind the cursor so the next cycle pulls the whole table again.
    pub fn reset_cursor(&self, table: Table) -> Result<(), StorageError> {
        self.write_batch(table, |conn| {
            conn.execute(
                "UPDATE sync_state SET last_sync = NULL, synced_records = 0 WHERE table_name = ?1",
                params![table.as_str()],
            )?;
            Ok(())
        })?;
        info!(table = %table, "sync cursor reset");
        Ok(())
    }

    /// All stored cursors, ordered by table name.
    pub fn list_cursors(&self) -> Result<Vec<SyncCursor>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT table_name, last_sync, synced_records FROM sync_state ORDER BY table_name",
        )?;
        let cursors = stmt
            .query_map([], |row| {
                let last_sync: Option<String> = row.get(1)?;
                Ok(SyncCursor {
                    table_name: row.get(0)?,
                    last_sync: last_sync.as_deref().and_then(parse_ts),
                    synced_records: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(cursors)
    }
}

//! Typed query helpers for the `audit_log` and `kv_state` tables.

use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::debug;

use super::Database;
use crate::errors::StorageError;
use crate::models::{format_ts, parse_ts, AuditEntry, AuditEvent, Severity};

/// `kv_state` key holding the id of the last row kept by a collapse pass.
pub const AUDIT_COLLAPSED_THROUGH: &str = "audit_collapsed_through";

const AUDIT_COLUMNS: &str =
    "id, action, description, severity, component, metadata, created_at, repeat_count, last_seen_at, forwarded";

/// Insert an audit event on a borrowed connection. Returns the row id.
pub fn insert_audit_in(conn: &Connection, event: &AuditEvent) -> Result<i64, StorageError> {
    let now = format_ts(&Utc::now());
    let metadata = event.metadata.as_ref().map(|m| m.to_string());
    conn.execute(
        "INSERT INTO audit_log (action, description, severity, component, metadata, created_at, last_seen_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![
            event.action,
            event.description,
            event.severity.to_string(),
            event.component,
            metadata,
            now,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn audit_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditEntry> {
    let severity: String = row.get(3)?;
    let metadata: Option<String> = row.get(5)?;
    let created_at: String = row.get(6)?;
    let last_seen_at: String = row.get(8)?;
    let created_at = parse_ts(&created_at).unwrap_or_else(Utc::now);
    Ok(AuditEntry {
        id: row.get(0)?,
        event: AuditEvent {
            action: row.get(1)?,
            description: row.get(2)?,
            severity: Severity::from_str_val(&severity),
            component: row.get(4)?,
            metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        },
        created_at,
        repeat_count: row.get(7)?,
        last_seen_at: parse_ts(&last_seen_at).unwrap_or(created_at),
        forwarded: row.get::<_, i64>(9)? != 0,
    })
}

impl Database {
    // -- audit_log ----------------------------------------------------------

    /// Insert an audit event.
    pub fn insert_audit(&self, event: &AuditEvent) -> Result<i64, StorageError> {
        let conn = self.conn();
        let id = insert_audit_in(&conn, event)?;
        debug!(id, action = %event.action, "inserted audit_log entry");
        Ok(id)
    }

    /// Most recent audit entries, newest first, optionally filtered by severity.
    pub fn list_audit(
        &self,
        limit: u32,
        severity: Option<Severity>,
    ) -> Result<Vec<AuditEntry>, StorageError> {
        let conn = self.conn();
        let entries = match severity {
            Some(sev) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE severity = ?1 ORDER BY id DESC LIMIT ?2"
                ))?;
                let rows = stmt
                    .query_map(params![sev.to_string(), limit], audit_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_log ORDER BY id DESC LIMIT ?1"
                ))?;
                let rows = stmt
                    .query_map(params![limit], audit_row)?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(entries)
    }

    /// Entries not yet delivered to the remote sink, oldest first.
    pub fn list_unforwarded_audit(&self, limit: u32) -> Result<Vec<AuditEntry>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE forwarded = 0 ORDER BY id LIMIT ?1"
        ))?;
        let entries = stmt
            .query_map(params![limit], audit_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    /// Flag entries as delivered to the remote sink.
    pub fn mark_audit_forwarded(&self, ids: &[i64]) -> Result<usize, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn();
        let placeholders = vec!["?"; ids.len()].join(", ");
        let updated = conn.execute(
            &format!("UPDATE audit_log SET forwarded = 1 WHERE id IN ({placeholders})"),
            params_from_iter(ids.iter()),
        )?;
        Ok(updated)
    }

    /// Total audit rows.
    pub fn count_audit(&self) -> Result<i64, StorageError> {
        let conn = self.conn();
        let count = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Audit rows with the given severity.
    pub fn count_audit_by_severity(&self, severity: Severity) -> Result<i64, StorageError> {
        let conn = self.conn();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM audit_log WHERE severity = ?1",
            params![severity.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Audit rows still waiting for remote delivery.
    pub fn count_unforwarded_audit(&self) -> Result<i64, StorageError> {
        let conn = self.conn();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM audit_log WHERE forwarded = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Collapse runs of consecutive identical events (same action, component,
    /// description and metadata) into their first row.
    ///
    /// The surviving row keeps its original `created_at`, accumulates the
    /// `repeat_count` of the run and takes the latest `last_seen_at`. Returns
    /// the number of rows removed.
    ///
    /// Each pass starts at the last row the previous pass kept, so a run
    /// continuing across passes still folds into its first row and older
    /// rows are never read again.
    pub fn collapse_duplicate_audit(&self) -> Result<usize, StorageError> {
        self.transaction(|conn| {
            let start: i64 = conn
                .query_row(
                    "SELECT value FROM kv_state WHERE key = ?1",
                    params![AUDIT_COLLAPSED_THROUGH],
                    |row| row.get::<_, String>(0),
                )
                .optional()?
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);

            let rows: Vec<(i64, String, String, String, Option<String>, i64, String)> = {
                let mut stmt = conn.prepare(
                    "SELECT id, action, component, description, metadata, repeat_count, last_seen_at
                     FROM audit_log WHERE id >= ?1 ORDER BY id",
                )?;
                let rows = stmt
                    .query_map(params![start], |row| {
                        Ok((
                            row.get(0)?,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };

            let mut removed = 0;
            let mut run: Option<(i64, i64, String)> = None;
            let mut prev_key: Option<(String, String, String, Option<String>)> = None;

            for (id, action, component, description, metadata, repeat, last_seen) in rows {
                let key = (action, component, description, metadata);
                if prev_key.as_ref() == Some(&key) {
                    if let Some((_, total, latest)) = run.as_mut() {
                        *total += repeat;
                        if last_seen > *latest {
                            *latest = last_seen;
                        }
                    }
                    conn.execute("DELETE FROM audit_log WHERE id = ?1", params![id])?;
                    removed += 1;
                } else {
                    flush_run(conn, run.take())?;
                    run = Some((id, repeat, last_seen));
                    prev_key = Some(key);
                }
            }
            let last_kept = run.as_ref().map(|(id, _, _)| *id);
            flush_run(conn, run)?;
            if let Some(id) = last_kept {
                conn.execute(
                    "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                    params![AUDIT_COLLAPSED_THROUGH, id.to_string(), format_ts(&Utc::now())],
                )?;
            }

            debug!(removed, from_id = start, "collapsed duplicate audit entries");
            Ok(removed)
        })
    }

    // -- kv_state -----------------------------------------------------------

    /// Get a key-value state entry.
    pub fn get_state(&self, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT value FROM kv_state WHERE key = ?1")?;
        let mut rows = stmt.query_map(params![key], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(Ok(val)) => Ok(Some(val)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }

    /// Set a key-value state entry (upsert).
    pub fn set_state(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let now = format_ts(&Utc::now());
        let conn = self.conn();
        conn.execute(
            "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, now],
        )?;
        debug!(key, value, "set kv_state");
        Ok(())
    }

    /// Remove a key-value state entry.
    pub fn delete_state(&self, key: &str) -> Result<(), StorageError> {
        let conn = self.conn();
        conn.execute("DELETE FROM kv_state WHERE key = ?1", params![key])?;
        Ok(())
    }
}

fn flush_run(conn: &Connection, run: Option<(i64, i64, String)>) -> Result<(), StorageError> {
    if let Some((id, total, latest)) = run {
        conn.execute(
            "UPDATE audit_log SET repeat_count = ?1, last_seen_at = ?2 WHERE id = ?3",
            params![total, latest, id],
        )?;
    }
    Ok(())
}

//! Change Queue: durable record of local mutations not yet confirmed by the
//! remote.
//!
//! Entries are ordered by the SQLite `AUTOINCREMENT` sequence number, never by
//! wall-clock time. [`plan_push`] turns a drained queue into the list of
//! remote operations for the configured [`PushMode`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection};
use tracing::debug;

use super::Database;
use crate::config::PushMode;
use crate::errors::{RecordError, StorageError};
use crate::models::{format_ts, parse_ts, ChangeOp, PendingChange};
use crate::record::Table;

// ---------------------------------------------------------------------------
// Push planning
// ---------------------------------------------------------------------------

/// One remote operation derived from one or more queue entries.
#[derive(Debug, Clone, PartialEq)]
pub struct PushItem {
    pub table: Table,
    pub record_id: String,
    /// `None` when the entries cancel out (created and deleted offline).
    pub op: Option<ChangeOp>,
    pub payload: Option<serde_json::Value>,
    pub snapshot_updated_at: DateTime<Utc>,
    /// Queue entries acknowledged once this item is applied.
    pub seqs: Vec<i64>,
}

/// Build the push plan for a drained queue.
///
/// In coalesced mode the entries of each record fold into its final state:
/// create+update sends a create with the latest payload, anything ending in a
/// delete sends a delete, and a record created and deleted before any push
/// sends nothing. Items are ordered by the first sequence number they cover.
pub fn plan_push(entries: Vec<PendingChange>, mode: PushMode) -> Vec<PushItem> {
    match mode {
        PushMode::Ordered => entries
            .into_iter()
            .map(|e| PushItem {
                table: e.table,
                record_id: e.record_id,
                op: Some(e.op),
                payload: e.payload,
                snapshot_updated_at: e.snapshot_updated_at,
                seqs: vec![e.seq],
            })
            .collect(),
        PushMode::Coalesced => {
            let mut order: Vec<(Table, String)> = Vec::new();
            let mut groups: HashMap<(Table, String), Vec<PendingChange>> = HashMap::new();
            for entry in entries {
                let key = (entry.table, entry.record_id.clone());
                groups
                    .entry(key.clone())
                    .or_insert_with(|| {
                        order.push(key);
                        Vec::new()
                    })
                    .push(entry);
            }
            order
                .into_iter()
                .filter_map(|key| groups.remove(&key))
                .filter_map(coalesce_record)
                .collect()
        }
    }
}

fn coalesce_record(mut entries: Vec<PendingChange>) -> Option<PushItem> {
    entries.sort_by_key(|e| e.seq);
    let first_op = entries.first()?.op;
    let last = entries.last()?.clone();

    let op = match (first_op, last.op) {
        (ChangeOp::Create, ChangeOp::Delete) => None,
        (_, ChangeOp::Delete) => Some(ChangeOp::Delete),
        (ChangeOp::Create, _) => Some(ChangeOp::Create),
        (_, ChangeOp::Create) | (_, ChangeOp::Update) => Some(ChangeOp::Update),
    };

    Some(PushItem {
        table: last.table,
        record_id: last.record_id,
        op,
        payload: if op == Some(ChangeOp::Delete) { None } else { last.payload },
        snapshot_updated_at: last.snapshot_updated_at,
        seqs: entries.iter().map(|e| e.seq).collect(),
    })
}

// ---------------------------------------------------------------------------
// Connection-level helpers
// ---------------------------------------------------------------------------

/// Append an entry. Returns its sequence number.
pub fn enqueue_in(
    conn: &Connection,
    table: Table,
    record_id: &str,
    op: ChangeOp,
    payload: Option<&serde_json::Value>,
    snapshot_updated_at: DateTime<Utc>,
) -> Result<i64, StorageError> {
    let payload = payload.map(|p| p.to_string());
    conn.execute(
        "INSERT INTO change_queue (table_name, record_id, op, payload, snapshot_updated_at, enqueued_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            table.as_str(),
            record_id,
            op.to_string(),
            payload,
            format_ts(&snapshot_updated_at),
            format_ts(&Utc::now()),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Remove entries by sequence number. Returns the number removed.
pub fn acknowledge_in(conn: &Connection, seqs: &[i64]) -> Result<usize, StorageError> {
    if seqs.is_empty() {
        return Ok(0);
    }
    let placeholders = vec!["?"; seqs.len()].join(", ");
    let sql = format!("DELETE FROM change_queue WHERE seq IN ({placeholders})");
    let removed = conn.execute(&sql, params_from_iter(seqs.iter()))?;
    Ok(removed)
}

/// Pending entries for `table`, in sequence order.
pub fn drain_in(conn: &Connection, table: Table) -> Result<Vec<PendingChange>, StorageError> {
    let mut stmt = conn.prepare(
        "SELECT seq, table_name, record_id, op, payload, snapshot_updated_at, enqueued_at
         FROM change_queue WHERE table_name = ?1 ORDER BY seq",
    )?;
    let raw = stmt
        .query_map(params![table.as_str()], raw_row)?
        .collect::<Result<Vec<_>, _>>()?;
    raw.into_iter().map(RawEntry::into_change).collect()
}

struct RawEntry {
    seq: i64,
    table_name: String,
    record_id: String,
    op: String,
    payload: Option<String>,
    snapshot_updated_at: String,
    enqueued_at: String,
}

fn raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        seq: row.get(0)?,
        table_name: row.get(1)?,
        record_id: row.get(2)?,
        op: row.get(3)?,
        payload: row.get(4)?,
        snapshot_updated_at: row.get(5)?,
        enqueued_at: row.get(6)?,
    })
}

impl RawEntry {
    fn into_change(self) -> Result<PendingChange, StorageError> {
        let table: Table = self.table_name.parse()?;
        let malformed = |detail: String| {
            StorageError::Malformed(RecordError::InvalidShape {
                table: self.table_name.clone(),
                detail: format!("queue entry {}: {detail}", self.seq),
            })
        };
        let op = ChangeOp::from_str_val(&self.op)
            .ok_or_else(|| malformed(format!("unknown op '{}'", self.op)))?;
        let payload = self
            .payload
            .as_deref()
            .map(serde_json::from_str::<serde_json::Value>)
            .transpose()
            .map_err(|e| malformed(e.to_string()))?;
        let snapshot_updated_at = parse_ts(&self.snapshot_updated_at)
            .ok_or_else(|| malformed("bad snapshot timestamp".into()))?;
        let enqueued_at = parse_ts(&self.enqueued_at)
            .ok_or_else(|| malformed("bad enqueue timestamp".into()))?;

        Ok(PendingChange {
            seq: self.seq,
            table,
            record_id: self.record_id,
            op,
            payload,
            snapshot_updated_at,
            enqueued_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Database API
// ---------------------------------------------------------------------------

impl Database {
    /// Enqueue a mutation without touching the mirrored row.
    ///
    /// Application code normally goes through [`Database::save_local`], which
    /// writes the row and the entry together.
    pub fn enqueue(
        &self,
        table: Table,
        op: ChangeOp,
        record_id: &str,
        payload: Option<&serde_json::Value>,
        snapshot_updated_at: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        self.write_batch(table, |conn| {
            let seq = enqueue_in(conn, table, record_id, op, payload, snapshot_updated_at)?;
            debug!(table = %table, record_id, %op, seq, "enqueued change");
            Ok(seq)
        })
    }

    /// Pending entries for `table`, in sequence order. Entries stay queued
    /// until acknowledged.
    pub fn drain(&self, table: Table) -> Result<Vec<PendingChange>, StorageError> {
        let conn = self.conn();
        drain_in(&conn, table)
    }

    /// Remove entries after the remote confirmed them.
    pub fn acknowledge(&self, seqs: &[i64]) -> Result<usize, StorageError> {
        self.transaction(|conn| acknowledge_in(conn, seqs))
    }

    /// Pending entry count, for one table or all of them.
    pub fn count_pending(&self, table: Option<Table>) -> Result<i64, StorageError> {
        let conn = self.conn();
        let count = match table {
            Some(t) => conn.query_row(
                "SELECT COUNT(*) FROM change_queue WHERE table_name = ?1",
                params![t.as_str()],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM change_queue", [], |row| row.get(0))?,
        };
        Ok(count)
    }

    /// Oldest pending entries across all tables.
    pub fn list_pending(&self, limit: u32) -> Result<Vec<PendingChange>, StorageError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT seq, table_name, record_id, op, payload, snapshot_updated_at, enqueued_at
             FROM change_queue ORDER BY seq LIMIT ?1",
        )?;
        let raw = stmt
            .query_map(params![limit], raw_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawEntry::into_change).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn change(seq: i64, id: &str, op: ChangeOp, copies: i64) -> PendingChange {
        let base = parse_ts("2025-03-01T00:00:00Z").unwrap();
        PendingChange {
            seq,
            table: Table::Books,
            record_id: id.into(),
            op,
            payload: (op != ChangeOp::Delete).then(|| json!({ "id": id, "available_copies": copies })),
            snapshot_updated_at: base + Duration::seconds(seq),
            enqueued_at: base,
        }
    }

    #[test]
    fn test_enqueue_drain_acknowledge() {
        let db = setup_db();
        let ts = Utc::now();
        let s1 = db
            .enqueue(Table::Books, ChangeOp::Create, "b1", Some(&json!({"id": "b1"})), ts)
            .unwrap();
        let s2 = db
            .enqueue(Table::Books, ChangeOp::Delete, "b2", None, ts)
            .unwrap();
        db.enqueue(Table::Fines, ChangeOp::Update, "f1", Some(&json!({"id": "f1"})), ts)
            .unwrap();
        assert!(s1 < s2);

        let books = db.drain(Table::Books).unwrap();
        assert_eq!(books.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![s1, s2]);
        assert_eq!(books[0].payload, Some(json!({"id": "b1"})));
        assert_eq!(db.count_pending(None).unwrap(), 3);
        assert_eq!(db.count_pending(Some(Table::Fines)).unwrap(), 1);

        assert_eq!(db.acknowledge(&[s1, s2]).unwrap(), 2);
        assert!(db.drain(Table::Books).unwrap().is_empty());
        assert_eq!(db.acknowledge(&[]).unwrap(), 0);
        assert_eq!(db.list_pending(10).unwrap().len(), 1);
    }

    #[test]
    fn test_coalesce_create_then_updates() {
        let items = plan_push(
            vec![
                change(1, "b1", ChangeOp::Create, 5),
                change(2, "b1", ChangeOp::Update, 4),
                change(3, "b1", ChangeOp::Update, 3),
            ],
            PushMode::Coalesced,
        );
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].op, Some(ChangeOp::Create));
        assert_eq!(items[0].payload.as_ref().unwrap()["available_copies"], 3);
        assert_eq!(items[0].seqs, vec![1, 2, 3]);
        assert_eq!(items[0].snapshot_updated_at, change(3, "b1", ChangeOp::Update, 3).snapshot_updated_at);
    }

    #[test]
    fn test_coalesce_update_then_delete() {
        let items = plan_push(
            vec![change(1, "b1", ChangeOp::Update, 4), change(2, "b1", ChangeOp::Delete, 0)],
            PushMode::Coalesced,
        );
        assert_eq!(items[0].op, Some(ChangeOp::Delete));
        assert!(items[0].payload.is_none());
    }

    #[test]
    fn test_coalesce_create_then_delete_cancels_out() {
        let items = plan_push(
            vec![
                change(1, "b1", ChangeOp::Create, 4),
                change(2, "b1", ChangeOp::Update, 2),
                change(3, "b1", ChangeOp::Delete, 0),
            ],
            PushMode::Coalesced,
        );
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].op, None);
        assert_eq!(items[0].seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_coalesce_delete_then_recreate_is_update() {
        let items = plan_push(
            vec![change(1, "b1", ChangeOp::Delete, 0), change(2, "b1", ChangeOp::Create, 1)],
            PushMode::Coalesced,
        );
        assert_eq!(items[0].op, Some(ChangeOp::Update));
    }

    #[test]
    fn test_coalesce_preserves_first_seen_order() {
        let items = plan_push(
            vec![
                change(1, "b2", ChangeOp::Update, 1),
                change(2, "b1", ChangeOp::Update, 1),
                change(3, "b2", ChangeOp::Update, 2),
            ],
            PushMode::Coalesced,
        );
        let ids: Vec<&str> = items.iter().map(|i| i.record_id.as_str()).collect();
        assert_eq!(ids, vec!["b2", "b1"]);
    }

    #[test]
    fn test_ordered_mode_keeps_every_entry() {
        let items = plan_push(
            vec![
                change(1, "b1", ChangeOp::Create, 5),
                change(2, "b1", ChangeOp::Update, 4),
                change(3, "b1", ChangeOp::Delete, 0),
            ],
            PushMode::Ordered,
        );
        assert_eq!(items.len(), 3);
        assert_eq!(
            items.iter().map(|i| i.op).collect::<Vec<_>>(),
            vec![Some(ChangeOp::Create), Some(ChangeOp::Update), Some(ChangeOp::Delete)]
        );
    }
}

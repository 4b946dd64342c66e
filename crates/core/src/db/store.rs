//! Local Store: typed row access for the seven mirrored tables.
//!
//! The `*_in` functions operate on a borrowed connection so the synchronizer
//! can compose them with cursor and queue writes inside one transaction. The
//! methods on [`Database`] wrap them in a per-table batch.

use chrono::{DateTime, Duration, SubsecRound, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use tracing::debug;

use super::{queue, Database};
use crate::errors::{RecordError, StorageError};
use crate::models::{parse_ts, ChangeOp};
use crate::record::{Record, Table};

/// How an incoming row is reconciled with the stored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteRule {
    /// Skip the write unless the incoming `updated_at` is strictly newer.
    IfNewer,
    /// Always write. Used for conflict winners and local edits.
    Replace,
}

/// One operation in an atomic per-table batch.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Upsert(Record),
    Delete(String),
}

// ---------------------------------------------------------------------------
// Connection-level helpers
// ---------------------------------------------------------------------------

/// Fetch one record by id.
pub fn get_in(conn: &Connection, table: Table, id: &str) -> Result<Option<Record>, StorageError> {
    let sql = format!(
        "SELECT {} FROM {} WHERE id = ?1",
        table.columns().join(", "),
        table
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![id])?;
    match rows.next()? {
        Some(row) => {
            let mut record = Record::from_row(table, row)?;
            fill_derived(conn, &mut record)?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

/// Stored `updated_at` for `id`, if the row exists.
pub fn stored_updated_at(
    conn: &Connection,
    table: Table,
    id: &str,
) -> Result<Option<DateTime<Utc>>, StorageError> {
    let sql = format!("SELECT updated_at FROM {table} WHERE id = ?1");
    let raw: Option<String> = conn
        .query_row(&sql, params![id], |row| row.get(0))
        .optional()?;
    Ok(raw.as_deref().and_then(parse_ts))
}

/// Insert or update `record`. Returns `true` when the row changed.
pub fn upsert_in(conn: &Connection, record: &Record, rule: WriteRule) -> Result<bool, StorageError> {
    let table = record.table();

    if rule == WriteRule::IfNewer {
        if let Some(existing) = stored_updated_at(conn, table, record.id())? {
            if existing >= record.updated_at() {
                debug!(table = %table, id = record.id(), "skipping stale or duplicate upsert");
                return Ok(false);
            }
        }
    }

    let columns = table.columns();
    let placeholders = (1..=columns.len())
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ");
    let updates = columns
        .iter()
        .filter(|c| **c != "id")
        .map(|c| format!("{c} = excluded.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO {table} ({}) VALUES ({placeholders}) ON CONFLICT(id) DO UPDATE SET {updates}",
        columns.join(", ")
    );

    conn.execute(&sql, params_from_iter(record.column_values()?))?;
    Ok(true)
}

/// Delete a row. Returns `true` when a row was removed.
pub fn delete_in(conn: &Connection, table: Table, id: &str) -> Result<bool, StorageError> {
    let sql = format!("DELETE FROM {table} WHERE id = ?1");
    let removed = conn.execute(&sql, params![id])?;
    Ok(removed > 0)
}

fn fill_derived(conn: &Connection, record: &mut Record) -> Result<(), StorageError> {
    if let Record::Category(category) = record {
        category.book_count = conn.query_row(
            "SELECT COUNT(*) FROM books WHERE category_id = ?1",
            params![category.id],
            |row| row.get(0),
        )?;
    }
    Ok(())
}

/// A local timestamp strictly newer than whatever is stored for the row, at
/// the microsecond precision rows are stored with.
fn next_local_stamp(existing: Option<DateTime<Utc>>) -> DateTime<Utc> {
    let now = Utc::now().trunc_subsecs(6);
    match existing {
        Some(prev) if prev >= now => prev + Duration::microseconds(1),
        _ => now,
    }
}

// ---------------------------------------------------------------------------
// Database API
// ---------------------------------------------------------------------------

impl Database {
    /// Get one record by id.
    pub fn get_record(&self, table: Table, id: &str) -> Result<Option<Record>, StorageError> {
        let conn = self.conn();
        get_in(&conn, table, id)
    }

    /// Range-scan a table, ordered by `updated_at` then id.
    pub fn list_records(&self, table: Table) -> Result<Vec<Record>, StorageError> {
        let conn = self.conn();
        let sql = format!(
            "SELECT {} FROM {} ORDER BY updated_at, id",
            table.columns().join(", "),
            table
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = Record::from_row(table, row)?;
            fill_derived(&conn, &mut record)?;
            records.push(record);
        }
        Ok(records)
    }

    /// Count rows in a mirrored table.
    pub fn count_records(&self, table: Table) -> Result<i64, StorageError> {
        let conn = self.conn();
        let count = conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
            row.get(0)
        })?;
        Ok(count)
    }

    /// Idempotent upsert: a no-op unless `record` is strictly newer than the
    /// stored row.
    pub fn upsert_record(&self, record: &Record) -> Result<bool, StorageError> {
        self.write_batch(record.table(), |conn| {
            upsert_in(conn, record, WriteRule::IfNewer)
        })
    }

    /// Delete a row without queueing a remote delete.
    pub fn delete_record(&self, table: Table, id: &str) -> Result<bool, StorageError> {
        self.write_batch(table, |conn| delete_in(conn, table, id))
    }

    /// Apply a batch of upserts and deletes to one table atomically.
    ///
    /// Returns the number of rows that actually changed.
    pub fn apply_batch(&self, table: Table, ops: &[StoreOp]) -> Result<usize, StorageError> {
        self.write_batch(table, |conn| {
            let mut changed = 0;
            for op in ops {
                let did_change = match op {
                    StoreOp::Upsert(record) => {
                        if record.table() != table {
                            return Err(StorageError::Malformed(RecordError::InvalidShape {
                                table: table.to_string(),
                                detail: format!(
                                    "{} record {} in a {table} batch",
                                    record.table(),
                                    record.id()
                                ),
                            }));
                        }
                        upsert_in(conn, record, WriteRule::IfNewer)?
                    }
                    StoreOp::Delete(id) => delete_in(conn, table, id)?,
                };
                if did_change {
                    changed += 1;
                }
            }
            debug!(table = %table, ops = ops.len(), changed, "applied batch");
            Ok(changed)
        })
    }

    /// Drop cached rows of `table` that carry no pending local intent.
    /// Returns the number of rows removed.
    pub fn purge_synced(&self, table: Table) -> Result<usize, StorageError> {
        self.write_batch(table, |conn| {
            let sql = format!(
                "DELETE FROM {table} WHERE id NOT IN
                 (SELECT record_id FROM change_queue WHERE table_name = ?1)"
            );
            let removed = conn.execute(&sql, params![table.as_str()])?;
            debug!(table = %table, removed, "purged cached rows");
            Ok(removed)
        })
    }

    /// Save a record made by the application while (possibly) offline.
    ///
    /// Stamps a fresh `updated_at` (and a new id if the record has none),
    /// writes the row and enqueues the matching create or update in one
    /// transaction. Returns the stored record.
    pub fn save_local(&self, mut record: Record) -> Result<Record, StorageError> {
        record.assign_id_if_missing();
        record.validate()?;
        let table = record.table();

        self.write_batch(table, |conn| {
            let existing = stored_updated_at(conn, table, record.id())?;
            let stamp = next_local_stamp(existing);
            record.set_updated_at(stamp);

            let op = if existing.is_some() {
                ChangeOp::Update
            } else {
                ChangeOp::Create
            };
            upsert_in(conn, &record, WriteRule::Replace)?;
            let payload = record.to_value()?;
            let seq = queue::enqueue_in(conn, table, record.id(), op, Some(&payload), stamp)?;
            debug!(table = %table, id = record.id(), %op, seq, "saved local change");
            Ok(())
        })?;

        Ok(record)
    }

    /// Delete a record locally and enqueue the remote delete.
    pub fn delete_local(&self, table: Table, id: &str) -> Result<(), StorageError> {
        self.write_batch(table, |conn| {
            let existing =
                stored_updated_at(conn, table, id)?.ok_or_else(|| StorageError::NotFound {
                    entity: table.to_string(),
                    id: id.to_string(),
                })?;
            let stamp = next_local_stamp(Some(existing));
            delete_in(conn, table, id)?;
            let seq = queue::enqueue_in(conn, table, id, ChangeOp::Delete, None, stamp)?;
            debug!(table = %table, id, seq, "deleted local record");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Book, Category};

    fn setup_db() -> Database {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db
    }

    fn ts(s: &str) -> DateTime<Utc> {
        parse_ts(s).unwrap()
    }

    fn book(id: &str, available: i64, updated_at: &str) -> Record {
        Record::Book(Book {
            id: id.into(),
            title: "Weep Not, Child".into(),
            author: "Ngugi wa Thiong'o".into(),
            isbn: None,
            category_id: Some("cat1".into()),
            total_copies: 5,
            available_copies: available,
            created_at: ts("2025-01-01T00:00:00Z"),
            updated_at: ts(updated_at),
        })
    }

    fn available(db: &Database, id: &str) -> i64 {
        match db.get_record(Table::Books, id).unwrap() {
            Some(Record::Book(b)) => b.available_copies,
            other => panic!("expected book, got {other:?}"),
        }
    }

    #[test]
    fn test_upsert_is_idempotent_and_ignores_stale() {
        let db = setup_db();
        assert!(db.upsert_record(&book("b1", 3, "2025-01-02T00:00:00Z")).unwrap());
        assert!(!db.upsert_record(&book("b1", 3, "2025-01-02T00:00:00Z")).unwrap());
        assert!(!db.upsert_record(&book("b1", 1, "2025-01-01T12:00:00Z")).unwrap());
        assert_eq!(available(&db, "b1"), 3);

        assert!(db.upsert_record(&book("b1", 4, "2025-01-03T00:00:00Z")).unwrap());
        assert_eq!(available(&db, "b1"), 4);
        assert_eq!(db.count_records(Table::Books).unwrap(), 1);
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let db = setup_db();
        let mut broken = book("b2", 1, "2025-01-02T00:00:00Z");
        if let Record::Book(b) = &mut broken {
            b.available_copies = 9;
        }
        let ops = vec![
            StoreOp::Upsert(book("b1", 2, "2025-01-02T00:00:00Z")),
            StoreOp::Upsert(broken),
        ];
        assert!(db.apply_batch(Table::Books, &ops).is_err());
        assert_eq!(db.count_records(Table::Books).unwrap(), 0);

        let ops = vec![
            StoreOp::Upsert(book("b1", 2, "2025-01-02T00:00:00Z")),
            StoreOp::Upsert(book("b2", 2, "2025-01-02T00:00:00Z")),
            StoreOp::Delete("b1".into()),
        ];
        assert_eq!(db.apply_batch(Table::Books, &ops).unwrap(), 3);
        assert_eq!(db.count_records(Table::Books).unwrap(), 1);
    }

    #[test]
    fn test_batch_rejects_foreign_table_record() {
        let db = setup_db();
        let ops = vec![StoreOp::Upsert(book("b1", 2, "2025-01-02T00:00:00Z"))];
        let err = db.apply_batch(Table::Fines, &ops).unwrap_err();
        assert!(matches!(err, StorageError::Malformed(_)));
    }

    #[test]
    fn test_save_local_enqueues_create_then_update() {
        let db = setup_db();
        let saved = db.save_local(book("b1", 2, "2025-01-02T00:00:00Z")).unwrap();
        assert!(saved.updated_at() > ts("2025-01-02T00:00:00Z"));

        let again = db.save_local(book("b1", 1, "2020-01-01T00:00:00Z")).unwrap();
        assert!(again.updated_at() > saved.updated_at());
        assert_eq!(available(&db, "b1"), 1);

        let pending = db.drain(Table::Books).unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].op, ChangeOp::Create);
        assert_eq!(pending[1].op, ChangeOp::Update);
        assert_eq!(pending[1].snapshot_updated_at, again.updated_at());
        assert!(pending[0].seq < pending[1].seq);
    }

    #[test]
    fn test_local_stamps_match_stored_precision() {
        let db = setup_db();
        let mut previous = None;
        for available_copies in [5, 4, 3, 2, 1] {
            let saved = db
                .save_local(book("b1", available_copies, "2025-01-02T00:00:00Z"))
                .unwrap();
            let stamp = saved.updated_at();
            assert_eq!(stamp, stamp.trunc_subsecs(6));
            let stored = db.get_record(Table::Books, "b1").unwrap().unwrap();
            assert_eq!(stored.updated_at(), stamp);
            if let Some(previous) = previous {
                assert!(stamp > previous);
            }
            previous = Some(stamp);
        }

        let pending = db.drain(Table::Books).unwrap();
        let last = pending.last().unwrap();
        assert_eq!(Some(last.snapshot_updated_at), previous);
        assert_eq!(
            parse_ts(last.payload.as_ref().unwrap()["updated_at"].as_str().unwrap()),
            previous
        );
    }

    #[test]
    fn test_next_local_stamp_bumps_past_future_row() {
        let ahead = Utc::now().trunc_subsecs(6) + Duration::hours(1);
        assert_eq!(next_local_stamp(Some(ahead)), ahead + Duration::microseconds(1));
        let fresh = next_local_stamp(None);
        assert_eq!(fresh, fresh.trunc_subsecs(6));
    }

    #[test]
    fn test_save_local_assigns_id_to_new_record() {
        let db = setup_db();
        let saved = db.save_local(book("", 5, "2025-01-02T00:00:00Z")).unwrap();
        assert_eq!(saved.id().len(), 36);
        assert!(db.get_record(Table::Books, saved.id()).unwrap().is_some());

        let pending = db.drain(Table::Books).unwrap();
        assert_eq!(pending[0].record_id, saved.id());
        assert_eq!(pending[0].payload.as_ref().unwrap()["id"], saved.id());
    }

    #[test]
    fn test_save_local_rejects_invalid_record() {
        let db = setup_db();
        let mut broken = book("b1", 1, "2025-01-02T00:00:00Z");
        if let Record::Book(b) = &mut broken {
            b.available_copies = 6;
        }
        assert!(matches!(
            db.save_local(broken),
            Err(StorageError::Malformed(RecordError::InvariantViolation { .. }))
        ));
        assert_eq!(db.count_pending(None).unwrap(), 0);
    }

    #[test]
    fn test_delete_local() {
        let db = setup_db();
        db.upsert_record(&book("b1", 2, "2025-01-02T00:00:00Z")).unwrap();
        db.delete_local(Table::Books, "b1").unwrap();
        assert!(db.get_record(Table::Books, "b1").unwrap().is_none());

        let pending = db.drain(Table::Books).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].op, ChangeOp::Delete);
        assert!(pending[0].payload.is_none());
        assert!(pending[0].snapshot_updated_at > ts("2025-01-02T00:00:00Z"));

        assert!(matches!(
            db.delete_local(Table::Books, "b1"),
            Err(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn test_purge_keeps_rows_with_pending_intent() {
        let db = setup_db();
        db.upsert_record(&book("b1", 2, "2025-01-02T00:00:00Z")).unwrap();
        db.upsert_record(&book("b2", 2, "2025-01-02T00:00:00Z")).unwrap();
        db.save_local(book("b3", 1, "2025-01-02T00:00:00Z")).unwrap();

        assert_eq!(db.purge_synced(Table::Books).unwrap(), 2);
        assert!(db.get_record(Table::Books, "b3").unwrap().is_some());
        assert_eq!(db.count_records(Table::Books).unwrap(), 1);
    }

    #[test]
    fn test_category_book_count_is_derived() {
        let db = setup_db();
        db.upsert_record(&Record::Category(Category {
            id: "cat1".into(),
            name: "African Literature".into(),
            description: None,
            book_count: 99,
            created_at: ts("2025-01-01T00:00:00Z"),
            updated_at: ts("2025-01-01T00:00:00Z"),
        }))
        .unwrap();
        db.upsert_record(&book("b1", 2, "2025-01-02T00:00:00Z")).unwrap();
        db.upsert_record(&book("b2", 2, "2025-01-02T00:00:00Z")).unwrap();

        match db.get_record(Table::Categories, "cat1").unwrap() {
            Some(Record::Category(c)) => assert_eq!(c.book_count, 2),
            other => panic!("expected category, got {other:?}"),
        }
    }

    #[test]
    fn test_list_records_ordered_by_updated_at() {
        let db = setup_db();
        db.upsert_record(&book("b2", 2, "2025-01-03T00:00:00Z")).unwrap();
        db.upsert_record(&book("b1", 2, "2025-01-02T00:00:00Z")).unwrap();
        let ids: Vec<String> = db
            .list_records(Table::Books)
            .unwrap()
            .iter()
            .map(|r| r.id().to_string())
            .collect();
        assert_eq!(ids, vec!["b1", "b2"]);
    }
}

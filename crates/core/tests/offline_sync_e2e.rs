//! End-to-end tests for offline synchronization.
//!
//! These tests exercise the real `SyncEngine` with:
//! - A real SQLite database in a temporary data directory
//! - The in-memory remote, with injected outages, latency and per-table
//!   failures
//!
//! No network I/O.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tempfile::TempDir;

use shelfsync_core::config::{
    AppConfig, AuditConfig, DaemonConfig, PushMode, RemoteConfig, SyncConfig,
};
use shelfsync_core::db::Database;
use shelfsync_core::errors::RemoteError;
use shelfsync_core::models::{parse_ts, AuditEvent, ChangeOp, Severity, TableState};
use shelfsync_core::record::{classify_remote, Record, RemoteRow, Table};
use shelfsync_core::remote::{InMemoryRemote, PageKey, RemoteClient};
use shelfsync_core::sync_engine::SyncEngine;

// ===========================================================================
// Helpers
// ===========================================================================

const T0: &str = "2025-01-01T00:00:00Z";
const FUTURE: &str = "2030-01-01T00:00:00Z";

struct Harness {
    _dir: TempDir,
    db: Arc<Database>,
    remote: Arc<InMemoryRemote>,
    engine: SyncEngine,
}

fn harness() -> Harness {
    harness_with(|_| {})
}

fn harness_with(customize: impl FnOnce(&mut AppConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    customize(&mut config);

    let db = Arc::new(Database::new(config.database_path()).unwrap());
    db.initialize().unwrap();
    let remote = Arc::new(InMemoryRemote::new());
    let engine = SyncEngine::new(config, db.clone(), remote.clone()).unwrap();

    Harness {
        _dir: dir,
        db,
        remote,
        engine,
    }
}

fn test_config(dir: &TempDir) -> AppConfig {
    AppConfig {
        daemon: DaemonConfig {
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        },
        remote: RemoteConfig {
            url: "https://library.example.org".into(),
            api_key_env: "SHELFSYNC_API_KEY".into(),
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            api_key: None,
        },
        sync: SyncConfig {
            page_size: 2,
            max_attempts: 3,
            backoff_base_ms: 10,
            backoff_max_ms: 100,
            ..Default::default()
        },
        audit: AuditConfig::default(),
    }
}

fn book_json(id: &str, available: i64, updated_at: &str) -> Value {
    json!({
        "id": id,
        "title": "The River Between",
        "author": "Ngugi wa Thiong'o",
        "isbn": null,
        "category_id": null,
        "total_copies": 5,
        "available_copies": available,
        "created_at": T0,
        "updated_at": updated_at,
    })
}

fn fine_json(id: &str, updated_at: &str) -> Value {
    json!({
        "id": id,
        "borrowing_id": "br1",
        "student_id": "s1",
        "amount": 50.0,
        "reason": "late return",
        "status": "pending",
        "paid_date": null,
        "created_at": T0,
        "updated_at": updated_at,
    })
}

fn borrowing_json(id: &str, updated_at: &str) -> Value {
    json!({
        "id": id,
        "book_id": "book123",
        "student_id": "s1",
        "borrow_date": "2025-02-01",
        "due_date": "2025-02-15",
        "return_date": "2025-02-10",
        "status": "returned",
        "fine_amount": null,
        "created_at": T0,
        "updated_at": updated_at,
    })
}

fn book(value: Value) -> Record {
    Record::from_value(Table::Books, value).unwrap()
}

fn available(db: &Database, id: &str) -> Option<i64> {
    match db.get_record(Table::Books, id).unwrap() {
        Some(Record::Book(b)) => Some(b.available_copies),
        Some(other) => panic!("expected book, got {other:?}"),
        None => None,
    }
}

fn audit_actions(db: &Database, action: &str) -> Vec<shelfsync_core::models::AuditEntry> {
    db.list_audit(500, None)
        .unwrap()
        .into_iter()
        .filter(|e| e.event.action == action)
        .collect()
}

// ===========================================================================
// Conflict scenarios
// ===========================================================================

#[tokio::test]
async fn test_newer_local_update_wins_and_is_pushed() {
    let h = harness();
    h.db.upsert_record(&book(book_json("book123", 5, T0))).unwrap();
    let saved = h.db.save_local(book(book_json("book123", 2, T0))).unwrap();

    // Remote changed too, but earlier than the local edit.
    h.remote
        .put(Table::Books, book_json("book123", 5, "2025-06-01T00:00:00Z"));

    let report = h.engine.run_cycle().await.unwrap();
    let books = report.outcome(Table::Books).unwrap();
    assert_eq!(books.state, TableState::Idle);
    assert_eq!(books.conflicts, 1);
    assert_eq!(books.pushed, 1);

    assert_eq!(available(&h.db, "book123"), Some(2));
    assert_eq!(h.remote.get(Table::Books, "book123").unwrap()["available_copies"], 2);
    assert_eq!(h.db.count_pending(Some(Table::Books)).unwrap(), 0);

    let conflicts = audit_actions(&h.db, "conflict_resolved");
    assert_eq!(conflicts.len(), 1);
    let meta = conflicts[0].event.metadata.as_ref().unwrap();
    assert_eq!(meta["winner"], "local");
    assert_eq!(meta["local"]["record"]["available_copies"], 2);
    assert_eq!(meta["remote"]["record"]["available_copies"], 5);

    // The cursor tracks pulled rows only, never the pushed echo.
    let cursor = h.db.get_cursor(Table::Books).unwrap();
    assert_eq!(cursor.last_sync, parse_ts("2025-06-01T00:00:00Z"));
    assert!(cursor.last_sync.unwrap() < saved.updated_at());
}

#[tokio::test]
async fn test_newer_remote_update_wins_and_drops_local() {
    let h = harness();
    h.db.upsert_record(&book(book_json("book123", 5, T0))).unwrap();
    h.db.save_local(book(book_json("book123", 2, T0))).unwrap();
    h.remote.put(Table::Books, book_json("book123", 4, FUTURE));

    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.outcome(Table::Books).unwrap().conflicts, 1);

    assert_eq!(available(&h.db, "book123"), Some(4));
    assert_eq!(h.db.count_pending(Some(Table::Books)).unwrap(), 0);
    assert!(h.remote.writes().is_empty());

    let conflicts = audit_actions(&h.db, "conflict_resolved");
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].event.severity, Severity::Warning);
    let meta = conflicts[0].event.metadata.as_ref().unwrap();
    assert_eq!(meta["winner"], "remote");
    assert_eq!(meta["local"]["record"]["available_copies"], 2);
}

#[tokio::test]
async fn test_remote_update_resurrects_older_local_delete() {
    let h = harness();
    h.db.upsert_record(&book(book_json("book123", 5, T0))).unwrap();
    h.db.delete_local(Table::Books, "book123").unwrap();
    h.remote.put(Table::Books, book_json("book123", 3, FUTURE));

    h.engine.run_cycle().await.unwrap();

    assert_eq!(available(&h.db, "book123"), Some(3));
    assert_eq!(h.db.count_pending(None).unwrap(), 0);
    assert!(h.remote.get(Table::Books, "book123").is_some());
    let conflicts = audit_actions(&h.db, "conflict_resolved");
    assert_eq!(conflicts.len(), 1);
    assert!(conflicts[0].event.description.contains("resurrected"));
}

#[tokio::test]
async fn test_newer_local_delete_wins() {
    let h = harness();
    h.db.upsert_record(&book(book_json("book123", 5, T0))).unwrap();
    h.db.delete_local(Table::Books, "book123").unwrap();
    h.remote
        .put(Table::Books, book_json("book123", 3, "2025-06-01T00:00:00Z"));

    h.engine.run_cycle().await.unwrap();

    assert_eq!(available(&h.db, "book123"), None);
    assert!(h.remote.get(Table::Books, "book123").is_none());
    assert_eq!(
        h.remote.writes(),
        vec![(Table::Books, "book123".to_string(), ChangeOp::Delete)]
    );
}

#[tokio::test]
async fn test_stale_push_rejection_is_re_resolved() {
    let h = harness();
    h.db.upsert_record(&book(book_json("book123", 5, T0))).unwrap();
    // The cursor is already past the other client's write, so only the push
    // can discover it.
    h.db.advance_cursor(Table::Books, parse_ts("2031-01-01T00:00:00Z"), 0)
        .unwrap();
    h.remote.put(Table::Books, book_json("book123", 1, FUTURE));
    h.db.save_local(book(book_json("book123", 2, T0))).unwrap();

    let report = h.engine.run_cycle().await.unwrap();
    let books = report.outcome(Table::Books).unwrap();
    assert_eq!(books.state, TableState::Idle);
    assert_eq!(books.conflicts, 1);
    assert_eq!(books.pushed, 0);

    assert_eq!(available(&h.db, "book123"), Some(1));
    assert_eq!(h.db.count_pending(Some(Table::Books)).unwrap(), 0);
    assert_eq!(h.remote.get(Table::Books, "book123").unwrap()["available_copies"], 1);
    let conflicts = audit_actions(&h.db, "conflict_resolved");
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].event.severity, Severity::Warning);
}

/// The cursor is already past every remote write, so only a push can
/// discover the remote version of `book123`.
fn remote_only_visible_to_push(h: &Harness, remote_row: Value) {
    h.db.upsert_record(&book(book_json("book123", 5, T0))).unwrap();
    h.db.advance_cursor(Table::Books, parse_ts("2031-01-01T00:00:00Z"), 0)
        .unwrap();
    h.remote.put(Table::Books, remote_row);
    h.db.save_local(book(book_json("book123", 2, T0))).unwrap();
}

#[tokio::test]
async fn test_rejected_push_with_newer_local_is_pushed_again() {
    let h = harness();
    remote_only_visible_to_push(&h, book_json("book123", 5, T0));
    h.remote.reject_writes(Table::Books, "book123", 1);

    let report = h.engine.run_cycle().await.unwrap();
    let books = report.outcome(Table::Books).unwrap();
    assert_eq!(books.state, TableState::Idle);
    assert_eq!(books.conflicts, 1);
    assert_eq!(books.pushed, 1);
    assert_eq!(books.deferred, 0);

    assert_eq!(h.db.count_pending(Some(Table::Books)).unwrap(), 0);
    assert_eq!(h.remote.get(Table::Books, "book123").unwrap()["available_copies"], 2);
    let conflicts = audit_actions(&h.db, "conflict_resolved");
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].event.metadata.as_ref().unwrap()["winner"], "local");
}

#[tokio::test]
async fn test_push_rejected_twice_stays_queued() {
    let h = harness();
    remote_only_visible_to_push(&h, book_json("book123", 5, T0));
    h.remote.reject_writes(Table::Books, "book123", 2);

    let report = h.engine.run_cycle().await.unwrap();
    let books = report.outcome(Table::Books).unwrap();
    assert_eq!(books.state, TableState::Idle);
    assert!(books.error.is_none());
    assert_eq!(books.conflicts, 1);
    assert_eq!(books.pushed, 0);
    assert_eq!(books.deferred, 1);

    assert_eq!(h.db.count_pending(Some(Table::Books)).unwrap(), 1);
    assert_eq!(available(&h.db, "book123"), Some(2));
    assert_eq!(h.remote.get(Table::Books, "book123").unwrap()["available_copies"], 5);
    assert!(h.remote.writes().is_empty());
    assert_eq!(audit_actions(&h.db, "conflict_resolved").len(), 1);

    // The next cycle delivers it.
    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.outcome(Table::Books).unwrap().pushed, 1);
    assert_eq!(h.db.count_pending(Some(Table::Books)).unwrap(), 0);
    assert_eq!(h.remote.get(Table::Books, "book123").unwrap()["available_copies"], 2);
}

#[tokio::test]
async fn test_rejection_with_invalid_current_row_is_deferred() {
    let h = harness();
    // More copies available than exist: the remote row fails validation.
    remote_only_visible_to_push(&h, book_json("book123", 9, FUTURE));

    let report = h.engine.run_cycle().await.unwrap();
    let books = report.outcome(Table::Books).unwrap();
    assert_eq!(books.state, TableState::Idle);
    assert_eq!(books.conflicts, 0);
    assert_eq!(books.pushed, 0);
    assert_eq!(books.rejected, 1);
    assert_eq!(books.deferred, 1);

    assert_eq!(h.db.count_pending(Some(Table::Books)).unwrap(), 1);
    assert_eq!(available(&h.db, "book123"), Some(2));
    assert!(audit_actions(&h.db, "conflict_resolved").is_empty());
    let rejected = audit_actions(&h.db, "record_rejected");
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].event.metadata.as_ref().unwrap()["record_id"], "book123");
}

// ===========================================================================
// Cursor behaviour
// ===========================================================================

#[tokio::test]
async fn test_first_cycle_creates_fines_cursor() {
    let h = harness();
    assert!(h.db.list_cursors().unwrap().is_empty());
    h.remote.put(Table::Fines, fine_json("f1", "2025-03-01T00:00:00Z"));
    h.remote.put(Table::Fines, fine_json("f2", "2025-03-05T00:00:00Z"));
    h.remote.put(Table::Fines, fine_json("f3", "2025-03-03T00:00:00Z"));

    let report = h.engine.run_cycle().await.unwrap();
    let fines = report.outcome(Table::Fines).unwrap();
    assert_eq!(fines.pulled, 3);
    assert_eq!(fines.applied, 3);

    let cursor = h.db.get_cursor(Table::Fines).unwrap();
    assert_eq!(cursor.last_sync, parse_ts("2025-03-05T00:00:00Z"));
    assert_eq!(cursor.synced_records, 3);
    assert_eq!(h.db.count_records(Table::Fines).unwrap(), 3);
}

#[tokio::test]
async fn test_reapplying_pulled_rows_is_idempotent() {
    let h = harness();
    h.remote.put(Table::Fines, fine_json("f1", "2025-03-01T00:00:00Z"));
    h.remote.put(Table::Fines, fine_json("f2", "2025-03-05T00:00:00Z"));
    h.engine.run_cycle().await.unwrap();

    // Nothing new: nothing counted.
    h.engine.run_cycle().await.unwrap();
    let cursor = h.db.get_cursor(Table::Fines).unwrap();
    assert_eq!(cursor.synced_records, 0);
    assert_eq!(cursor.last_sync, parse_ts("2025-03-05T00:00:00Z"));

    // A rewound cursor re-pulls the same rows; they change nothing.
    h.db.reset_cursor(Table::Fines).unwrap();
    let report = h.engine.run_cycle().await.unwrap();
    let fines = report.outcome(Table::Fines).unwrap();
    assert_eq!(fines.pulled, 2);
    assert_eq!(fines.applied, 0);
    assert_eq!(h.db.count_records(Table::Fines).unwrap(), 2);
    assert_eq!(
        h.db.get_cursor(Table::Fines).unwrap().last_sync,
        parse_ts("2025-03-05T00:00:00Z")
    );
}

#[tokio::test]
async fn test_cursor_never_moves_backwards() {
    let h = harness();
    h.remote.put(Table::Books, book_json("b1", 5, "2025-03-05T00:00:00Z"));
    h.engine.run_cycle().await.unwrap();
    let first = h.db.get_cursor(Table::Books).unwrap().last_sync;

    // A late write stamped before the cursor is never pulled.
    h.remote.put(Table::Books, book_json("b2", 5, "2025-02-01T00:00:00Z"));
    h.engine.run_cycle().await.unwrap();
    let second = h.db.get_cursor(Table::Books).unwrap().last_sync;
    assert_eq!(second, first);

    h.remote.put(Table::Books, book_json("b3", 5, "2025-04-01T00:00:00Z"));
    h.engine.run_cycle().await.unwrap();
    let third = h.db.get_cursor(Table::Books).unwrap().last_sync;
    assert!(third > second);
}

#[tokio::test]
async fn test_reset_table_forces_full_resync() {
    let h = harness();
    for (id, at) in [("b1", "2025-03-01T00:00:00Z"), ("b2", "2025-03-02T00:00:00Z")] {
        h.remote.put(Table::Books, book_json(id, 5, at));
    }
    h.engine.run_cycle().await.unwrap();
    assert_eq!(h.db.count_records(Table::Books).unwrap(), 2);

    assert_eq!(h.engine.reset_table(Table::Books).await.unwrap(), 2);
    assert_eq!(h.db.count_records(Table::Books).unwrap(), 0);
    assert!(h.db.get_cursor(Table::Books).unwrap().last_sync.is_none());

    h.engine.run_cycle().await.unwrap();
    assert_eq!(h.db.count_records(Table::Books).unwrap(), 2);
    assert_eq!(h.db.get_cursor(Table::Books).unwrap().synced_records, 2);
}

/// Delegates to an [`InMemoryRemote`], and the first time a page of books
/// is served another client edits book "a", moving it to the end of the
/// fetch order.
struct EditDuringPull {
    inner: Arc<InMemoryRemote>,
    edited: AtomicBool,
}

#[async_trait]
impl RemoteClient for EditDuringPull {
    async fn fetch_page(
        &self,
        table: Table,
        since: Option<DateTime<Utc>>,
        after: Option<&PageKey>,
        limit: usize,
    ) -> Result<Vec<Value>, RemoteError> {
        let page = self.inner.fetch_page(table, since, after, limit).await?;
        if table == Table::Books && !self.edited.swap(true, Ordering::SeqCst) {
            self.inner
                .put(Table::Books, book_json("a", 1, "2025-01-05T00:00:00Z"));
        }
        Ok(page)
    }

    async fn insert(&self, table: Table, payload: &Value) -> Result<Value, RemoteError> {
        self.inner.insert(table, payload).await
    }

    async fn update(
        &self,
        table: Table,
        id: &str,
        payload: &Value,
        snapshot: DateTime<Utc>,
    ) -> Result<Value, RemoteError> {
        self.inner.update(table, id, payload, snapshot).await
    }

    async fn delete(
        &self,
        table: Table,
        id: &str,
        snapshot: DateTime<Utc>,
    ) -> Result<(), RemoteError> {
        self.inner.delete(table, id, snapshot).await
    }

    async fn log_system_event(&self, event: &AuditEvent) -> Result<String, RemoteError> {
        self.inner.log_system_event(event).await
    }

    async fn clean_duplicate_logs(&self) -> Result<(), RemoteError> {
        self.inner.clean_duplicate_logs().await
    }

    async fn check_connectivity(&self) -> bool {
        self.inner.check_connectivity().await
    }
}

#[tokio::test]
async fn test_row_edited_between_pages_hides_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    config.sync.tables = vec!["books".into()];
    let db = Arc::new(Database::new(config.database_path()).unwrap());
    db.initialize().unwrap();

    let inner = Arc::new(InMemoryRemote::new());
    for (id, day) in [("a", 1), ("b", 2), ("c", 3), ("d", 4)] {
        inner.put(
            Table::Books,
            book_json(id, 5, &format!("2025-01-0{day}T00:00:00Z")),
        );
    }
    let remote = Arc::new(EditDuringPull {
        inner,
        edited: AtomicBool::new(false),
    });
    let engine = SyncEngine::new(config, db.clone(), remote).unwrap();

    let report = engine.run_cycle().await.unwrap();
    assert_eq!(report.outcome(Table::Books).unwrap().pulled, 5);
    for id in ["a", "b", "c", "d"] {
        assert!(available(&db, id).is_some(), "book {id} was never pulled");
    }
    assert_eq!(available(&db, "a"), Some(1));
    assert_eq!(
        db.get_cursor(Table::Books).unwrap().last_sync,
        parse_ts("2025-01-05T00:00:00Z")
    );
}

// ===========================================================================
// Failure isolation and retries
// ===========================================================================

#[tokio::test(start_paused = true)]
async fn test_borrowings_failure_leaves_books_untouched() {
    let h = harness();
    h.remote.put(Table::Books, book_json("book123", 4, "2025-03-01T00:00:00Z"));
    h.remote.put(Table::Borrowings, borrowing_json("br1", "2025-03-02T00:00:00Z"));
    h.engine.run_cycle().await.unwrap();
    let books_before = h.db.get_cursor(Table::Books).unwrap().last_sync;

    h.remote.put(Table::Borrowings, borrowing_json("br2", "2025-03-04T00:00:00Z"));
    h.remote.set_table_failing(Table::Borrowings, true);

    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.failed_tables(), vec![Table::Borrowings]);
    assert_eq!(h.db.get_cursor(Table::Books).unwrap().last_sync, books_before);
    assert_eq!(
        h.db.get_cursor(Table::Borrowings).unwrap().last_sync,
        parse_ts("2025-03-02T00:00:00Z")
    );

    let status = h.engine.get_status().unwrap();
    let borrowings = status
        .tables
        .iter()
        .find(|t| t.table == "borrowings")
        .unwrap();
    assert_eq!(borrowings.state, TableState::Failed);
    assert!(borrowings.last_error.as_deref().unwrap().contains("3 attempts"));
    assert_eq!(audit_actions(&h.db, "sync_failed").len(), 1);

    h.remote.set_table_failing(Table::Borrowings, false);
    let report = h.engine.run_cycle().await.unwrap();
    assert!(report.failed_tables().is_empty());
    assert_eq!(h.db.count_records(Table::Borrowings).unwrap(), 2);
    let status = h.engine.get_status().unwrap();
    assert!(status.tables.iter().all(|t| t.last_error.is_none()));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried() {
    let h = harness();
    h.remote.put(Table::Books, book_json("b1", 5, "2025-03-01T00:00:00Z"));
    h.remote.fail_next(2);

    let report = h.engine.run_cycle().await.unwrap();
    assert!(report.failed_tables().is_empty());
    assert_eq!(h.db.count_records(Table::Books).unwrap(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_offline_cycle_fails_then_catches_up() {
    let h = harness();
    h.remote.set_offline(true);

    // The local store stays fully usable while offline.
    h.db.save_local(book(book_json("b1", 3, T0))).unwrap();

    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.failed_tables().len(), Table::COUNT);
    assert!(h.db.get_cursor(Table::Books).unwrap().last_sync.is_none());
    assert_eq!(h.db.count_pending(None).unwrap(), 1);
    assert_eq!(available(&h.db, "b1"), Some(3));
    assert!(h.db.count_unforwarded_audit().unwrap() > 0);

    h.remote.set_offline(false);
    let report = h.engine.run_cycle().await.unwrap();
    assert!(report.failed_tables().is_empty());
    assert_eq!(h.db.count_pending(None).unwrap(), 0);
    assert_eq!(h.remote.get(Table::Books, "b1").unwrap()["available_copies"], 3);

    let maintenance = h.engine.run_audit_maintenance().await.unwrap();
    assert!(maintenance.remote_cleaned);
    assert_eq!(h.db.count_unforwarded_audit().unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_cycle_keeps_cursor() {
    let h = harness_with(|c| c.sync.tables = vec!["books".into()]);
    for i in 0..6 {
        h.remote.put(
            Table::Books,
            book_json(&format!("b{i}"), 5, &format!("2025-03-0{}T00:00:00Z", i + 1)),
        );
    }
    h.remote.set_latency(Some(Duration::from_millis(100)));

    let engine = h.engine.clone();
    let cycle = tokio::spawn(async move { engine.run_cycle().await });
    tokio::time::sleep(Duration::from_millis(150)).await;
    h.engine.cancel();

    let report = cycle.await.unwrap().unwrap();
    let books = report.outcome(Table::Books).unwrap();
    assert_eq!(books.error.as_deref(), Some("cancelled"));
    assert!(h.db.get_cursor(Table::Books).unwrap().last_sync.is_none());
    assert_eq!(h.db.count_records(Table::Books).unwrap(), 0);

    h.remote.set_latency(None);
    h.engine.run_cycle().await.unwrap();
    assert_eq!(h.db.count_records(Table::Books).unwrap(), 6);
}

// ===========================================================================
// Remote shapes and push planning
// ===========================================================================

#[tokio::test]
async fn test_remote_tombstone_deletes_local_row() {
    let h = harness();
    h.remote.put(Table::Books, book_json("b1", 5, "2025-03-01T00:00:00Z"));
    h.engine.run_cycle().await.unwrap();
    assert!(available(&h.db, "b1").is_some());

    let mut deleted = book_json("b1", 5, "2025-03-02T00:00:00Z");
    deleted["deleted_at"] = json!("2025-03-02T00:00:00Z");
    h.remote.put(Table::Books, deleted);
    let report = h.engine.run_cycle().await.unwrap();

    assert_eq!(report.outcome(Table::Books).unwrap().applied, 1);
    assert_eq!(available(&h.db, "b1"), None);
}

#[tokio::test]
async fn test_newer_local_edit_beats_remote_tombstone() {
    let h = harness();
    h.db.upsert_record(&book(book_json("b1", 5, T0))).unwrap();
    h.db.save_local(book(book_json("b1", 2, T0))).unwrap();

    let mut deleted = book_json("b1", 5, "2025-03-02T00:00:00Z");
    deleted["deleted_at"] = json!("2025-03-02T00:00:00Z");
    h.remote.put(Table::Books, deleted);

    h.engine.run_cycle().await.unwrap();
    assert_eq!(available(&h.db, "b1"), Some(2));
    let remote_row = h.remote.get(Table::Books, "b1").unwrap();
    assert_eq!(remote_row["available_copies"], 2);
    assert!(remote_row["deleted_at"].is_null());

    // Other clients pulling the row now see it live again.
    match classify_remote(Table::Books, remote_row).unwrap() {
        RemoteRow::Upsert(record) => assert_eq!(record.id(), "b1"),
        other => panic!("expected a live row, got {other:?}"),
    }
}

#[tokio::test]
async fn test_offline_create_then_delete_sends_nothing() {
    let h = harness();
    h.db.save_local(book(book_json("b1", 5, T0))).unwrap();
    h.db.save_local(book(book_json("b1", 4, T0))).unwrap();
    h.db.delete_local(Table::Books, "b1").unwrap();

    h.engine.run_cycle().await.unwrap();
    assert!(h.remote.writes().is_empty());
    assert_eq!(h.db.count_pending(None).unwrap(), 0);
}

#[tokio::test]
async fn test_ordered_mode_pushes_every_entry() {
    let h = harness_with(|c| c.sync.push_mode = PushMode::Ordered);
    h.db.save_local(book(book_json("b1", 5, T0))).unwrap();
    h.db.save_local(book(book_json("b1", 4, T0))).unwrap();

    let report = h.engine.run_cycle().await.unwrap();
    assert_eq!(report.outcome(Table::Books).unwrap().pushed, 2);
    assert_eq!(
        h.remote.writes(),
        vec![
            (Table::Books, "b1".to_string(), ChangeOp::Create),
            (Table::Books, "b1".to_string(), ChangeOp::Update),
        ]
    );
    assert_eq!(h.remote.get(Table::Books, "b1").unwrap()["available_copies"], 4);
}

#[tokio::test]
async fn test_invalid_remote_rows_are_skipped() {
    let h = harness();
    h.remote.put(Table::Books, book_json("good", 3, "2025-03-01T00:00:00Z"));
    h.remote.put(Table::Books, book_json("broken", 9, "2025-03-02T00:00:00Z"));

    let report = h.engine.run_cycle().await.unwrap();
    let books = report.outcome(Table::Books).unwrap();
    assert_eq!(books.state, TableState::Idle);
    assert_eq!(books.pulled, 2);
    assert_eq!(books.rejected, 1);
    assert_eq!(books.applied, 1);
    assert_eq!(
        h.db.get_cursor(Table::Books).unwrap().last_sync,
        parse_ts("2025-03-02T00:00:00Z")
    );

    let rejected = audit_actions(&h.db, "record_rejected");
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].event.severity, Severity::Error);

    for record in h.db.list_records(Table::Books).unwrap() {
        if let Record::Book(b) = record {
            assert!(b.available_copies >= 0 && b.available_copies <= b.total_copies);
        }
    }
}

//! Offline synchronization engine.
//!
//! The [`SyncEngine`] drives one cycle per mirrored table through the state
//! machine `Idle -> Pulling -> Resolving -> Pushing -> Advancing -> Idle`,
//! with `Failed` reachable from any state:
//!
//! 1. Pull remote rows newer than the table cursor, page by page.
//! 2. Resolve pulled rows that collide with pending local mutations.
//! 3. Push the surviving local mutations, acknowledging each on success and
//!    re-resolving stale-version rejections.
//! 4. Apply the pulled batch, record conflict audits, drop losing queue
//!    entries and advance the cursor in one transaction.
//!
//! Tables run concurrently on a bounded worker pool and fail independently.
//! A lock mechanism prevents concurrent sync cycles.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::audit::{AuditLogger, MaintenanceReport};
use crate::config::AppConfig;
use crate::conflict::{Conflict, ConflictResolver, LocalVersion, Winner};
use crate::db::queries::insert_audit_in;
use crate::db::queue::{self, plan_push, PushItem};
use crate::db::store::{delete_in, stored_updated_at, upsert_in, WriteRule};
use crate::db::{cursor, Database};
use crate::errors::{ConfigError, RecordError, RemoteError, StorageError, SyncError};
use crate::models::{
    format_ts, parse_ts, AuditEvent, ChangeOp, PendingChange, Severity, SyncStatus, TableState,
    TableStatus,
};
use crate::record::{classify_remote, value_updated_at, RemoteRow, Table};
use crate::remote::{PageKey, RemoteClient};
use crate::retry::{retry_async, RetryPolicy};

const COMPONENT: &str = "synchronizer";

// ---------------------------------------------------------------------------
// Cycle reporting
// ---------------------------------------------------------------------------

/// What one table's cycle did.
#[derive(Debug, Clone, PartialEq)]
pub struct TableOutcome {
    pub table: Table,
    /// `Idle` after a completed cycle, `Failed` otherwise.
    pub state: TableState,
    /// Remote rows fetched.
    pub pulled: usize,
    /// Local rows changed by the pulled batch; stored as `synced_records`.
    pub applied: usize,
    /// Remote operations confirmed.
    pub pushed: usize,
    /// Conflicts resolved, during pull or after a push rejection.
    pub conflicts: usize,
    /// Remote rows skipped because they failed classification.
    pub rejected: usize,
    /// Queue entries left pending after a repeated stale-version rejection.
    pub deferred: usize,
    /// Cursor after the cycle.
    pub last_sync: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl TableOutcome {
    fn new(table: Table) -> Self {
        Self {
            table,
            state: TableState::Idle,
            pulled: 0,
            applied: 0,
            pushed: 0,
            conflicts: 0,
            rejected: 0,
            deferred: 0,
            last_sync: None,
            error: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.state == TableState::Failed
    }

    fn had_activity(&self) -> bool {
        self.applied + self.pushed + self.conflicts + self.rejected + self.deferred > 0
    }
}

/// Per-table outcomes of one sync cycle, in table order.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub outcomes: Vec<TableOutcome>,
}

impl CycleReport {
    pub fn outcome(&self, table: Table) -> Option<&TableOutcome> {
        self.outcomes.iter().find(|o| o.table == table)
    }

    pub fn failed_tables(&self) -> Vec<Table> {
        self.outcomes
            .iter()
            .filter(|o| o.is_failed())
            .map(|o| o.table)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Internal pass results
// ---------------------------------------------------------------------------

#[derive(Default)]
struct PulledBatch {
    rows: Vec<RemoteRow>,
    /// Latest `updated_at` among every fetched row, classified or not.
    max_seen: Option<DateTime<Utc>>,
    fetched: usize,
    invalid: Vec<RecordError>,
}

/// A conflict the remote won, committed during Advancing.
struct RemoteWin {
    row: RemoteRow,
    local_updated_at: DateTime<Utc>,
    audit: AuditEvent,
}

#[derive(Default)]
struct ResolvedBatch {
    /// Pulled rows with no pending local mutation.
    apply: Vec<RemoteRow>,
    remote_wins: Vec<RemoteWin>,
    local_wins: Vec<AuditEvent>,
    /// Queue entries of records the remote won.
    dropped: Vec<i64>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The offline sync engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncEngine {
    config: Arc<AppConfig>,
    db: Arc<Database>,
    remote: Arc<dyn RemoteClient>,
    audit: Arc<AuditLogger>,
    tables: Arc<Vec<Table>>,
    policy: RetryPolicy,
    /// Atomic flag preventing concurrent sync cycles.
    running: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
}

impl SyncEngine {
    /// Create an engine over an initialized database and a remote client.
    pub fn new(
        config: AppConfig,
        db: Arc<Database>,
        remote: Arc<dyn RemoteClient>,
    ) -> Result<Self, ConfigError> {
        let tables = config.sync.table_list()?;
        let policy = RetryPolicy::from_config(&config.sync, config.remote.request_timeout());
        let audit = AuditLogger::new(db.clone(), Some(remote.clone()), &config.audit);
        info!(tables = tables.len(), push_mode = %config.sync.push_mode, "initializing sync engine");
        Ok(Self {
            config: Arc::new(config),
            db,
            remote,
            audit: Arc::new(audit),
            tables: Arc::new(tables),
            policy,
            running: Arc::new(AtomicBool::new(false)),
            cancelled: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    /// Check if a sync cycle is currently running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the running cycle to stop at its next checkpoint (between pages
    /// and between pushed entries). Cursors stay where they were.
    pub fn cancel(&self) {
        if self.is_running() {
            info!("sync cancellation requested");
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    pub async fn check_connectivity(&self) -> bool {
        self.remote.check_connectivity().await
    }

    pub async fn run_audit_maintenance(&self) -> Result<MaintenanceReport, SyncError> {
        Ok(self.audit.run_maintenance().await?)
    }

    fn acquire(&self) -> Result<SyncLockGuard, SyncError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let started_at = self
                .db
                .get_state("cycle_started_at")
                .ok()
                .flatten()
                .unwrap_or_else(|| "unknown".into());
            return Err(SyncError::AlreadyRunning { started_at });
        }
        Ok(SyncLockGuard(self.running.clone()))
    }

    // -----------------------------------------------------------------------
    // Main entry point
    // -----------------------------------------------------------------------

    /// Execute one sync cycle over every configured table.
    ///
    /// Per-table failures are reported in the returned [`CycleReport`]; the
    /// call itself only fails when another cycle is already running.
    pub async fn run_cycle(&self) -> Result<CycleReport, SyncError> {
        let _guard = self.acquire()?;
        self.cancelled.store(false, Ordering::SeqCst);

        let started_at = Utc::now();
        if let Err(e) = self.db.set_state("cycle_started_at", &format_ts(&started_at)) {
            warn!(error = %e, "failed to record cycle start");
        }

        let semaphore = Arc::new(Semaphore::new(self.config.sync.max_concurrent_tables.max(1)));
        let mut tasks = JoinSet::new();
        for &table in self.tables.iter() {
            let engine = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                engine.sync_table(table).await
            });
        }

        let mut outcomes = Vec::with_capacity(self.tables.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "table sync task did not complete"),
            }
        }

        // A task that panicked left no outcome behind.
        for &table in self.tables.iter() {
            if !outcomes.iter().any(|o| o.table == table) {
                let err = SyncError::TaskAborted {
                    table: table.to_string(),
                    detail: "task panicked or was aborted".into(),
                };
                let mut outcome = TableOutcome::new(table);
                self.record_failure(table, &err, &mut outcome).await;
                outcomes.push(outcome);
            }
        }
        outcomes.sort_by_key(|o| o.table);

        let completed_at = Utc::now();
        if let Err(e) = self.db.set_state("last_cycle_at", &format_ts(&completed_at)) {
            warn!(error = %e, "failed to record cycle completion");
        }

        let report = CycleReport {
            started_at,
            completed_at,
            outcomes,
        };
        info!(
            tables = report.outcomes.len(),
            failed = report.failed_tables().len(),
            pushed = report.outcomes.iter().map(|o| o.pushed).sum::<usize>(),
            applied = report.outcomes.iter().map(|o| o.applied).sum::<usize>(),
            "sync cycle completed"
        );
        Ok(report)
    }

    /// Full resync of one table: rewind its cursor and drop cached rows that
    /// have no pending local intent. Returns the number of rows purged.
    pub async fn reset_table(&self, table: Table) -> Result<usize, SyncError> {
        let _guard = self.acquire()?;
        self.db.reset_cursor(table)?;
        let purged = self.db.purge_synced(table)?;
        self.audit
            .log_event(
                "table_reset",
                &format!("{table}: cursor reset, {purged} cached rows purged"),
                Severity::Info,
                COMPONENT,
                Some(json!({ "table": table.as_str(), "purged": purged })),
            )
            .await?;
        Ok(purged)
    }

    /// Status summary across the configured tables.
    pub fn get_status(&self) -> Result<SyncStatus, SyncError> {
        Ok(collect_status(&self.db, &self.tables, self.is_running())?)
    }

    // -----------------------------------------------------------------------
    // Per-table cycle
    // -----------------------------------------------------------------------

    async fn sync_table(&self, table: Table) -> TableOutcome {
        let mut outcome = TableOutcome::new(table);
        match self.run_table(table, &mut outcome).await {
            Ok(()) => {
                self.settle(table, TableState::Idle, None);
                if outcome.had_activity() {
                    let description = format!(
                        "{table}: applied {} of {} pulled, pushed {}, {} conflicts",
                        outcome.applied, outcome.pulled, outcome.pushed, outcome.conflicts
                    );
                    let metadata = json!({
                        "table": table.as_str(),
                        "pulled": outcome.pulled,
                        "applied": outcome.applied,
                        "pushed": outcome.pushed,
                        "conflicts": outcome.conflicts,
                        "rejected": outcome.rejected,
                        "deferred": outcome.deferred,
                    });
                    self.log_best_effort(
                        AuditEvent::new("table_synced", description, Severity::Success, COMPONENT)
                            .with_metadata(metadata),
                    )
                    .await;
                }
            }
            Err(SyncError::Cancelled { .. }) => {
                info!(table = %table, "table sync cancelled");
                outcome.error = Some("cancelled".into());
                self.settle(table, TableState::Idle, Some("cancelled"));
                self.log_best_effort(AuditEvent::new(
                    "sync_cancelled",
                    format!("{table}: cycle cancelled, cursor unchanged"),
                    Severity::Warning,
                    COMPONENT,
                ))
                .await;
            }
            Err(e) => self.record_failure(table, &e, &mut outcome).await,
        }
        outcome
    }

    async fn record_failure(&self, table: Table, err: &SyncError, outcome: &mut TableOutcome) {
        let message = err.to_string();
        warn!(table = %table, error = %message, "table sync failed");
        outcome.state = TableState::Failed;
        outcome.error = Some(message.clone());
        self.settle(table, TableState::Failed, Some(&message));
        self.log_best_effort(
            AuditEvent::new(
                "sync_failed",
                format!("{table}: {message}"),
                Severity::Error,
                COMPONENT,
            )
            .with_metadata(json!({ "table": table.as_str(), "error": message })),
        )
        .await;
    }

    async fn run_table(&self, table: Table, outcome: &mut TableOutcome) -> Result<(), SyncError> {
        // 1. Pulling
        self.enter(table, TableState::Pulling)?;
        let start = self.db.get_cursor(table)?;
        outcome.last_sync = start.last_sync;
        let pulled = self.pull(table, start.last_sync).await?;
        outcome.pulled = pulled.fetched;
        outcome.rejected = pulled.invalid.len();
        for err in &pulled.invalid {
            self.log_best_effort(
                AuditEvent::new("record_rejected", err.to_string(), Severity::Error, COMPONENT)
                    .with_metadata(json!({ "table": table.as_str() })),
            )
            .await;
        }

        // 2. Resolving
        self.enter(table, TableState::Resolving)?;
        let pending = self.db.drain(table)?;
        let resolved = resolve(table, pulled.rows, &pending);
        outcome.conflicts = resolved.remote_wins.len() + resolved.local_wins.len();
        // A local winner is committed by the push below, so its audit goes first.
        for event in &resolved.local_wins {
            self.audit.record(event).await?;
        }

        // 3. Pushing
        self.enter(table, TableState::Pushing)?;
        let dropped: HashSet<i64> = resolved.dropped.iter().copied().collect();
        let to_push: Vec<PendingChange> = pending
            .into_iter()
            .filter(|e| !dropped.contains(&e.seq))
            .collect();
        self.push(table, to_push, outcome).await?;
        self.checkpoint(table)?;

        // 4. Advancing
        self.enter(table, TableState::Advancing)?;
        let ResolvedBatch {
            apply,
            remote_wins,
            dropped,
            ..
        } = resolved;
        let max_seen = pulled.max_seen;
        let (applied, audit_rows, cursor) = self.db.write_batch(table, |conn| {
            let mut audit_rows = Vec::with_capacity(remote_wins.len());
            let mut changed = 0usize;
            for win in &remote_wins {
                audit_rows.push((insert_audit_in(conn, &win.audit)?, win.audit.clone()));
                if apply_remote_winner(conn, table, &win.row, win.local_updated_at)? {
                    changed += 1;
                }
            }
            for row in &apply {
                if apply_remote(conn, table, row, WriteRule::IfNewer)? {
                    changed += 1;
                }
            }
            queue::acknowledge_in(conn, &dropped)?;
            let cursor = cursor::advance_cursor_in(conn, table, max_seen, changed as i64)?;
            Ok((changed, audit_rows, cursor))
        })?;

        for (id, event) in &audit_rows {
            self.audit.publish(*id, event).await;
        }
        outcome.applied = applied;
        outcome.last_sync = cursor.last_sync;
        debug!(
            table = %table,
            applied,
            last_sync = ?cursor.last_sync,
            "cursor advanced"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Pull
    // -----------------------------------------------------------------------

    async fn pull(
        &self,
        table: Table,
        since: Option<DateTime<Utc>>,
    ) -> Result<PulledBatch, SyncError> {
        let page_size = self.config.sync.page_size.max(1);
        let op_name = format!("fetch {table}");
        let mut batch = PulledBatch::default();
        let mut after: Option<PageKey> = None;

        loop {
            self.checkpoint(table)?;
            let page = retry_async(&op_name, &self.policy, || {
                self.remote.fetch_page(table, since, after.as_ref(), page_size)
            })
            .await?;
            let count = page.len();
            let next = page.last().and_then(PageKey::from_row);

            for value in page {
                if let Some(ts) = value_updated_at(&value) {
                    batch.max_seen = Some(batch.max_seen.map_or(ts, |seen| seen.max(ts)));
                }
                match classify_remote(table, value) {
                    Ok(row) => batch.rows.push(row),
                    Err(e) => {
                        warn!(table = %table, error = %e, "skipping malformed remote row");
                        batch.invalid.push(e);
                    }
                }
            }
            batch.fetched += count;
            debug!(table = %table, page = count, total = batch.fetched, "pulled page");

            if count < page_size {
                break;
            }
            match next {
                Some(key) => after = Some(key),
                None => {
                    warn!(table = %table, "page ended on a row without id or updated_at, stopping pull");
                    break;
                }
            }
        }
        Ok(batch)
    }

    // -----------------------------------------------------------------------
    // Push
    // -----------------------------------------------------------------------

    async fn push(
        &self,
        table: Table,
        entries: Vec<PendingChange>,
        outcome: &mut TableOutcome,
    ) -> Result<(), SyncError> {
        for item in plan_push(entries, self.config.sync.push_mode) {
            self.checkpoint(table)?;

            let Some(op) = item.op else {
                // Created and deleted before the remote ever saw it.
                self.db.acknowledge(&item.seqs)?;
                debug!(table = %table, record_id = %item.record_id, "local create and delete cancelled out");
                continue;
            };

            match self.push_item(table, &item, op).await {
                Ok(echo) => self.confirm(table, &item, echo, outcome)?,
                Err(SyncError::Remote(RemoteError::Rejected { current, .. })) => {
                    self.handle_rejection(table, &item, op, current, outcome)
                        .await?
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn push_item(
        &self,
        table: Table,
        item: &PushItem,
        op: ChangeOp,
    ) -> Result<Option<Value>, SyncError> {
        let op_name = format!("{op} {table}/{}", item.record_id);
        let payload = || {
            item.payload.as_ref().ok_or_else(|| {
                SyncError::Storage(StorageError::Malformed(RecordError::InvalidShape {
                    table: table.to_string(),
                    detail: format!("queued {op} of {} has no payload", item.record_id),
                }))
            })
        };

        match op {
            ChangeOp::Create => {
                let payload = payload()?;
                let echo = retry_async(&op_name, &self.policy, || {
                    self.remote.insert(table, payload)
                })
                .await?;
                Ok(Some(echo))
            }
            ChangeOp::Update => {
                let payload = payload()?;
                let echo = retry_async(&op_name, &self.policy, || {
                    self.remote
                        .update(table, &item.record_id, payload, item.snapshot_updated_at)
                })
                .await?;
                Ok(Some(echo))
            }
            ChangeOp::Delete => {
                retry_async(&op_name, &self.policy, || {
                    self.remote
                        .delete(table, &item.record_id, item.snapshot_updated_at)
                })
                .await?;
                Ok(None)
            }
        }
    }

    /// Acknowledge a confirmed push and keep the remote echo locally. The
    /// echo never moves the cursor.
    fn confirm(
        &self,
        table: Table,
        item: &PushItem,
        echo: Option<Value>,
        outcome: &mut TableOutcome,
    ) -> Result<(), SyncError> {
        self.db.acknowledge(&item.seqs)?;
        outcome.pushed += 1;
        debug!(table = %table, record_id = %item.record_id, seqs = item.seqs.len(), "push acknowledged");

        if let Some(echo) = echo {
            match classify_remote(table, echo) {
                Ok(RemoteRow::Upsert(record)) if record.id() == item.record_id => {
                    self.db
                        .write_batch(table, |conn| upsert_in(conn, &record, WriteRule::IfNewer))?;
                }
                Ok(_) => {}
                Err(e) => debug!(table = %table, error = %e, "ignoring unclassifiable push echo"),
            }
        }
        Ok(())
    }

    /// Re-resolve a stale-version rejection instead of overwriting.
    async fn handle_rejection(
        &self,
        table: Table,
        item: &PushItem,
        op: ChangeOp,
        current: Option<Value>,
        outcome: &mut TableOutcome,
    ) -> Result<(), SyncError> {
        let remote = match current.map(|v| classify_remote(table, v)) {
            Some(Ok(row)) => row,
            Some(Err(e)) => {
                outcome.rejected += 1;
                outcome.deferred += 1;
                self.log_best_effort(
                    AuditEvent::new("record_rejected", e.to_string(), Severity::Error, COMPONENT)
                        .with_metadata(json!({ "table": table.as_str(), "record_id": item.record_id })),
                )
                .await;
                return Ok(());
            }
            None => {
                warn!(table = %table, record_id = %item.record_id, "rejection without current row, left queued");
                outcome.deferred += 1;
                return Ok(());
            }
        };

        let conflict = Conflict {
            table,
            record_id: item.record_id.clone(),
            local: LocalVersion {
                op,
                payload: item.payload.clone(),
                updated_at: item.snapshot_updated_at,
                seqs: item.seqs.clone(),
            },
            remote,
        };
        let resolution = ConflictResolver::resolve(&conflict);
        outcome.conflicts += 1;

        match resolution.winner {
            Winner::Remote => {
                let audit_id = self.db.write_batch(table, |conn| {
                    let id = insert_audit_in(conn, &resolution.audit)?;
                    apply_remote_winner(conn, table, &conflict.remote, conflict.local.updated_at)?;
                    queue::acknowledge_in(conn, &item.seqs)?;
                    Ok(id)
                })?;
                self.audit.publish(audit_id, &resolution.audit).await;
            }
            Winner::Local => {
                self.audit.record(&resolution.audit).await?;
                match self.push_item(table, item, op).await {
                    Ok(echo) => self.confirm(table, item, echo, outcome)?,
                    Err(SyncError::Remote(RemoteError::Rejected { .. })) => {
                        warn!(
                            table = %table,
                            record_id = %item.record_id,
                            "push rejected twice, left queued for the next cycle"
                        );
                        outcome.deferred += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn checkpoint(&self, table: Table) -> Result<(), SyncError> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(SyncError::Cancelled {
                table: table.to_string(),
            });
        }
        Ok(())
    }

    fn enter(&self, table: Table, state: TableState) -> Result<(), SyncError> {
        debug!(table = %table, %state, "table state");
        self.db.set_state(&state_key(table), &state.to_string())?;
        Ok(())
    }

    /// Record the final state of a table; status is best-effort.
    fn settle(&self, table: Table, state: TableState, error: Option<&str>) {
        let result = self
            .db
            .set_state(&state_key(table), &state.to_string())
            .and_then(|()| match error {
                Some(message) => self.db.set_state(&error_key(table), message),
                None => self.db.delete_state(&error_key(table)),
            });
        if let Err(e) = result {
            warn!(table = %table, error = %e, "failed to record table state");
        }
    }

    async fn log_best_effort(&self, event: AuditEvent) {
        if let Err(e) = self.audit.record(&event).await {
            warn!(action = %event.action, error = %e, "failed to record audit event");
        }
    }
}

fn state_key(table: Table) -> String {
    format!("table_state:{table}")
}

fn error_key(table: Table) -> String {
    format!("table_error:{table}")
}

/// Status summary read straight from the Local Store, usable without a
/// remote client (the CLI reports status while offline).
pub fn collect_status(
    db: &Database,
    tables: &[Table],
    is_syncing: bool,
) -> Result<SyncStatus, StorageError> {
    let mut statuses = Vec::with_capacity(tables.len());
    for &table in tables {
        let cursor = db.get_cursor(table)?;
        let state = db
            .get_state(&state_key(table))?
            .map(|s| TableState::from_str_val(&s))
            .unwrap_or(TableState::Idle);
        statuses.push(TableStatus {
            table: table.to_string(),
            state,
            last_sync: cursor.last_sync,
            synced_records: cursor.synced_records,
            pending_changes: db.count_pending(Some(table))?,
            last_error: db.get_state(&error_key(table))?,
        });
    }

    Ok(SyncStatus {
        is_syncing,
        last_cycle_at: db.get_state("last_cycle_at")?.as_deref().and_then(parse_ts),
        tables: statuses,
        total_pending: db.count_pending(None)?,
        audit_events: db.count_audit()?,
        audit_errors: db.count_audit_by_severity(Severity::Error)?,
        audit_unforwarded: db.count_unforwarded_audit()?,
    })
}

/// Split a pulled batch into plain applies and conflict resolutions.
fn resolve(table: Table, rows: Vec<RemoteRow>, pending: &[PendingChange]) -> ResolvedBatch {
    let mut by_record: HashMap<&str, Vec<PendingChange>> = HashMap::new();
    for entry in pending {
        by_record
            .entry(entry.record_id.as_str())
            .or_default()
            .push(entry.clone());
    }

    // Keep the newest pulled version of each record.
    let mut latest: HashMap<String, RemoteRow> = HashMap::new();
    let mut order = Vec::new();
    for row in rows {
        let id = row.id().to_string();
        match latest.get(&id) {
            Some(existing) if existing.updated_at() > row.updated_at() => {}
            Some(_) => {
                latest.insert(id, row);
            }
            None => {
                order.push(id.clone());
                latest.insert(id, row);
            }
        }
    }

    let mut resolved = ResolvedBatch::default();
    for id in order {
        let Some(row) = latest.remove(&id) else { continue };
        let local = by_record
            .get(id.as_str())
            .and_then(|entries| LocalVersion::from_pending(entries));
        let Some(local) = local else {
            resolved.apply.push(row);
            continue;
        };

        let conflict = Conflict {
            table,
            record_id: id,
            local,
            remote: row,
        };
        let resolution = ConflictResolver::resolve(&conflict);
        match resolution.winner {
            Winner::Remote => {
                resolved.dropped.extend(conflict.local.seqs.iter().copied());
                resolved.remote_wins.push(RemoteWin {
                    row: conflict.remote,
                    local_updated_at: conflict.local.updated_at,
                    audit: resolution.audit,
                });
            }
            Winner::Local => resolved.local_wins.push(resolution.audit),
        }
    }
    resolved
}

/// Apply one pulled row. Returns `true` when the local row changed.
fn apply_remote(
    conn: &rusqlite::Connection,
    table: Table,
    row: &RemoteRow,
    rule: WriteRule,
) -> Result<bool, StorageError> {
    match row {
        RemoteRow::Upsert(record) => upsert_in(conn, record, rule),
        RemoteRow::Tombstone { id, updated_at } => {
            if rule == WriteRule::IfNewer {
                if let Some(stored) = stored_updated_at(conn, table, id)? {
                    if stored >= *updated_at {
                        return Ok(false);
                    }
                }
            }
            delete_in(conn, table, id)
        }
    }
}

/// Commit a remote conflict winner, unless the row was edited locally again
/// after the losing mutation was drained.
fn apply_remote_winner(
    conn: &rusqlite::Connection,
    table: Table,
    row: &RemoteRow,
    local_updated_at: DateTime<Utc>,
) -> Result<bool, StorageError> {
    if let Some(stored) = stored_updated_at(conn, table, row.id())? {
        if stored > local_updated_at {
            debug!(table = %table, id = row.id(), "newer local edit, remote winner not applied");
            return Ok(false);
        }
    }
    apply_remote(conn, table, row, WriteRule::Replace)
}

/// Drop guard that resets the `running` flag to `false`.
///
/// This ensures the sync lock is always released, even if a sync cycle panics.
struct SyncLockGuard(Arc<AtomicBool>);

impl Drop for SyncLockGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

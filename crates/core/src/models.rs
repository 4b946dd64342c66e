//! Domain model types used throughout shelfsync.
//!
//! The seven mirrored entities match the remote schema field-for-field so that
//! a remote JSON row deserializes straight into them. Sync bookkeeping types
//! (cursors, queue entries, audit events, status summaries) live here too.

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::record::Table;

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Render a timestamp the way it is stored locally.
///
/// Fixed microsecond precision keeps stored strings lexicographically ordered.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 timestamp into UTC.
pub fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Mirrored entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: String,
    pub title: String,
    pub author: String,
    #[serde(default)]
    pub isbn: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    pub total_copies: i64,
    pub available_copies: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Number of local books referencing this category. Computed on read.
    #[serde(default, skip_serializing)]
    pub book_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Student {
    pub id: String,
    /// External identifier (admission number).
    pub student_id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub class_id: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Class {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub grade_level: Option<i64>,
    pub max_books_allowed: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Staff {
    pub id: String,
    pub staff_id: String,
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle of a borrowing.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BorrowingStatus {
    Borrowed,
    Returned,
    Overdue,
}

impl std::fmt::Display for BorrowingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Borrowed => write!(f, "borrowed"),
            Self::Returned => write!(f, "returned"),
            Self::Overdue => write!(f, "overdue"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Borrowing {
    pub id: String,
    pub book_id: String,
    pub student_id: String,
    pub borrow_date: NaiveDate,
    pub due_date: NaiveDate,
    #[serde(default)]
    pub return_date: Option<NaiveDate>,
    pub status: BorrowingStatus,
    #[serde(default)]
    pub fine_amount: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Settlement state of a fine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FineStatus {
    Pending,
    Paid,
    Waived,
}

impl std::fmt::Display for FineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Paid => write!(f, "paid"),
            Self::Waived => write!(f, "waived"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fine {
    pub id: String,
    pub borrowing_id: String,
    pub student_id: String,
    pub amount: f64,
    pub reason: String,
    pub status: FineStatus,
    #[serde(default)]
    pub paid_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Sync cursor
// ---------------------------------------------------------------------------

/// Per-table pull progress, one row in `sync_state`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub table_name: String,
    /// Latest remote `updated_at` applied; `None` for a never-synced table.
    pub last_sync: Option<DateTime<Utc>>,
    /// Records actually changed by the last completed cycle.
    pub synced_records: i64,
}

impl SyncCursor {
    /// The zero-value cursor returned for a table with no `sync_state` row.
    pub fn empty(table: Table) -> Self {
        Self {
            table_name: table.as_str().to_string(),
            last_sync: None,
            synced_records: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Change queue
// ---------------------------------------------------------------------------

/// Kind of local mutation recorded in the change queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
}

impl ChangeOp {
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// A queued local mutation awaiting remote acknowledgment.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    /// Local monotonic sequence number.
    pub seq: i64,
    pub table: Table,
    pub record_id: String,
    pub op: ChangeOp,
    /// Full record snapshot; `None` for deletes.
    pub payload: Option<serde_json::Value>,
    /// The record's `updated_at` at the moment the mutation was made.
    pub snapshot_updated_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Audit events
// ---------------------------------------------------------------------------

/// Severity of an audit event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Success,
}

impl Severity {
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "warning" => Self::Warning,
            "error" => Self::Error,
            "success" => Self::Success,
            _ => Self::Info,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Success => write!(f, "success"),
        }
    }
}

/// A sync-significant event before it is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: String,
    pub description: String,
    pub severity: Severity,
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(
        action: impl Into<String>,
        description: impl Into<String>,
        severity: Severity,
        component: impl Into<String>,
    ) -> Self {
        Self {
            action: action.into(),
            description: description.into(),
            severity,
            component: component.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A row from the `audit_log` table.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub id: i64,
    pub event: AuditEvent,
    /// Earliest occurrence of this (possibly collapsed) event.
    pub created_at: DateTime<Utc>,
    /// Number of identical consecutive occurrences folded into this row.
    pub repeat_count: i64,
    pub last_seen_at: DateTime<Utc>,
    pub forwarded: bool,
}

// ---------------------------------------------------------------------------
// Sync status
// ---------------------------------------------------------------------------

/// Per-table position in the sync-cycle state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TableState {
    Idle,
    Pulling,
    Resolving,
    Pushing,
    Advancing,
    Failed,
}

impl TableState {
    /// Parse a state string into a `TableState`.
    pub fn from_str_val(s: &str) -> Self {
        match s {
            "pulling" => Self::Pulling,
            "resolving" => Self::Resolving,
            "pushing" => Self::Pushing,
            "advancing" => Self::Advancing,
            "failed" => Self::Failed,
            _ => Self::Idle,
        }
    }
}

impl std::fmt::Display for TableState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Pulling => write!(f, "pulling"),
            Self::Resolving => write!(f, "resolving"),
            Self::Pushing => write!(f, "pushing"),
            Self::Advancing => write!(f, "advancing"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Status of one mirrored table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableStatus {
    pub table: String,
    pub state: TableState,
    pub last_sync: Option<DateTime<Utc>>,
    pub synced_records: i64,
    pub pending_changes: i64,
    pub last_error: Option<String>,
}

/// High-level sync status summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub tables: Vec<TableStatus>,
    pub total_pending: i64,
    pub audit_events: i64,
    pub audit_errors: i64,
    pub audit_unforwarded: i64,
}

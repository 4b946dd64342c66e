//! Conflict representation and last-write-wins resolution.
//!
//! A conflict exists when a pulled remote row (or a stale-write rejection)
//! touches a record that still has pending local mutations. Conflicts are
//! values, not errors: every one is resolved and audited.

pub mod resolver;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use crate::models::{ChangeOp, PendingChange};
use crate::record::{RemoteRow, Table};

pub use resolver::{ConflictResolver, Resolution, Winner};

/// The local side of a conflict: the record's pending mutations folded to
/// their latest state.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalVersion {
    pub op: ChangeOp,
    pub payload: Option<Value>,
    /// Snapshot timestamp of the newest pending mutation.
    pub updated_at: DateTime<Utc>,
    /// Every queue entry for the record, dropped together if local loses.
    pub seqs: Vec<i64>,
}

impl LocalVersion {
    /// Fold the pending entries of one record. Returns `None` for an empty
    /// slice.
    pub fn from_pending(entries: &[PendingChange]) -> Option<Self> {
        let latest = entries.iter().max_by_key(|e| e.seq)?;
        Some(Self {
            op: latest.op,
            payload: latest.payload.clone(),
            updated_at: latest.snapshot_updated_at,
            seqs: entries.iter().map(|e| e.seq).collect(),
        })
    }
}

/// A record modified both locally (queued) and remotely.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub table: Table,
    pub record_id: String,
    pub local: LocalVersion,
    pub remote: RemoteRow,
}

impl Conflict {
    /// Both competing versions, for the audit trail.
    pub fn versions_json(&self) -> Value {
        let remote = match &self.remote {
            RemoteRow::Upsert(record) => json!({
                "updated_at": record.updated_at(),
                "deleted": false,
                "record": record.to_value().unwrap_or(Value::Null),
            }),
            RemoteRow::Tombstone { updated_at, .. } => json!({
                "updated_at": updated_at,
                "deleted": true,
                "record": Value::Null,
            }),
        };
        json!({
            "table": self.table.as_str(),
            "record_id": self.record_id,
            "local": {
                "op": self.local.op,
                "updated_at": self.local.updated_at,
                "record": self.local.payload,
            },
            "remote": remote,
        })
    }
}

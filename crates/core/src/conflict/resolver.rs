//! Last-write-wins conflict resolution.
//!
//! The [`ConflictResolver`] compares the remote `updated_at` with the queued
//! local snapshot timestamp. Local wins only when strictly newer; a tie goes
//! to the remote, whose clock is authoritative across clients. Deletes follow
//! the same rule on either side.

use tracing::{debug, info};

use super::Conflict;
use crate::models::{AuditEvent, ChangeOp, Severity};
use crate::record::RemoteRow;

/// Which side of a conflict is committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
    /// Keep the local mutation and (re)push it.
    Local,
    /// Apply the remote version and drop the local mutation.
    Remote,
}

impl std::fmt::Display for Winner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// The outcome of resolving one conflict.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub winner: Winner,
    /// Audit event carrying both versions; must be recorded before the winner
    /// is committed.
    pub audit: AuditEvent,
}

/// Stateless last-write-wins resolver.
pub struct ConflictResolver;

impl ConflictResolver {
    pub const COMPONENT: &'static str = "conflict_resolver";

    /// Decide the winner of `conflict` and build its audit event.
    pub fn resolve(conflict: &Conflict) -> Resolution {
        let remote_ts = conflict.remote.updated_at();
        let local_ts = conflict.local.updated_at;
        let winner = if local_ts > remote_ts {
            Winner::Local
        } else {
            Winner::Remote
        };

        let remote_deleted = matches!(conflict.remote, RemoteRow::Tombstone { .. });
        let local_op = conflict.local.op;

        let (severity, description) = match (winner, local_op, remote_deleted) {
            (Winner::Remote, ChangeOp::Delete, false) => (
                Severity::Warning,
                format!(
                    "{}/{}: remote update at {} resurrected the record, local delete at {} dropped",
                    conflict.table, conflict.record_id, remote_ts, local_ts
                ),
            ),
            (Winner::Remote, _, true) => (
                Severity::Warning,
                format!(
                    "{}/{}: remote delete at {} beat local {} at {}",
                    conflict.table, conflict.record_id, remote_ts, local_op, local_ts
                ),
            ),
            (Winner::Remote, _, false) => (
                Severity::Warning,
                format!(
                    "{}/{}: remote version at {} beat local {} at {}, local change dropped",
                    conflict.table, conflict.record_id, remote_ts, local_op, local_ts
                ),
            ),
            (Winner::Local, _, _) => (
                Severity::Info,
                format!(
                    "{}/{}: local {} at {} beat remote {} at {}, re-pushing",
                    conflict.table,
                    conflict.record_id,
                    local_op,
                    local_ts,
                    if remote_deleted { "delete" } else { "version" },
                    remote_ts
                ),
            ),
        };

        if winner == Winner::Remote {
            info!(
                table = %conflict.table,
                record_id = %conflict.record_id,
                %local_ts,
                %remote_ts,
                "conflict resolved in favour of remote"
            );
        } else {
            debug!(
                table = %conflict.table,
                record_id = %conflict.record_id,
                %local_ts,
                %remote_ts,
                "conflict resolved in favour of local"
            );
        }

        let mut metadata = conflict.versions_json();
        metadata["winner"] = serde_json::Value::String(winner.to_string());

        Resolution {
            winner,
            audit: AuditEvent::new("conflict_resolved", description, severity, Self::COMPONENT)
                .with_metadata(metadata),
        }
    }
}

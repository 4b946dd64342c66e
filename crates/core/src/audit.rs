//! Audit Logger: persisted, structured record of sync-significant events.
//!
//! Events are written to the local `audit_log` first, mirrored to `tracing`
//! at a level matching their severity, and then forwarded best-effort to the
//! remote `log_system_event` sink. Rows that could not be forwarded stay
//! flagged and are retried by [`AuditLogger::flush_pending`].

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::config::AuditConfig;
use crate::db::Database;
use crate::errors::StorageError;
use crate::models::{AuditEvent, Severity};
use crate::remote::RemoteClient;

/// Unforwarded rows sent per flush batch.
const FLUSH_BATCH: u32 = 100;

/// Result of one maintenance pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Local rows folded into an earlier identical row.
    pub collapsed: usize,
    /// Rows forwarded to the remote sink during this pass.
    pub forwarded: usize,
    /// Whether the remote accepted the duplicate-cleanup request.
    pub remote_cleaned: bool,
}

pub struct AuditLogger {
    db: Arc<Database>,
    remote: Option<Arc<dyn RemoteClient>>,
    forward: bool,
}

impl AuditLogger {
    pub fn new(db: Arc<Database>, remote: Option<Arc<dyn RemoteClient>>, config: &AuditConfig) -> Self {
        Self {
            db,
            remote,
            forward: config.forward_to_remote,
        }
    }

    /// A logger that never talks to the remote.
    pub fn local_only(db: Arc<Database>) -> Self {
        Self {
            db,
            remote: None,
            forward: false,
        }
    }

    /// Record one event. Returns the local row id.
    pub async fn log_event(
        &self,
        action: &str,
        description: &str,
        severity: Severity,
        component: &str,
        metadata: Option<Value>,
    ) -> Result<i64, StorageError> {
        let mut event = AuditEvent::new(action, description, severity, component);
        event.metadata = metadata;
        self.record(&event).await
    }

    /// Persist `event`, then mirror and forward it.
    pub async fn record(&self, event: &AuditEvent) -> Result<i64, StorageError> {
        let id = self.db.insert_audit(event)?;
        self.publish(id, event).await;
        Ok(id)
    }

    /// Mirror and forward an event already stored as row `id`, e.g. one
    /// inserted inside a sync transaction.
    pub async fn publish(&self, id: i64, event: &AuditEvent) {
        mirror(event);
        if self.forward_to_remote(event).await {
            if let Err(e) = self.db.mark_audit_forwarded(&[id]) {
                warn!(audit_id = id, error = %e, "failed to flag audit row as forwarded");
            }
        }
    }

    async fn forward_to_remote(&self, event: &AuditEvent) -> bool {
        let remote = match (&self.remote, self.forward) {
            (Some(remote), true) => remote,
            _ => return false,
        };
        match remote.log_system_event(event).await {
            Ok(remote_id) => {
                debug!(action = %event.action, remote_id, "audit event forwarded");
                true
            }
            Err(e) => {
                debug!(action = %event.action, error = %e, "audit forwarding deferred");
                false
            }
        }
    }

    /// Forward every row still flagged unforwarded, oldest first. Stops at
    /// the first failure. Returns the number forwarded.
    pub async fn flush_pending(&self) -> Result<usize, StorageError> {
        if self.remote.is_none() || !self.forward {
            return Ok(0);
        }

        let mut forwarded = 0;
        loop {
            let batch = self.db.list_unforwarded_audit(FLUSH_BATCH)?;
            if batch.is_empty() {
                break;
            }
            let mut sent = Vec::with_capacity(batch.len());
            let mut stalled = false;
            for entry in &batch {
                if self.forward_to_remote(&entry.event).await {
                    sent.push(entry.id);
                } else {
                    stalled = true;
                    break;
                }
            }
            forwarded += self.db.mark_audit_forwarded(&sent)?;
            if stalled || batch.len() < FLUSH_BATCH as usize {
                break;
            }
        }

        if forwarded > 0 {
            info!(forwarded, "flushed pending audit events");
        }
        Ok(forwarded)
    }

    /// Collapse local duplicates, retry forwarding, and ask the remote to
    /// clean its own duplicates.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, StorageError> {
        let collapsed = self.db.collapse_duplicate_audit()?;
        let forwarded = self.flush_pending().await?;

        let remote_cleaned = match (&self.remote, self.forward) {
            (Some(remote), true) => match remote.clean_duplicate_logs().await {
                Ok(()) => true,
                Err(e) => {
                    debug!(error = %e, "remote log cleanup skipped");
                    false
                }
            },
            _ => false,
        };

        info!(collapsed, forwarded, remote_cleaned, "audit maintenance finished");
        Ok(MaintenanceReport {
            collapsed,
            forwarded,
            remote_cleaned,
        })
    }
}

fn mirror(event: &AuditEvent) {
    match event.severity {
        Severity::Error => error!(
            action = %event.action,
            component = %event.component,
            "{}",
            event.description
        ),
        Severity::Warning => warn!(
            action = %event.action,
            component = %event.component,
            "{}",
            event.description
        ),
        Severity::Info | Severity::Success => info!(
            action = %event.action,
            component = %event.component,
            "{}",
            event.description
        ),
    }
}

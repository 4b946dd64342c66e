//! Remote backend interface consumed by the synchronizer.
//!
//! The synchronizer receives an `Arc<dyn RemoteClient>` in its constructor;
//! there is no process-wide client. [`rest::RestRemote`] talks to a PostgREST
//! API, [`memory::InMemoryRemote`] is an in-process stand-in with failure
//! injection for tests and offline demos.

pub mod memory;
pub mod rest;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::RemoteError;
use crate::models::AuditEvent;
use crate::record::{value_updated_at, Table};

pub use memory::InMemoryRemote;
pub use rest::RestRemote;

/// Position of the last row a pull has seen. The next page holds the rows
/// strictly after `(updated_at, id)` in fetch order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageKey {
    pub updated_at: DateTime<Utc>,
    pub id: String,
}

impl PageKey {
    /// Key of a fetched row; `None` when it has no usable id or timestamp.
    pub fn from_row(row: &Value) -> Option<Self> {
        let id = row.get("id").and_then(Value::as_str)?;
        Some(Self {
            updated_at: value_updated_at(row)?,
            id: id.to_string(),
        })
    }
}

/// Prepare a local record for a remote write. A pushed record is live, so a
/// soft-delete marker left on the remote row is cleared.
pub(crate) fn live_payload(payload: &Value) -> Value {
    let mut payload = payload.clone();
    if let Some(fields) = payload.as_object_mut() {
        fields.insert("deleted_at".into(), Value::Null);
    }
    payload
}

/// Operations the synchronizer needs from the remote.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// At most `limit` rows of `table`, ordered by `updated_at` then id.
    /// The first page (`after == None`) starts at `updated_at > since`;
    /// later pages hold the rows strictly after the `after` key, so rows
    /// moving to the end between pages never push others out of reach.
    async fn fetch_page(
        &self,
        table: Table,
        since: Option<DateTime<Utc>>,
        after: Option<&PageKey>,
        limit: usize,
    ) -> Result<Vec<Value>, RemoteError>;

    /// Full-record upsert of a record created locally, clearing any remote
    /// `deleted_at`. Returns the stored row.
    async fn insert(&self, table: Table, payload: &Value) -> Result<Value, RemoteError>;

    /// Conditional full-record update: applied only while the remote row is
    /// older than `snapshot`. Clears a remote `deleted_at`. A newer remote row fails with
    /// [`RemoteError::Rejected`]; a missing row is inserted.
    async fn update(
        &self,
        table: Table,
        id: &str,
        payload: &Value,
        snapshot: DateTime<Utc>,
    ) -> Result<Value, RemoteError>;

    /// Conditional id-scoped delete with the same staleness rule as
    /// [`update`](Self::update). Deleting a missing row succeeds.
    async fn delete(
        &self,
        table: Table,
        id: &str,
        snapshot: DateTime<Utc>,
    ) -> Result<(), RemoteError>;

    /// Audit sink. Returns the remote event id.
    async fn log_system_event(&self, event: &AuditEvent) -> Result<String, RemoteError>;

    /// Ask the remote to collapse its duplicate log rows.
    async fn clean_duplicate_logs(&self) -> Result<(), RemoteError>;

    /// Cheap reachability probe.
    async fn check_connectivity(&self) -> bool;
}

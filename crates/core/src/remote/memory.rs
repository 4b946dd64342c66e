//! In-process remote backend.
//!
//! Behaves like the PostgREST backend (keyset paging, conditional writes
//! that merge into the stored row, stale-write rejection, soft-delete
//! tombstones) and adds failure injection: going offline, failing the next N
//! calls, failing one table, rejecting writes to one record, and per-call
//! latency.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use super::{live_payload, PageKey, RemoteClient};
use crate::errors::RemoteError;
use crate::models::{AuditEvent, ChangeOp};
use crate::record::{value_updated_at, Table};

#[derive(Default)]
struct State {
    tables: HashMap<Table, BTreeMap<String, Value>>,
    offline: bool,
    fail_next: u32,
    failing_tables: HashSet<Table>,
    forced_rejections: HashMap<(Table, String), u32>,
    latency: Option<Duration>,
    events: Vec<AuditEvent>,
    writes: Vec<(Table, String, ChangeOp)>,
    fetches: usize,
    cleanups: usize,
}

impl State {
    fn gate(&mut self, table: Option<Table>) -> Result<(), RemoteError> {
        if self.offline {
            return Err(RemoteError::Transient("remote offline".into()));
        }
        // Injected failures only hit table endpoints, never the audit RPCs.
        if let Some(t) = table {
            if self.fail_next > 0 {
                self.fail_next -= 1;
                return Err(RemoteError::Transient("injected failure".into()));
            }
            if self.failing_tables.contains(&t) {
                return Err(RemoteError::Transient(format!("{t} endpoint unavailable")));
            }
        }
        Ok(())
    }

    /// Consume one injected rejection for `id`, reporting the stored row as
    /// the current version.
    fn forced_rejection(&mut self, table: Table, id: &str) -> Result<(), RemoteError> {
        let key = (table, id.to_string());
        match self.forced_rejections.get_mut(&key) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(RemoteError::Rejected {
                    table: table.to_string(),
                    id: id.to_string(),
                    current: self.tables.get(&table).and_then(|rows| rows.get(id).cloned()),
                })
            }
            _ => Ok(()),
        }
    }

    /// Merge `payload` into the stored row the way a PATCH or a
    /// merge-duplicates upsert does: unsent columns keep their values.
    fn merge(&mut self, table: Table, id: &str, payload: &Value) -> Value {
        let rows = self.tables.entry(table).or_default();
        let row = rows
            .entry(id.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        match (row, payload) {
            (Value::Object(stored), Value::Object(fields)) => {
                for (k, v) in fields {
                    stored.insert(k.clone(), v.clone());
                }
                Value::Object(stored.clone())
            }
            (row, _) => {
                *row = payload.clone();
                row.clone()
            }
        }
    }

    /// Reject a conditional write when the stored row is not older than
    /// `snapshot`.
    fn check_stale(
        &self,
        table: Table,
        id: &str,
        snapshot: DateTime<Utc>,
    ) -> Result<bool, RemoteError> {
        match self.tables.get(&table).and_then(|rows| rows.get(id)) {
            Some(current) => {
                let current_ts = value_updated_at(current);
                if current_ts.is_some_and(|ts| ts >= snapshot) {
                    Err(RemoteError::Rejected {
                        table: table.to_string(),
                        id: id.to_string(),
                        current: Some(current.clone()),
                    })
                } else {
                    Ok(true)
                }
            }
            None => Ok(false),
        }
    }
}

/// In-memory [`RemoteClient`].
#[derive(Default)]
pub struct InMemoryRemote {
    state: Mutex<State>,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn simulate_latency(&self) {
        let latency = self.state().latency;
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
    }

    // -- remote-side manipulation ------------------------------------------

    /// Write a row directly, as another client would.
    pub fn put(&self, table: Table, row: Value) {
        let id = row
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.state()
            .tables
            .entry(table)
            .or_default()
            .insert(id, row);
    }

    /// Current row for `id`.
    pub fn get(&self, table: Table, id: &str) -> Option<Value> {
        self.state()
            .tables
            .get(&table)
            .and_then(|rows| rows.get(id).cloned())
    }

    /// Number of rows stored for `table`.
    pub fn len(&self, table: Table) -> usize {
        self.state().tables.get(&table).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.state().tables.values().all(BTreeMap::is_empty)
    }

    // -- failure injection --------------------------------------------------

    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Fail the next `n` table calls with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.state().fail_next = n;
    }

    /// Make every call touching `table` fail transiently until cleared.
    pub fn set_table_failing(&self, table: Table, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing_tables.insert(table);
        } else {
            state.failing_tables.remove(&table);
        }
    }

    /// Reject the next `times` conditional writes to `id` as stale,
    /// whatever the timestamps say.
    pub fn reject_writes(&self, table: Table, id: &str, times: u32) {
        self.state()
            .forced_rejections
            .insert((table, id.to_string()), times);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    // -- observation --------------------------------------------------------

    /// Events received through `log_system_event`.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.state().events.clone()
    }

    /// Successful writes, in arrival order.
    pub fn writes(&self) -> Vec<(Table, String, ChangeOp)> {
        self.state().writes.clone()
    }

    pub fn fetch_calls(&self) -> usize {
        self.state().fetches
    }

    pub fn cleanup_calls(&self) -> usize {
        self.state().cleanups
    }
}

#[async_trait]
impl RemoteClient for InMemoryRemote {
    async fn fetch_page(
        &self,
        table: Table,
        since: Option<DateTime<Utc>>,
        after: Option<&PageKey>,
        limit: usize,
    ) -> Result<Vec<Value>, RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state();
        state.fetches += 1;
        state.gate(Some(table))?;

        // Rows without a timestamp sort last and only show up on an
        // unfiltered first page, as with PostgREST's `nulls last`.
        let selected = |ts: Option<DateTime<Utc>>, id: &str| match (after, since, ts) {
            (Some(key), _, Some(ts)) => (ts, id) > (key.updated_at, key.id.as_str()),
            (None, Some(since), Some(ts)) => ts > since,
            (None, None, _) => true,
            _ => false,
        };
        let mut rows: Vec<(Option<DateTime<Utc>>, &String, &Value)> = state
            .tables
            .get(&table)
            .map(|rows| {
                rows.iter()
                    .map(|(id, row)| (value_updated_at(row), id, row))
                    .filter(|(ts, id, _)| selected(*ts, id.as_str()))
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by(|a, b| (a.0.is_none(), a.0, a.1).cmp(&(b.0.is_none(), b.0, b.1)));

        let page: Vec<Value> = rows
            .into_iter()
            .take(limit)
            .map(|(_, _, row)| row.clone())
            .collect();
        debug!(table = %table, after = ?after.map(|k| &k.id), count = page.len(), "in-memory fetch");
        Ok(page)
    }

    async fn insert(&self, table: Table, payload: &Value) -> Result<Value, RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state();
        state.gate(Some(table))?;
        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| RemoteError::Api {
                status: 400,
                body: "payload without id".into(),
            })?
            .to_string();
        let stored = state.merge(table, &id, &live_payload(payload));
        state.writes.push((table, id, ChangeOp::Create));
        Ok(stored)
    }

    async fn update(
        &self,
        table: Table,
        id: &str,
        payload: &Value,
        snapshot: DateTime<Utc>,
    ) -> Result<Value, RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state();
        state.gate(Some(table))?;
        state.forced_rejection(table, id)?;
        state.check_stale(table, id, snapshot)?;
        let stored = state.merge(table, id, &live_payload(payload));
        state.writes.push((table, id.to_string(), ChangeOp::Update));
        Ok(stored)
    }

    async fn delete(
        &self,
        table: Table,
        id: &str,
        snapshot: DateTime<Utc>,
    ) -> Result<(), RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state();
        state.gate(Some(table))?;
        state.forced_rejection(table, id)?;
        if state.check_stale(table, id, snapshot)? {
            if let Some(rows) = state.tables.get_mut(&table) {
                rows.remove(id);
            }
        }
        state.writes.push((table, id.to_string(), ChangeOp::Delete));
        Ok(())
    }

    async fn log_system_event(&self, event: &AuditEvent) -> Result<String, RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state();
        state.gate(None)?;
        state.events.push(event.clone());
        Ok(state.events.len().to_string())
    }

    async fn clean_duplicate_logs(&self) -> Result<(), RemoteError> {
        self.simulate_latency().await;
        let mut state = self.state();
        state.gate(None)?;
        state.cleanups += 1;
        let mut previous: Option<(String, String, String, Option<Value>)> = None;
        state.events.retain(|e| {
            let key = (
                e.action.clone(),
                e.component.clone(),
                e.description.clone(),
                e.metadata.clone(),
            );
            let duplicate = previous.as_ref() == Some(&key);
            previous = Some(key);
            !duplicate
        });
        Ok(())
    }

    async fn check_connectivity(&self) -> bool {
        !self.state().offline
    }
}

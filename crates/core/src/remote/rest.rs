//! PostgREST (Supabase REST) client.
//!
//! Tables live under `{url}/rest/v1/{table}` and RPCs under
//! `{url}/rest/v1/rpc/{name}`. Filters use PostgREST operators
//! (`updated_at=gt.<ts>`, `id=eq.<id>`), upserts use `on_conflict=id`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Response, StatusCode};
use serde_json::{json, Value};
use tracing::{debug, info, instrument};

use super::{live_payload, PageKey, RemoteClient};
use crate::config::RemoteConfig;
use crate::errors::{ConfigError, RemoteError};
use crate::models::{format_ts, AuditEvent};
use crate::record::Table;

const RETURN_REPRESENTATION: &str = "return=representation";

/// Asynchronous PostgREST client.
#[derive(Clone)]
pub struct RestRemote {
    http: reqwest::Client,
    base_url: String,
}

impl RestRemote {
    /// Build a client from the remote config. The API key must already be
    /// resolved from the environment.
    pub fn new(config: &RemoteConfig) -> Result<Self, ConfigError> {
        let api_key = config
            .api_key
            .as_deref()
            .ok_or_else(|| ConfigError::EnvVarMissing {
                var: config.api_key_env.clone(),
                field: "remote.api_key_env".into(),
            })?;

        let header = |value: String| {
            HeaderValue::from_str(&value).map_err(|e| ConfigError::InvalidValue {
                field: "remote.api_key_env".into(),
                detail: format!("API key is not a valid header value: {e}"),
            })
        };

        let mut headers = HeaderMap::new();
        headers.insert("apikey", header(api_key.to_string())?);
        headers.insert(AUTHORIZATION, header(format!("Bearer {api_key}"))?);
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.request_timeout())
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                field: "remote".into(),
                detail: format!("failed to build HTTP client: {e}"),
            })?;

        let base_url = config.url.trim_end_matches('/').to_string();
        info!(url = %base_url, "created PostgREST client");
        Ok(Self { http, base_url })
    }

    fn table_url(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn rpc_url(&self, name: &str) -> String {
        format!("{}/rest/v1/rpc/{}", self.base_url, name)
    }

    /// Current remote row for `id`, if any.
    async fn fetch_one(&self, table: Table, id: &str) -> Result<Option<Value>, RemoteError> {
        let resp = self
            .http
            .get(self.table_url(table))
            .query(&[("select", "*".to_string()), ("id", format!("eq.{id}"))])
            .send()
            .await?;
        let rows: Vec<Value> = decode(check_response(resp).await?).await?;
        Ok(rows.into_iter().next())
    }

    /// A conditional write matched nothing: reject if the row exists.
    async fn reject_if_exists(&self, table: Table, id: &str) -> Result<(), RemoteError> {
        match self.fetch_one(table, id).await? {
            Some(current) => Err(RemoteError::Rejected {
                table: table.to_string(),
                id: id.to_string(),
                current: Some(current),
            }),
            None => Ok(()),
        }
    }
}

/// Map an HTTP error status to a [`RemoteError`], keeping the body.
async fn check_response(resp: Response) -> Result<Response, RemoteError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Err(RemoteError::Transient(format!("HTTP {status}: {body}")))
    } else {
        Err(RemoteError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

/// PostgREST `or` filter selecting rows strictly after `key` in
/// `updated_at.asc,id.asc` order.
fn keyset_filter(key: &PageKey) -> String {
    let ts = quote_operand(&format_ts(&key.updated_at));
    let id = quote_operand(&key.id);
    format!("(updated_at.gt.{ts},and(updated_at.eq.{ts},id.gt.{id}))")
}

/// Double-quote a value inside a logical filter, where `.`, `,` and `:`
/// are reserved.
fn quote_operand(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

async fn decode<T: serde::de::DeserializeOwned>(resp: Response) -> Result<T, RemoteError> {
    let bytes = resp.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| RemoteError::Decode(e.to_string()))
}

#[async_trait]
impl RemoteClient for RestRemote {
    #[instrument(skip(self))]
    async fn fetch_page(
        &self,
        table: Table,
        since: Option<DateTime<Utc>>,
        after: Option<&PageKey>,
        limit: usize,
    ) -> Result<Vec<Value>, RemoteError> {
        let mut query = vec![
            ("select", "*".to_string()),
            ("order", "updated_at.asc,id.asc".to_string()),
            ("limit", limit.to_string()),
        ];
        match (after, since) {
            (Some(key), _) => query.push(("or", keyset_filter(key))),
            (None, Some(since)) => {
                query.push(("updated_at", format!("gt.{}", format_ts(&since))))
            }
            (None, None) => {}
        }

        let resp = self
            .http
            .get(self.table_url(table))
            .query(&query)
            .send()
            .await?;
        let rows: Vec<Value> = decode(check_response(resp).await?).await?;
        debug!(count = rows.len(), "fetched page");
        Ok(rows)
    }

    #[instrument(skip(self, payload))]
    async fn insert(&self, table: Table, payload: &Value) -> Result<Value, RemoteError> {
        let body = live_payload(payload);
        let resp = self
            .http
            .post(self.table_url(table))
            .query(&[("on_conflict", "id")])
            .header("Prefer", format!("resolution=merge-duplicates,{RETURN_REPRESENTATION}"))
            .json(&body)
            .send()
            .await?;
        let rows: Vec<Value> = decode(check_response(resp).await?).await?;
        debug!("upserted record");
        Ok(rows.into_iter().next().unwrap_or(body))
    }

    #[instrument(skip(self, payload))]
    async fn update(
        &self,
        table: Table,
        id: &str,
        payload: &Value,
        snapshot: DateTime<Utc>,
    ) -> Result<Value, RemoteError> {
        let resp = self
            .http
            .patch(self.table_url(table))
            .query(&[
                ("id", format!("eq.{id}")),
                ("updated_at", format!("lt.{}", format_ts(&snapshot))),
            ])
            .header("Prefer", RETURN_REPRESENTATION)
            .json(&live_payload(payload))
            .send()
            .await?;
        let rows: Vec<Value> = decode(check_response(resp).await?).await?;
        if let Some(row) = rows.into_iter().next() {
            debug!("updated record");
            return Ok(row);
        }

        self.reject_if_exists(table, id).await?;
        debug!("record missing remotely, inserting");
        self.insert(table, payload).await
    }

    #[instrument(skip(self))]
    async fn delete(
        &self,
        table: Table,
        id: &str,
        snapshot: DateTime<Utc>,
    ) -> Result<(), RemoteError> {
        let resp = self
            .http
            .delete(self.table_url(table))
            .query(&[
                ("id", format!("eq.{id}")),
                ("updated_at", format!("lt.{}", format_ts(&snapshot))),
            ])
            .header("Prefer", RETURN_REPRESENTATION)
            .send()
            .await?;
        let rows: Vec<Value> = decode(check_response(resp).await?).await?;
        if rows.is_empty() {
            self.reject_if_exists(table, id).await?;
        }
        debug!("deleted record");
        Ok(())
    }

    #[instrument(skip(self, event), fields(action = %event.action))]
    async fn log_system_event(&self, event: &AuditEvent) -> Result<String, RemoteError> {
        let body = json!({
            "action": event.action,
            "description": event.description,
            "severity": event.severity,
            "component": event.component,
            "metadata": event.metadata,
        });
        let resp = self
            .http
            .post(self.rpc_url("log_system_event"))
            .json(&body)
            .send()
            .await?;
        let id: Value = decode(check_response(resp).await?).await?;
        Ok(match id {
            Value::String(s) => s,
            other => other.to_string(),
        })
    }

    #[instrument(skip(self))]
    async fn clean_duplicate_logs(&self) -> Result<(), RemoteError> {
        let resp = self
            .http
            .post(self.rpc_url("clean_duplicate_logs"))
            .json(&json!({}))
            .send()
            .await?;
        check_response(resp).await?;
        info!("remote duplicate logs cleaned");
        Ok(())
    }

    async fn check_connectivity(&self) -> bool {
        let url = format!("{}/rest/v1/", self.base_url);
        match self.http.head(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(error = %e, "connectivity probe failed");
                false
            }
        }
    }
}

//! PostgREST-style HTTP client for a hosted key-value table.
//!
//! Talks to `{url}/rest/v1/{table}` with the `apikey` + bearer headers hosted
//! Postgres services expect. The change feed polls the table and diffs
//! consecutive snapshots.

use super::{ChangeEvent, ChangeFilter, ChangeStream, RemoteBackend, Row};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

const SELECT_COLUMNS: &str = "key,value,updated_at";

/// HTTP backend.
#[derive(Debug, Clone)]
pub struct RestBackend {
    client: Client,
    base_url: String,
    api_key: String,
    poll_interval: Duration,
}

impl RestBackend {
    /// Client for the project at `base_url`, authenticating with `api_key`.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            api_key: api_key.into(),
            poll_interval: Duration::from_secs(1),
        }
    }

    /// How often the change feed rescans the table (default 1s).
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, urlencoding::encode(table))
    }

    fn key_filter(key: &str) -> String {
        format!("eq.{key}")
    }

    fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("apikey", &self.api_key)
            .header("Authorization", format!("Bearer {}", self.api_key))
    }

    async fn fetch_all(&self, table: &str) -> Result<Vec<Row>> {
        let response = self
            .authed(self.client.get(self.table_url(table)))
            .query(&[("select", SELECT_COLUMNS)])
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }
}

async fn ensure_success(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Remote(format!("{status}: {body}")))
}

#[async_trait]
impl RemoteBackend for RestBackend {
    async fn select(&self, table: &str) -> Result<Vec<Row>> {
        self.fetch_all(table).await
    }

    async fn select_one(&self, table: &str, key: &str) -> Result<Row> {
        let filter = Self::key_filter(key);
        let response = self
            .authed(self.client.get(self.table_url(table)))
            .query(&[("select", SELECT_COLUMNS), ("key", filter.as_str())])
            .send()
            .await?;
        let rows: Vec<Row> = ensure_success(response).await?.json().await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| Error::NotFound(key.to_owned()))
    }

    async fn upsert(&self, table: &str, row: Row) -> Result<()> {
        let response = self
            .authed(self.client.post(self.table_url(table)))
            .query(&[("on_conflict", "key")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[row])
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn delete(&self, table: &str, key: &str) -> Result<()> {
        let response = self
            .authed(self.client.delete(self.table_url(table)))
            .query(&[("key", Self::key_filter(key))])
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }

    async fn subscribe(&self, table: &str, filter: ChangeFilter) -> Result<ChangeStream> {
        // The first scan is the baseline; only later differences are changes.
        let baseline = self.fetch_all(table).await?;
        let (tx, rx) = mpsc::channel(64);
        let backend = self.clone();
        let table = table.to_owned();

        tokio::spawn(async move {
            let mut previous = index(baseline);
            let mut ticker = tokio::time::interval(backend.poll_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if tx.is_closed() {
                    tracing::debug!(table = %table, "change feed dropped, poller stopping");
                    return;
                }
                let rows = match backend.fetch_all(&table).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        tracing::warn!(table = %table, error = %e, "change poll failed");
                        continue;
                    }
                };
                let current = index(rows);
                for event in diff_snapshots(&previous, &current) {
                    if filter.matches(&event) && tx.send(event).await.is_err() {
                        tracing::debug!(table = %table, "change feed dropped, poller stopping");
                        return;
                    }
                }
                previous = current;
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

fn index(rows: Vec<Row>) -> HashMap<String, Row> {
    rows.into_iter().map(|r| (r.key.clone(), r)).collect()
}

/// Change events that turn `previous` into `current`. Rows whose value is
/// unchanged produce nothing even if `updated_at` moved.
pub(crate) fn diff_snapshots(
    previous: &HashMap<String, Row>,
    current: &HashMap<String, Row>,
) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    for (key, row) in current {
        match previous.get(key) {
            None => events.push(ChangeEvent::upserted(row.clone(), None)),
            Some(old) if old.value != row.value => {
                events.push(ChangeEvent::upserted(row.clone(), Some(old.clone())))
            }
            Some(_) => {}
        }
    }
    for (key, old) in previous {
        if !current.contains_key(key) {
            events.push(ChangeEvent::deleted(old.clone()));
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::ChangeKind;

    fn snap(pairs: &[(&str, &str)]) -> HashMap<String, Row> {
        index(pairs.iter().map(|(k, v)| Row::new(*k, *v)).collect())
    }

    #[test]
    fn diff_detects_insert_update_delete() {
        let before = snap(&[("a", "1"), ("b", "2")]);
        let after = snap(&[("a", "1"), ("b", "3"), ("c", "4")]);
        let mut events = diff_snapshots(&before, &after);
        events.sort_by(|x, y| x.key().cmp(&y.key()));

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, ChangeKind::Update);
        assert_eq!(events[0].key(), Some("b"));
        assert_eq!(events[1].kind, ChangeKind::Insert);
        assert_eq!(events[1].key(), Some("c"));

        let gone = diff_snapshots(&after, &snap(&[("a", "1")]));
        assert_eq!(gone.len(), 2);
        assert!(gone.iter().all(|e| e.kind == ChangeKind::Delete));
    }

    #[test]
    fn identical_snapshots_produce_nothing() {
        let s = snap(&[("a", "1")]);
        assert!(diff_snapshots(&s, &snap(&[("a", "1")])).is_empty());
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let b = RestBackend::new("https://example.test/", "anon");
        assert_eq!(b.table_url("kv_store"), "https://example.test/rest/v1/kv_store");
    }
}

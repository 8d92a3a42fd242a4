//! In-process stand-in for the hosted table.
//!
//! Several sessions share one `Arc<MemoryBackend>` the same way several
//! browser tabs share one hosted database. Availability can be switched off
//! to exercise the local-only fallback, and every upsert/delete that reached
//! the table is logged.

use super::{ChangeEvent, ChangeFilter, ChangeStream, RemoteBackend, Row};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

type Tables = HashMap<String, HashMap<String, Row>>;

/// Shared in-memory table with a broadcast change feed.
#[derive(Debug)]
pub struct MemoryBackend {
    tables: RwLock<Tables>,
    events: broadcast::Sender<(String, ChangeEvent)>,
    available: AtomicBool,
    upserts: Mutex<Vec<(String, Row)>>,
    deletes: Mutex<Vec<(String, String)>>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    /// Empty backend with a 256-event feed buffer.
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    /// Empty backend whose feed buffers up to `capacity` events per
    /// subscriber before lagging.
    pub fn with_capacity(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            tables: RwLock::new(HashMap::new()),
            events,
            available: AtomicBool::new(true),
            upserts: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`). While unavailable
    /// every call fails with [`Error::Remote`].
    pub fn set_available(&self, yes: bool) {
        self.available.store(yes, Ordering::SeqCst);
    }

    /// Current availability.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Current value for `key`, bypassing availability.
    #[must_use]
    pub fn peek(&self, table: &str, key: &str) -> Option<String> {
        self.tables
            .read()
            .get(table)
            .and_then(|t| t.get(key))
            .map(|r| r.value.clone())
    }

    /// Keys of every upsert that reached `table`, in arrival order.
    #[must_use]
    pub fn upserted_keys(&self, table: &str) -> Vec<String> {
        self.upserts
            .lock()
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, r)| r.key.clone())
            .collect()
    }

    /// Keys of every delete that reached `table`, in arrival order.
    #[must_use]
    pub fn deleted_keys(&self, table: &str) -> Vec<String> {
        self.deletes
            .lock()
            .iter()
            .filter(|(t, _)| t == table)
            .map(|(_, k)| k.clone())
            .collect()
    }

    /// Write a row without going through the upsert log, as if another
    /// client had written it. Still fans out a change event.
    pub fn seed(&self, table: &str, row: Row) {
        let previous = self
            .tables
            .write()
            .entry(table.to_owned())
            .or_default()
            .insert(row.key.clone(), row.clone());
        self.publish(table, ChangeEvent::upserted(row, previous));
    }

    fn check(&self) -> Result<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(Error::Remote("backend unavailable".into()))
        }
    }

    fn publish(&self, table: &str, event: ChangeEvent) {
        // No subscribers is fine.
        let _ = self.events.send((table.to_owned(), event));
    }
}

#[async_trait]
impl RemoteBackend for MemoryBackend {
    async fn select(&self, table: &str) -> Result<Vec<Row>> {
        self.check()?;
        Ok(self
            .tables
            .read()
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn select_one(&self, table: &str, key: &str) -> Result<Row> {
        self.check()?;
        self.tables
            .read()
            .get(table)
            .and_then(|t| t.get(key))
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_owned()))
    }

    async fn upsert(&self, table: &str, row: Row) -> Result<()> {
        self.check()?;
        self.upserts.lock().push((table.to_owned(), row.clone()));
        // Hold the write lock across publish so feed order matches table order.
        let mut tables = self.tables.write();
        let previous = tables
            .entry(table.to_owned())
            .or_default()
            .insert(row.key.clone(), row.clone());
        self.publish(table, ChangeEvent::upserted(row, previous));
        Ok(())
    }

    async fn delete(&self, table: &str, key: &str) -> Result<()> {
        self.check()?;
        self.deletes.lock().push((table.to_owned(), key.to_owned()));
        let mut tables = self.tables.write();
        if let Some(old) = tables.get_mut(table).and_then(|t| t.remove(key)) {
            self.publish(table, ChangeEvent::deleted(old));
        }
        Ok(())
    }

    async fn subscribe(&self, table: &str, filter: ChangeFilter) -> Result<ChangeStream> {
        self.check()?;
        let table = table.to_owned();
        let stream = BroadcastStream::new(self.events.subscribe()).filter_map(move |item| {
            let out = match item {
                Ok((t, event)) if t == table && filter.matches(&event) => Some(event),
                Ok(_) => None,
                Err(lagged) => {
                    tracing::warn!(error = %lagged, "change feed lagged, events dropped");
                    None
                }
            };
            futures::future::ready(out)
        });
        Ok(stream.boxed())
    }
}

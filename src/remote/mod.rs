//! The hosted key-value table the shim mirrors to.
//!
//! Only a narrow contract is consumed: full scan, point read, upsert, delete
//! and a change feed filtered by table or by key.

pub mod memory;
pub mod rest;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use memory::MemoryBackend;
pub use rest::RestBackend;

/// One row of the remote table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    /// Entry key, unique within the table.
    pub key: String,
    /// Opaque value. Callers do their own JSON encoding.
    pub value: String,
    /// Write time, bookkeeping only. Not used to resolve conflicts.
    pub updated_at: DateTime<Utc>,
}

impl Row {
    /// Row stamped with the current time.
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            updated_at: Utc::now(),
        }
    }
}

/// What happened to a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    /// A new row was created.
    Insert,
    /// An existing row was replaced.
    Update,
    /// A row was removed.
    Delete,
}

/// A change pushed by the remote feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Insert, update or delete.
    pub kind: ChangeKind,
    /// Row after the change. Absent for deletes.
    pub new_row: Option<Row>,
    /// Row before the change, when the backend reports it.
    pub old_row: Option<Row>,
}

impl ChangeEvent {
    /// Insert or update event for `row`.
    pub fn upserted(row: Row, previous: Option<Row>) -> Self {
        let kind = if previous.is_some() {
            ChangeKind::Update
        } else {
            ChangeKind::Insert
        };
        Self {
            kind,
            new_row: Some(row),
            old_row: previous,
        }
    }

    /// Delete event for `row`.
    pub fn deleted(row: Row) -> Self {
        Self {
            kind: ChangeKind::Delete,
            new_row: None,
            old_row: Some(row),
        }
    }

    /// Key this event is about, taken from whichever row is present.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        self.new_row
            .as_ref()
            .or(self.old_row.as_ref())
            .map(|r| r.key.as_str())
    }
}

/// Which changes a subscription wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeFilter {
    /// Every change in the table.
    All,
    /// Only changes to one key.
    Key(String),
}

impl ChangeFilter {
    /// `true` if `event` passes the filter.
    #[must_use]
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match self {
            ChangeFilter::All => true,
            ChangeFilter::Key(k) => event.key() == Some(k.as_str()),
        }
    }
}

/// Live change feed. Dropping it unsubscribes.
pub type ChangeStream = BoxStream<'static, ChangeEvent>;

/// Client for the hosted table.
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Every row in `table`.
    async fn select(&self, table: &str) -> Result<Vec<Row>>;

    /// The row for `key`, or [`Error::NotFound`](crate::Error::NotFound).
    async fn select_one(&self, table: &str, key: &str) -> Result<Row>;

    /// Create or replace the row with `row.key`.
    async fn upsert(&self, table: &str, row: Row) -> Result<()>;

    /// Delete the row for `key`. Deleting a missing row is not an error.
    async fn delete(&self, table: &str, key: &str) -> Result<()>;

    /// Open a change feed on `table`.
    async fn subscribe(&self, table: &str, filter: ChangeFilter) -> Result<ChangeStream>;
}

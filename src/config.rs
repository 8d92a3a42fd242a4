//! Serde-loadable settings for a sync session.
//!
//! ```json
//! {
//!   "table": "kv_store",
//!   "session_local_keys": ["draftAdmission"],
//!   "durable": { "path": "session.json", "flush": { "mode": "async", "interval_ms": 500 } },
//!   "rest": { "url": "https://project.example.co", "api_key": "anon-key" }
//! }
//! ```

use crate::classify::KeyClassifier;
use crate::error::{Error, Result};
use crate::local::{DurableStore, FlushPolicy};
use crate::remote::RestBackend;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Remote table used when none is configured.
pub const DEFAULT_TABLE: &str = "kv_store";

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Remote table holding the `(key, value, updated_at)` rows.
    pub table: String,
    /// Buffer size of the notification bus.
    pub event_capacity: usize,
    /// Keep the built-in session-local naming conventions.
    pub default_deny_list: bool,
    /// Exact keys that never leave the session.
    pub session_local_keys: Vec<String>,
    /// Extra case-insensitive regexes for session-local keys.
    pub session_local_patterns: Vec<String>,
    /// File-backed local store. `None` means in-memory.
    pub durable: Option<DurableConfig>,
    /// Hosted REST backend. `None` leaves the backend to the caller.
    pub rest: Option<RestConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            table: DEFAULT_TABLE.to_owned(),
            event_capacity: 256,
            default_deny_list: true,
            session_local_keys: Vec::new(),
            session_local_patterns: Vec::new(),
            durable: None,
            rest: None,
        }
    }
}

/// Where and how the local store persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableConfig {
    /// JSON file path.
    pub path: PathBuf,
    /// When to write the file.
    #[serde(default)]
    pub flush: FlushSetting,
    /// Indent the JSON.
    #[serde(default)]
    pub pretty: bool,
}

/// Serializable form of [`FlushPolicy`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FlushSetting {
    /// Write after every change.
    Immediate,
    /// Background writes on a timer.
    Async {
        /// Timer period in milliseconds.
        interval_ms: u64,
    },
    /// Write only on explicit flush.
    #[default]
    Manual,
}

impl From<FlushSetting> for FlushPolicy {
    fn from(setting: FlushSetting) -> Self {
        match setting {
            FlushSetting::Immediate => FlushPolicy::Immediate,
            FlushSetting::Async { interval_ms } => {
                FlushPolicy::Async(Duration::from_millis(interval_ms))
            }
            FlushSetting::Manual => FlushPolicy::Manual,
        }
    }
}

/// Hosted backend endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestConfig {
    /// Project base URL, without the `/rest/v1` suffix.
    pub url: String,
    /// Anon or service key sent as `apikey` and bearer token.
    pub api_key: String,
    /// Change-feed poll period in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl SyncConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let cfg: SyncConfig =
            serde_json::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Read, parse and validate a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&raw)
    }

    /// Reject settings that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.table.trim().is_empty() {
            return Err(Error::Config("table name must not be empty".into()));
        }
        if let Some(rest) = &self.rest {
            if !(rest.url.starts_with("http://") || rest.url.starts_with("https://")) {
                return Err(Error::Config(format!("invalid backend url `{}`", rest.url)));
            }
            if rest.poll_interval_ms == 0 {
                return Err(Error::Config("poll_interval_ms must be positive".into()));
            }
        }
        if let Some(FlushSetting::Async { interval_ms: 0 }) = self.durable.as_ref().map(|d| d.flush) {
            return Err(Error::Config("flush interval_ms must be positive".into()));
        }
        Ok(())
    }

    /// Classifier described by the deny-list settings.
    pub fn classifier(&self) -> Result<KeyClassifier> {
        let mut builder = KeyClassifier::builder().defaults(self.default_deny_list);
        for key in &self.session_local_keys {
            builder = builder.session_local_key(key.clone());
        }
        for pattern in &self.session_local_patterns {
            builder = builder.pattern(pattern.clone());
        }
        builder.build()
    }

    /// Open the configured durable store, if any.
    pub fn open_durable(&self) -> Result<Option<DurableStore>> {
        self.durable
            .as_ref()
            .map(|d| {
                DurableStore::builder(&d.path)
                    .policy(d.flush.into())
                    .pretty(d.pretty)
                    .build()
            })
            .transpose()
    }

    /// REST backend for the configured endpoint, if any.
    #[must_use]
    pub fn rest_backend(&self) -> Option<RestBackend> {
        self.rest.as_ref().map(|r| {
            RestBackend::new(&r.url, &r.api_key)
                .poll_interval(Duration::from_millis(r.poll_interval_ms))
        })
    }
}

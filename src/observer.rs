//! Hook for failures the shim absorbs instead of returning.
//!
//! Remote errors never reach application code. They are handed to a
//! [`SyncObserver`] so they can still be logged, counted or asserted on.

use crate::error::Error;
use std::fmt;

/// A failure the shim swallowed.
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFailure {
    /// Startup bulk load failed; the session runs local-only.
    BulkLoad {
        /// Underlying error.
        error: Error,
    },
    /// Opening a change feed failed.
    Subscribe {
        /// Key the feed was scoped to, `None` for the table-wide feed.
        key: Option<String>,
        /// Underlying error.
        error: Error,
    },
    /// A point read from the remote table failed.
    Read {
        /// Key being read.
        key: String,
        /// Underlying error.
        error: Error,
    },
    /// Mirroring a write to the remote table failed.
    Upsert {
        /// Key being written.
        key: String,
        /// Underlying error.
        error: Error,
    },
    /// Mirroring a delete to the remote table failed.
    Delete {
        /// Key being deleted.
        key: String,
        /// Underlying error.
        error: Error,
    },
    /// A value could not be decoded or encoded as JSON.
    Codec {
        /// Key whose value was bad.
        key: String,
        /// Underlying error.
        error: Error,
    },
    /// Writing a remote change into the local store failed.
    LocalWrite {
        /// Key being written.
        key: String,
        /// Underlying error.
        error: Error,
    },
    /// A write had to be mirrored but no async runtime was running.
    NoRuntime {
        /// Key that stayed local.
        key: String,
    },
}

impl SyncFailure {
    /// Key involved, if the failure is about one key.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            SyncFailure::BulkLoad { .. } => None,
            SyncFailure::Subscribe { key, .. } => key.as_deref(),
            SyncFailure::Read { key, .. }
            | SyncFailure::Upsert { key, .. }
            | SyncFailure::Delete { key, .. }
            | SyncFailure::Codec { key, .. }
            | SyncFailure::LocalWrite { key, .. }
            | SyncFailure::NoRuntime { key } => Some(key),
        }
    }
}

impl fmt::Display for SyncFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncFailure::BulkLoad { error } => write!(f, "bulk load failed: {error}"),
            SyncFailure::Subscribe { key: None, error } => {
                write!(f, "table subscription failed: {error}")
            }
            SyncFailure::Subscribe {
                key: Some(key),
                error,
            } => write!(f, "subscription to `{key}` failed: {error}"),
            SyncFailure::Read { key, error } => write!(f, "read of `{key}` failed: {error}"),
            SyncFailure::Upsert { key, error } => write!(f, "upsert of `{key}` failed: {error}"),
            SyncFailure::Delete { key, error } => write!(f, "delete of `{key}` failed: {error}"),
            SyncFailure::Codec { key, error } => write!(f, "bad value for `{key}`: {error}"),
            SyncFailure::LocalWrite { key, error } => {
                write!(f, "local write of `{key}` failed: {error}")
            }
            SyncFailure::NoRuntime { key } => write!(f, "no runtime to mirror `{key}`"),
        }
    }
}

/// Receives every absorbed failure.
pub trait SyncObserver: Send + Sync {
    /// Called once per failure, on whatever task hit it.
    fn on_failure(&self, failure: &SyncFailure);
}

/// Default observer: logs with `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl SyncObserver for TracingObserver {
    fn on_failure(&self, failure: &SyncFailure) {
        match failure {
            // Missing rows are the normal path for never-synced keys.
            SyncFailure::Read {
                key,
                error: Error::NotFound(_),
            } => tracing::debug!(key = %key, "no remote row, using local value"),
            other => tracing::warn!(key = other.key().unwrap_or("-"), "{other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_is_reported_for_per_key_failures() {
        let bulk = SyncFailure::BulkLoad {
            error: Error::Remote("down".into()),
        };
        let feed = SyncFailure::Subscribe {
            key: Some("gallery".into()),
            error: Error::Remote("down".into()),
        };
        assert_eq!(bulk.key(), None);
        assert_eq!(feed.key(), Some("gallery"));
        assert_eq!(
            SyncFailure::NoRuntime {
                key: "admissions".into()
            }
            .key(),
            Some("admissions")
        );
    }

    #[test]
    fn display_names_the_key_and_cause() {
        let failure = SyncFailure::Upsert {
            key: "course-list".into(),
            error: Error::Remote("503 Service Unavailable".into()),
        };
        let text = failure.to_string();
        assert!(text.contains("`course-list`"), "{text}");
        assert!(text.contains("503"), "{text}");
    }

    #[test]
    fn tracing_observer_accepts_every_kind() {
        let observer = TracingObserver;
        observer.on_failure(&SyncFailure::Read {
            key: "gallery".into(),
            error: Error::NotFound("gallery".into()),
        });
        observer.on_failure(&SyncFailure::Codec {
            key: "gallery".into(),
            error: Error::Decode("expected value".into()),
        });
    }
}

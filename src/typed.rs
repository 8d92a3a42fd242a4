//! JSON-aware accessors: the API most application code should use.
//!
//! Unlike the raw shim, these talk to the remote table directly and wait for
//! it, falling back to the local store whenever it cannot answer. None of
//! them return errors; failures go to the shim's observer.

use crate::error::Error;
use crate::local::LocalStore;
use crate::observer::SyncFailure;
use crate::remote::{ChangeFilter, ChangeKind};
use crate::shim::SyncShim;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::AbortHandle;

/// Typed view over a [`SyncShim`]. Get one with [`SyncShim::typed`].
pub struct TypedStore<L> {
    shim: SyncShim<L>,
}

impl<L> Clone for TypedStore<L> {
    fn clone(&self) -> Self {
        Self {
            shim: self.shim.clone(),
        }
    }
}

impl<L> std::fmt::Debug for TypedStore<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedStore").field("shim", &self.shim).finish()
    }
}

impl<L: LocalStore + 'static> TypedStore<L> {
    pub(crate) fn new(shim: SyncShim<L>) -> Self {
        Self { shim }
    }

    /// The shim underneath.
    #[must_use]
    pub fn shim(&self) -> &SyncShim<L> {
        &self.shim
    }

    /// Read `key`, preferring the remote row.
    ///
    /// On a remote hit the raw value is mirrored locally. On any failure
    /// (unreachable backend, missing row, undecodable value) the local value
    /// is used, and `default` when that is absent or undecodable too.
    /// Session-local keys, keys with a write still on its way to the remote
    /// table, and keys whose last mirror failed are read locally.
    pub async fn read<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        let shared = &self.shim.shared;
        let remote_is_current = shared.classifier.should_sync(key)
            && !self.shim.is_unsynced(key)
            && !shared.is_mirroring(key);
        if remote_is_current {
            match shared.remote.select_one(&shared.table, key).await {
                Ok(row) => match serde_json::from_str::<T>(&row.value) {
                    Ok(value) => {
                        if let Err(error) = shared.store_remote_value(key, Some(&row.value)) {
                            shared.report(SyncFailure::LocalWrite {
                                key: key.to_owned(),
                                error,
                            });
                        }
                        return value;
                    }
                    Err(e) => shared.report(SyncFailure::Codec {
                        key: key.to_owned(),
                        error: Error::from(e),
                    }),
                },
                Err(error) => shared.report(SyncFailure::Read {
                    key: key.to_owned(),
                    error,
                }),
            }
        }
        self.read_local(key).unwrap_or(default)
    }

    /// Decode `key` from the local side only.
    pub fn read_local<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.shim.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                self.shim.shared.report(SyncFailure::Codec {
                    key: key.to_owned(),
                    error: Error::from(e),
                });
                None
            }
        }
    }

    /// Encode `value`, write it locally, then upsert it remotely.
    ///
    /// The local write happens first and unconditionally, so this session sees
    /// the value at once. Returns `false` if encoding, the local write, or
    /// the remote upsert failed. Session-local keys never touch the remote
    /// table and return `true` once stored locally.
    pub async fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> bool {
        let shared = &self.shim.shared;
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                shared.report(SyncFailure::Codec {
                    key: key.to_owned(),
                    error: Error::Encode(e.to_string()),
                });
                return false;
            }
        };
        if let Err(error) = shared.store_if_changed(key, Some(&raw)) {
            shared.report(SyncFailure::LocalWrite {
                key: key.to_owned(),
                error,
            });
            return false;
        }
        if !shared.classifier.should_sync(key) {
            return true;
        }

        let ticket = shared.begin_mirror(key);
        shared.mirror(ticket, key, Some(raw)).await
    }

    /// Delete `key` locally, then remotely. Returns `false` if either failed.
    /// Session-local keys are only deleted locally.
    pub async fn remove(&self, key: &str) -> bool {
        let shared = &self.shim.shared;
        if let Err(error) = shared.store_if_changed(key, None) {
            shared.report(SyncFailure::LocalWrite {
                key: key.to_owned(),
                error,
            });
            return false;
        }
        if !shared.classifier.should_sync(key) {
            return true;
        }

        let ticket = shared.begin_mirror(key);
        shared.mirror(ticket, key, None).await
    }

    /// Follow remote changes to one key.
    ///
    /// Each change is mirrored locally and handed to `callback`, `None` for a
    /// delete. Values that fail to decode are reported and skipped. A value
    /// identical to the last one delivered is not delivered again, so a
    /// session that writes and subscribes sees its own write once.
    ///
    /// Session-local keys have no remote changes to follow; subscribing to
    /// one returns an inactive handle.
    ///
    /// Dropping the returned [`Subscription`] leaves it running; call
    /// [`unsubscribe`](Subscription::unsubscribe) to stop it.
    pub async fn subscribe<T, F>(&self, key: &str, callback: F) -> Subscription
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Option<T>) + Send + Sync + 'static,
    {
        let shared = Arc::clone(&self.shim.shared);
        if !shared.classifier.should_sync(key) {
            tracing::debug!(key = %key, "not subscribing to session-local key");
            return Subscription::inert();
        }
        let filter = ChangeFilter::Key(key.to_owned());
        let mut stream = match shared.remote.subscribe(&shared.table, filter).await {
            Ok(stream) => stream,
            Err(error) => {
                shared.report(SyncFailure::Subscribe {
                    key: Some(key.to_owned()),
                    error,
                });
                return Subscription::inert();
            }
        };

        let key = key.to_owned();
        let mut last_delivered: Option<Option<String>> = None;
        let task = tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let raw = match event.kind {
                    ChangeKind::Insert | ChangeKind::Update => match event.new_row {
                        Some(row) => Some(row.value),
                        None => continue,
                    },
                    ChangeKind::Delete => None,
                };

                if last_delivered.as_ref() == Some(&raw) {
                    continue;
                }
                last_delivered = Some(raw.clone());

                let decoded = match raw.as_deref().map(|s| serde_json::from_str::<T>(s)) {
                    None => None,
                    Some(Ok(value)) => Some(value),
                    Some(Err(e)) => {
                        shared.report(SyncFailure::Codec {
                            key: key.clone(),
                            error: Error::from(e),
                        });
                        continue;
                    }
                };

                if let Err(error) = shared.store_remote_value(&key, raw.as_deref()) {
                    shared.report(SyncFailure::LocalWrite {
                        key: key.clone(),
                        error,
                    });
                }
                callback(decoded);
            }
        });

        Subscription::new(task.abort_handle())
    }
}

/// Handle returned by [`TypedStore::subscribe`].
#[derive(Debug, Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

#[derive(Debug)]
struct SubscriptionInner {
    task: Option<AbortHandle>,
    active: AtomicBool,
}

impl Subscription {
    fn new(task: AbortHandle) -> Self {
        Self {
            inner: Arc::new(SubscriptionInner {
                task: Some(task),
                active: AtomicBool::new(true),
            }),
        }
    }

    fn inert() -> Self {
        Self {
            inner: Arc::new(SubscriptionInner {
                task: None,
                active: AtomicBool::new(false),
            }),
        }
    }

    /// Stop delivering changes. Safe to call any number of times, from any
    /// clone.
    pub fn unsubscribe(&self) {
        if self.inner.active.swap(false, Ordering::SeqCst) {
            if let Some(task) = &self.inner.task {
                task.abort();
            }
        }
    }

    /// `false` once unsubscribed, or if the feed could not be opened.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }
}

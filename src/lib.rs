//! Key-value storage shared across sessions.
//!
//! A [`SyncShim`] wraps a session's [`LocalStore`] (the equivalent of a
//! browser's `localStorage`) and mirrors every syncable write to a hosted
//! table, while applying changes other sessions make as they arrive on the
//! table's change feed. Authentication flags, the signed-in user and UI
//! preferences stay per session (see [`KeyClassifier`]).
//!
//! ```rust,no_run
//! use shared_storage::{MemoryBackend, MemoryStore, SyncShim};
//! use std::sync::Arc;
//!
//! # async fn run() {
//! let remote = Arc::new(MemoryBackend::new());
//! let shim = SyncShim::builder(MemoryStore::new(), remote).build();
//! shim.init().await;
//!
//! let store = shim.typed();
//! store.write("course-list", &vec!["Biology"]).await;
//! let courses: Vec<String> = store.read("course-list", Vec::new()).await;
//! # }
//! ```
//!
//! Reads that hit the cache are synchronous. Writes update the local store
//! before any network call, so a session always sees its own writes at once.
//! Remote failures never reach the caller; they are reported to a
//! [`SyncObserver`] and the session carries on with its local data.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod classify;
pub mod config;
pub mod error;
pub mod local;
mod mirror;
pub mod notify;
pub mod observer;
pub mod remote;
pub mod shim;
pub mod typed;

pub use classify::KeyClassifier;
pub use config::SyncConfig;
pub use error::{Error, Result};
pub use local::{DurableStore, FlushPolicy, LocalStore, MemoryStore};
pub use notify::{ChangeNotification, ListenerId};
pub use observer::{SyncFailure, SyncObserver, TracingObserver};
pub use remote::{
    ChangeEvent, ChangeFilter, ChangeKind, ChangeStream, MemoryBackend, RemoteBackend, RestBackend,
    Row,
};
pub use shim::{InitOutcome, SyncShim, SyncShimBuilder};
pub use typed::{Subscription, TypedStore};

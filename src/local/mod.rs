//! The per-session durable store the shim writes through.
//!
//! [`LocalStore`] mirrors the shape of a browser's `localStorage`: synchronous,
//! string keys, string values. [`SyncShim`](crate::SyncShim) implements it too,
//! so code written against the trait gets cross-session sync without changes.

pub mod backend;
pub mod durable;
pub mod persist;

use crate::error::Result;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

pub use backend::MapBackend;
pub use durable::{DurableStore, DurableStoreBuilder, FlushPolicy};

/// Synchronous string key-value store.
pub trait LocalStore: Send + Sync {
    /// Value for `key`, or `None` if absent.
    fn get(&self, key: &str) -> Option<String>;

    /// Store `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete `key`. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// Delete every entry.
    fn clear(&self) -> Result<()>;

    /// Snapshot of all keys currently stored.
    fn keys(&self) -> Vec<String>;
}

impl<T: LocalStore + ?Sized> LocalStore for Arc<T> {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }

    fn clear(&self) -> Result<()> {
        (**self).clear()
    }

    fn keys(&self) -> Vec<String> {
        (**self).keys()
    }
}

/// Volatile in-memory store. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    map: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// `true` when the store has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl LocalStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.map.read().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.map.write().insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.map.write().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.map.write().clear();
        Ok(())
    }

    fn keys(&self) -> Vec<String> {
        self.map.read().keys().cloned().collect()
    }
}

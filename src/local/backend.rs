//! Concurrent maps that can hold a [`DurableStore`](super::DurableStore)'s entries.
//!
//! Implement [`MapBackend`] to bring your own map.

use std::collections::HashMap;

/// String-to-string map a durable store keeps its entries in.
///
/// Every method works with owned strings so the store does not care how the
/// backend stores things internally. Backends that keep values behind an
/// `Arc` (like ShardMap) clone on read.
pub trait MapBackend: Send + Sync {
    /// Insert a pair, returning the previous value if any.
    fn insert(&self, key: String, value: String) -> Option<String>;

    /// Look up a value.
    fn get(&self, key: &str) -> Option<String>;

    /// Remove a key, returning its value if it was present.
    fn remove(&self, key: &str) -> Option<String>;

    /// Consistent snapshot of all entries. Must not hold locks that would
    /// block concurrent writers once returned.
    fn snapshot(&self) -> Vec<(String, String)>;

    /// Number of entries.
    fn map_len(&self) -> usize {
        self.snapshot().len()
    }

    /// Drop all entries. The default does snapshot + remove; override with
    /// the backend's native clear when there is one.
    fn clear(&self) {
        for (k, _) in self.snapshot() {
            self.remove(&k);
        }
    }
}

// ---- ShardMap ----------------------------------------------------------------

impl MapBackend for shardmap::ShardMap<String, String> {
    fn insert(&self, key: String, value: String) -> Option<String> {
        shardmap::ShardMap::insert(self, key, value).map(|arc| (*arc).clone())
    }

    fn get(&self, key: &str) -> Option<String> {
        shardmap::ShardMap::get(self, &key.to_owned()).map(|arc| (*arc).clone())
    }

    fn remove(&self, key: &str) -> Option<String> {
        shardmap::ShardMap::remove(self, &key.to_owned()).map(|arc| (*arc).clone())
    }

    fn snapshot(&self) -> Vec<(String, String)> {
        self.iter_snapshot()
            .map(|(k, arc_v)| (k, (*arc_v).clone()))
            .collect()
    }

    fn map_len(&self) -> usize {
        self.len()
    }
}

// ---- RwLock<HashMap> ---------------------------------------------------------

impl MapBackend for parking_lot::RwLock<HashMap<String, String>> {
    fn insert(&self, key: String, value: String) -> Option<String> {
        self.write().insert(key, value)
    }

    fn get(&self, key: &str) -> Option<String> {
        self.read().get(key).cloned()
    }

    fn remove(&self, key: &str) -> Option<String> {
        self.write().remove(key)
    }

    fn snapshot(&self) -> Vec<(String, String)> {
        self.read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn map_len(&self) -> usize {
        self.read().len()
    }

    fn clear(&self) {
        self.write().clear()
    }
}

// ---- DashMap (feature-gated) -------------------------------------------------

#[cfg(feature = "dashmap")]
impl MapBackend for dashmap::DashMap<String, String> {
    fn insert(&self, key: String, value: String) -> Option<String> {
        dashmap::DashMap::insert(self, key, value)
    }

    fn get(&self, key: &str) -> Option<String> {
        dashmap::DashMap::get(self, key).map(|r| r.value().clone())
    }

    fn remove(&self, key: &str) -> Option<String> {
        dashmap::DashMap::remove(self, key).map(|(_, v)| v)
    }

    fn snapshot(&self) -> Vec<(String, String)> {
        self.iter()
            .map(|r| (r.key().clone(), r.value().clone()))
            .collect()
    }

    fn map_len(&self) -> usize {
        self.len()
    }

    fn clear(&self) {
        dashmap::DashMap::clear(self)
    }
}

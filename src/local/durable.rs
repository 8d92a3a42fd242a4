//! JSON-file-backed [`LocalStore`], its builder and flush policies.

use super::backend::MapBackend;
use super::persist::{atomic_write, encode, load};
use super::LocalStore;
use crate::error::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

/// Controls when a [`DurableStore`] is written to disk.
#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum FlushPolicy {
    /// Write after every set/remove/clear.
    Immediate,
    /// A background thread writes pending changes every interval, and once
    /// more when the store is dropped.
    Async(Duration),
    /// Only write on an explicit `flush()`.
    #[default]
    Manual,
}

/// Persistent string store, the on-disk counterpart of a browser's
/// `localStorage`.
///
/// Generic over the map backend `M` (ShardMap by default). Use
/// [`open`](Self::open) for a quick start or [`builder`](Self::builder) to pick
/// a flush policy and output format.
///
/// **Single-process only.** Two processes opening the same file will clobber
/// each other.
pub struct DurableStore<M = shardmap::ShardMap<String, String>> {
    map: Arc<M>,
    path: PathBuf,
    pretty: bool,
    policy: FlushPolicy,
    writer: Option<AsyncWriter>,
}

impl<M> DurableStore<M>
where
    M: MapBackend + Default + 'static,
{
    /// Open (or create) a store at `path` with manual flush and compact JSON.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::builder(path).build()
    }

    /// Start configuring a store. Call [`.build()`](DurableStoreBuilder::build)
    /// when ready.
    pub fn builder(path: impl AsRef<Path>) -> DurableStoreBuilder<M> {
        DurableStoreBuilder::new(path)
    }
}

impl<M: MapBackend + 'static> DurableStore<M> {
    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.map_len()
    }

    /// `true` when the store has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Path to the backing JSON file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Active flush policy.
    #[must_use]
    pub fn policy(&self) -> &FlushPolicy {
        &self.policy
    }

    /// Write the current contents to disk (temp file + rename).
    pub fn flush(&self) -> Result<()> {
        write_snapshot(self.map.as_ref(), &self.path, self.pretty)
    }

    fn after_mutation(&self) -> Result<()> {
        match &self.policy {
            FlushPolicy::Immediate => self.flush(),
            FlushPolicy::Async(_) => {
                if let Some(writer) = &self.writer {
                    writer.mark_dirty();
                }
                Ok(())
            }
            FlushPolicy::Manual => Ok(()),
        }
    }
}

impl<M: MapBackend + 'static> LocalStore for DurableStore<M> {
    fn get(&self, key: &str) -> Option<String> {
        self.map.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.map.insert(key.to_owned(), value.to_owned());
        self.after_mutation()
    }

    fn remove(&self, key: &str) -> Result<()> {
        if self.map.remove(key).is_some() {
            self.after_mutation()?;
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.map.clear();
        self.after_mutation()
    }

    fn keys(&self) -> Vec<String> {
        self.map.snapshot().into_iter().map(|(k, _)| k).collect()
    }
}

impl<M> std::fmt::Debug for DurableStore<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStore")
            .field("path", &self.path)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn write_snapshot<M: MapBackend>(map: &M, path: &Path, pretty: bool) -> Result<()> {
    let data: HashMap<String, String> = map.snapshot().into_iter().collect();
    let bytes = encode(&data, pretty)?;
    atomic_write(path, &bytes)
}

/// Thread behind [`FlushPolicy::Async`]. Writes only when something changed
/// since the last successful write.
struct AsyncWriter {
    dirty: Arc<AtomicBool>,
    // Dropping the sender tells the thread to write once more and exit.
    stop: Option<mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl AsyncWriter {
    fn spawn<M: MapBackend + 'static>(
        map: Arc<M>,
        path: PathBuf,
        pretty: bool,
        every: Duration,
    ) -> Result<Self> {
        let dirty = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&dirty);
        let (stop, stopped) = mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("durable-flush".into())
            .spawn(move || {
                let write_pending = || {
                    if !flag.swap(false, Ordering::AcqRel) {
                        return;
                    }
                    if let Err(e) = write_snapshot(map.as_ref(), &path, pretty) {
                        flag.store(true, Ordering::Release);
                        tracing::warn!(path = %path.display(), error = %e, "background flush failed");
                    }
                };
                while let Err(mpsc::RecvTimeoutError::Timeout) = stopped.recv_timeout(every) {
                    write_pending();
                }
                write_pending();
            })?;

        Ok(Self {
            dirty,
            stop: Some(stop),
            thread: Some(thread),
        })
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

impl Drop for AsyncWriter {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("durable flush thread panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures and opens a [`DurableStore`].
///
/// ```rust,no_run
/// use shared_storage::local::{DurableStore, FlushPolicy};
///
/// let store: DurableStore = DurableStore::builder("session.json")
///     .policy(FlushPolicy::Immediate)
///     .pretty(true)
///     .build()
///     .unwrap();
/// ```
pub struct DurableStoreBuilder<M> {
    path: PathBuf,
    policy: FlushPolicy,
    pretty: bool,
    _marker: std::marker::PhantomData<M>,
}

impl<M> DurableStoreBuilder<M>
where
    M: MapBackend + Default + 'static,
{
    fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            policy: FlushPolicy::Manual,
            pretty: false,
            _marker: std::marker::PhantomData,
        }
    }

    /// Set the flush policy (default: [`FlushPolicy::Manual`]).
    pub fn policy(mut self, policy: FlushPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Write indented JSON (default: compact).
    pub fn pretty(mut self, yes: bool) -> Self {
        self.pretty = yes;
        self
    }

    /// Load (or create) the store.
    pub fn build(self) -> Result<DurableStore<M>> {
        let map = Arc::new(M::default());
        for (k, v) in load(&self.path)? {
            map.insert(k, v);
        }

        let writer = match &self.policy {
            FlushPolicy::Async(every) => Some(AsyncWriter::spawn(
                Arc::clone(&map),
                self.path.clone(),
                self.pretty,
                *every,
            )?),
            _ => None,
        };

        tracing::debug!(path = %self.path.display(), entries = map.map_len(), "durable store opened");

        Ok(DurableStore {
            map,
            path: self.path,
            pretty: self.pretty,
            policy: self.policy,
            writer,
        })
    }
}

impl<M> std::fmt::Debug for DurableStoreBuilder<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableStoreBuilder")
            .field("path", &self.path)
            .field("policy", &self.policy)
            .field("pretty", &self.pretty)
            .finish()
    }
}

//! Write-through cache that makes a [`LocalStore`] behave as if it were
//! shared across sessions.
//!
//! Every syncable write lands in the local store first, then is mirrored to
//! the remote table on a background task. Changes other sessions make arrive
//! on the remote change feed and are applied locally. Both paths emit a
//! [`ChangeNotification`].
//!
//! Conflicts resolve last-write-wins: whichever remote event arrives last
//! overwrites the cache. There is no version check.

use crate::classify::KeyClassifier;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::local::LocalStore;
use crate::mirror::{MirrorLanes, MirrorTicket};
use crate::notify::{ChangeNotification, ListenerId, Notifier};
use crate::observer::{SyncFailure, SyncObserver, TracingObserver};
use crate::remote::{ChangeEvent, ChangeFilter, ChangeKind, RemoteBackend, Row};
use crate::typed::TypedStore;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// What [`SyncShim::init`] managed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// Bulk load succeeded; `rows` syncable rows were cached.
    Synced {
        /// Syncable rows loaded.
        rows: usize,
    },
    /// The remote table was unreachable; the session runs on its local store.
    LocalOnly,
    /// `init` had already run. Nothing was done.
    AlreadyInitialized,
}

/// Cache slot. `None` records a known deletion, so a read resolves to
/// absence instead of falling through to whatever the local store holds.
type Slot = Option<String>;

pub(crate) struct Shared<L> {
    pub(crate) local: L,
    pub(crate) remote: Arc<dyn RemoteBackend>,
    pub(crate) table: String,
    pub(crate) classifier: KeyClassifier,
    pub(crate) observer: Arc<dyn SyncObserver>,
    notifier: Notifier,
    cache: RwLock<HashMap<String, Slot>>,
    unsynced: Mutex<HashSet<String>>,
    mirrors: MirrorLanes,
    initialized: AtomicBool,
    pending: Mutex<Vec<JoinHandle<()>>>,
    feed: Mutex<Option<JoinHandle<()>>>,
}

impl<L> Drop for Shared<L> {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.get_mut().take() {
            feed.abort();
        }
    }
}

thread_local! {
    // Shims whose remote change is being applied on this thread.
    static APPLYING: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Marks the current thread as applying a remote change to one shim.
/// Listeners run synchronously inside the apply, so any write they make
/// happens while the mark is set. Unmarked on drop, even on panic.
struct ApplyingGuard(usize);

impl ApplyingGuard {
    fn enter(id: usize) -> Self {
        APPLYING.with(|a| a.borrow_mut().push(id));
        Self(id)
    }

    fn active(id: usize) -> bool {
        APPLYING.with(|a| a.borrow().contains(&id))
    }
}

impl Drop for ApplyingGuard {
    fn drop(&mut self) {
        APPLYING.with(|a| {
            let mut a = a.borrow_mut();
            if let Some(pos) = a.iter().rposition(|&id| id == self.0) {
                a.remove(pos);
            }
        });
    }
}

/// Sync layer over a local store `L`.
///
/// Cheap to clone; clones share one cache and one change feed. Build with
/// [`builder`](Self::builder), then call [`init`](Self::init) once before use.
/// After that every read and write should go through the shim. Writing to
/// the wrapped store directly makes cache and store diverge silently.
pub struct SyncShim<L> {
    pub(crate) shared: Arc<Shared<L>>,
}

impl<L> Clone for SyncShim<L> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<L: LocalStore + 'static> SyncShim<L> {
    /// Start configuring a shim over `local`, mirroring to `remote`.
    pub fn builder(local: L, remote: Arc<dyn RemoteBackend>) -> SyncShimBuilder<L> {
        SyncShimBuilder::new(local, remote)
    }

    /// Load the remote table into the cache and start listening for changes.
    ///
    /// Never fails: an unreachable backend yields [`InitOutcome::LocalOnly`]
    /// and the failure goes to the observer. A second call is a no-op.
    pub async fn init(&self) -> InitOutcome {
        let shared = &self.shared;
        if shared.initialized.swap(true, Ordering::SeqCst) {
            return InitOutcome::AlreadyInitialized;
        }

        let outcome = match shared.remote.select(&shared.table).await {
            Ok(rows) => InitOutcome::Synced {
                rows: shared.seed(rows),
            },
            Err(error) => {
                shared.report(SyncFailure::BulkLoad { error });
                InitOutcome::LocalOnly
            }
        };

        match shared.remote.subscribe(&shared.table, ChangeFilter::All).await {
            Ok(mut stream) => {
                let weak: Weak<Shared<L>> = Arc::downgrade(shared);
                let feed = tokio::spawn(async move {
                    while let Some(event) = stream.next().await {
                        let Some(shared) = weak.upgrade() else { break };
                        shared.apply_remote(event);
                    }
                });
                *shared.feed.lock() = Some(feed);
            }
            Err(error) => shared.report(SyncFailure::Subscribe { key: None, error }),
        }

        tracing::debug!(table = %shared.table, ?outcome, "sync shim initialized");
        outcome
    }

    /// `true` once [`init`](Self::init) has run.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.shared.initialized.load(Ordering::SeqCst)
    }

    /// Cached value, or the local store's for keys the cache has never seen.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.shared.current(key)
    }

    /// Write locally, notify, and mirror to the remote table in the background
    /// when the key is syncable. Only local-store errors are returned.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let old = self.shared.store(key, Some(value))?;
        if self.shared.should_mirror(key) {
            self.shared.spawn_mirror(key, Some(value.to_owned()));
        }
        self.shared.notify(key, Some(value.to_owned()), old);
        Ok(())
    }

    /// Symmetric to [`set`](Self::set), with a remote delete.
    pub fn remove(&self, key: &str) -> Result<()> {
        let old = self.shared.store(key, None)?;
        if self.shared.should_mirror(key) {
            self.shared.spawn_mirror(key, None);
        }
        self.shared.notify(key, None, old);
        Ok(())
    }

    /// Delete every key this session knows through the cache, remotely too
    /// when syncable, then clear the local store. Emits one notification per
    /// key that had a value. Keys the cache never saw are not deleted
    /// remotely.
    pub fn clear(&self) -> Result<()> {
        let shared = &self.shared;
        let known: Vec<(String, Slot)> = {
            let mut cache = shared.cache.write();
            let snapshot = cache.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            for slot in cache.values_mut() {
                *slot = None;
            }
            snapshot
        };
        shared.local.clear()?;

        for (key, old) in known {
            let Some(old) = old else { continue };
            if shared.should_mirror(&key) {
                shared.spawn_mirror(&key, None);
            }
            shared.notify(&key, None, Some(old));
        }
        Ok(())
    }

    /// Keys visible through the shim: cached live keys plus local-only keys.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        let cache = self.shared.cache.read();
        let mut keys: Vec<String> = cache
            .iter()
            .filter(|(_, v)| v.is_some())
            .map(|(k, _)| k.clone())
            .collect();
        keys.extend(
            self.shared
                .local
                .keys()
                .into_iter()
                .filter(|k| !cache.contains_key(k)),
        );
        keys
    }

    /// `true` if `key` is mirrored to the remote table.
    #[must_use]
    pub fn should_sync(&self, key: &str) -> bool {
        self.shared.classifier.should_sync(key)
    }

    /// `true` if the last remote mirror of `key` failed and has not since
    /// succeeded.
    #[must_use]
    pub fn is_unsynced(&self, key: &str) -> bool {
        self.shared.unsynced.lock().contains(key)
    }

    /// `true` while a write of `key` is still on its way to the remote table.
    #[must_use]
    pub fn is_mirroring(&self, key: &str) -> bool {
        self.shared.is_mirroring(key)
    }

    /// Register a synchronous change listener.
    pub fn add_listener<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&ChangeNotification) + Send + Sync + 'static,
    {
        self.shared.notifier.add_listener(f)
    }

    /// Unregister a listener. Returns `false` if it was already gone.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.shared.notifier.remove_listener(id)
    }

    /// Receiver on the notification bus.
    pub fn events(&self) -> broadcast::Receiver<ChangeNotification> {
        self.shared.notifier.events()
    }

    /// JSON-aware accessors sharing this shim's cache.
    #[must_use]
    pub fn typed(&self) -> TypedStore<L> {
        TypedStore::new(self.clone())
    }

    /// Wait for every background mirror started so far.
    pub async fn settle(&self) {
        loop {
            let batch = std::mem::take(&mut *self.shared.pending.lock());
            if batch.is_empty() {
                return;
            }
            for handle in batch {
                let _ = handle.await;
            }
        }
    }

    /// Stop applying remote changes. Local reads and writes keep working.
    pub fn shutdown(&self) {
        if let Some(feed) = self.shared.feed.lock().take() {
            feed.abort();
        }
    }

    /// Apply one remote change as the feed would. Exposed for callers that
    /// run their own feed.
    pub fn apply_remote(&self, event: ChangeEvent) {
        self.shared.apply_remote(event);
    }
}

impl<L: LocalStore + 'static> LocalStore for SyncShim<L> {
    fn get(&self, key: &str) -> Option<String> {
        SyncShim::get(self, key)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        SyncShim::set(self, key, value)
    }

    fn remove(&self, key: &str) -> Result<()> {
        SyncShim::remove(self, key)
    }

    fn clear(&self) -> Result<()> {
        SyncShim::clear(self)
    }

    fn keys(&self) -> Vec<String> {
        SyncShim::keys(self)
    }
}

impl<L> std::fmt::Debug for SyncShim<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncShim")
            .field("table", &self.shared.table)
            .field("cached", &self.shared.cache.read().len())
            .field("initialized", &self.shared.initialized.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<L: LocalStore + 'static> Shared<L> {
    pub(crate) fn report(&self, failure: SyncFailure) {
        self.observer.on_failure(&failure);
    }

    pub(crate) fn current(&self, key: &str) -> Option<String> {
        if let Some(slot) = self.cache.read().get(key) {
            return slot.clone();
        }
        self.local.get(key)
    }

    /// Write `value` (or delete on `None`) to local store and cache. Returns
    /// the previous value.
    pub(crate) fn store(&self, key: &str, value: Option<&str>) -> Result<Option<String>> {
        let old = self.current(key);
        match value {
            Some(v) => self.local.set(key, v)?,
            None => self.local.remove(key)?,
        }
        self.cache
            .write()
            .insert(key.to_owned(), value.map(str::to_owned));
        Ok(old)
    }

    /// Like [`store`](Self::store) but a no-op when nothing changes. Emits a
    /// notification when something does. Returns whether it did.
    pub(crate) fn store_if_changed(&self, key: &str, value: Option<&str>) -> Result<bool> {
        if self.current(key).as_deref() == value {
            // Record deletions even when the store already lacked the key.
            self.cache
                .write()
                .insert(key.to_owned(), value.map(str::to_owned));
            return Ok(false);
        }
        let old = self.store(key, value)?;
        self.notify(key, value.map(str::to_owned), old);
        Ok(true)
    }

    /// [`store_if_changed`](Self::store_if_changed) for a value that came
    /// from the remote table. Writes listeners make in response are not
    /// mirrored back.
    pub(crate) fn store_remote_value(&self, key: &str, value: Option<&str>) -> Result<bool> {
        let _guard = ApplyingGuard::enter(self.id());
        self.store_if_changed(key, value)
    }

    pub(crate) fn notify(&self, key: &str, new_value: Option<String>, old_value: Option<String>) {
        self.notifier.emit(ChangeNotification {
            key: key.to_owned(),
            new_value,
            old_value,
        });
    }

    fn should_mirror(&self, key: &str) -> bool {
        if !self.classifier.should_sync(key) {
            return false;
        }
        // A listener reacting to a remote change wrote it back; the remote
        // already has it.
        !ApplyingGuard::active(self.id())
    }

    fn id(&self) -> usize {
        self as *const Self as usize
    }

    pub(crate) fn mark_synced(&self, key: &str, ok: bool) {
        let mut unsynced = self.unsynced.lock();
        if ok {
            unsynced.remove(key);
        } else {
            unsynced.insert(key.to_owned());
        }
    }

    /// Upsert (`Some`) or delete (`None`) on a background task.
    fn spawn_mirror(self: &Arc<Self>, key: &str, value: Option<String>) {
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                self.mark_synced(key, false);
                self.report(SyncFailure::NoRuntime {
                    key: key.to_owned(),
                });
                return;
            }
        };

        let ticket = self.mirrors.begin(key);
        let shared = Arc::clone(self);
        let key = key.to_owned();
        let task = handle.spawn(async move {
            shared.mirror(ticket, &key, value).await;
        });

        let mut pending = self.pending.lock();
        pending.retain(|h| !h.is_finished());
        pending.push(task);
    }

    /// Register a write of `key` whose remote call will follow.
    pub(crate) fn begin_mirror(&self, key: &str) -> MirrorTicket {
        self.mirrors.begin(key)
    }

    /// `true` while a write of `key` is still on its way to the remote table.
    pub(crate) fn is_mirroring(&self, key: &str) -> bool {
        self.mirrors.is_pending(key)
    }

    /// Push `value` (or a delete on `None`) once earlier writes of `key` are
    /// done. Returns `false` if the remote call failed.
    pub(crate) async fn mirror(
        &self,
        mut ticket: MirrorTicket,
        key: &str,
        value: Option<String>,
    ) -> bool {
        ticket.wait_turn().await;
        let result = match value {
            Some(value) => self
                .remote
                .upsert(&self.table, Row::new(key, value))
                .await
                .map_err(|error| SyncFailure::Upsert {
                    key: key.to_owned(),
                    error,
                }),
            None => self
                .remote
                .delete(&self.table, key)
                .await
                .map_err(|error| SyncFailure::Delete {
                    key: key.to_owned(),
                    error,
                }),
        };
        self.mark_synced(key, result.is_ok());
        match result {
            Ok(()) => true,
            Err(failure) => {
                self.report(failure);
                false
            }
        }
    }

    /// Cache syncable rows from the bulk load and mirror them locally.
    fn seed(&self, rows: Vec<Row>) -> usize {
        let mut loaded = 0;
        for row in rows {
            if !self.classifier.should_sync(&row.key) {
                continue;
            }
            if let Err(error) = self.local.set(&row.key, &row.value) {
                self.report(SyncFailure::LocalWrite {
                    key: row.key.clone(),
                    error,
                });
            }
            self.cache.write().insert(row.key, Some(row.value));
            loaded += 1;
        }
        loaded
    }

    fn apply_remote(&self, event: ChangeEvent) {
        let Some(key) = event.key().map(str::to_owned) else {
            tracing::debug!(kind = ?event.kind, "ignoring change event without key");
            return;
        };
        if !self.classifier.should_sync(&key) {
            tracing::debug!(key = %key, "ignoring change to session-local key");
            return;
        }

        let value = match event.kind {
            ChangeKind::Insert | ChangeKind::Update => match event.new_row {
                Some(row) => Some(row.value),
                None => {
                    tracing::debug!(key = %key, "ignoring upsert event without new row");
                    return;
                }
            },
            ChangeKind::Delete => None,
        };

        match self.store_remote_value(&key, value.as_deref()) {
            Ok(true) => self.mark_synced(&key, true),
            Ok(false) => tracing::trace!(key = %key, "remote echo ignored"),
            Err(error) => self.report(SyncFailure::LocalWrite { key, error }),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Configures a [`SyncShim`].
pub struct SyncShimBuilder<L> {
    local: L,
    remote: Arc<dyn RemoteBackend>,
    table: String,
    classifier: KeyClassifier,
    observer: Arc<dyn SyncObserver>,
    event_capacity: usize,
}

impl<L: LocalStore + 'static> SyncShimBuilder<L> {
    fn new(local: L, remote: Arc<dyn RemoteBackend>) -> Self {
        let defaults = SyncConfig::default();
        Self {
            local,
            remote,
            table: defaults.table,
            classifier: KeyClassifier::default(),
            observer: Arc::new(TracingObserver),
            event_capacity: defaults.event_capacity,
        }
    }

    /// Remote table name (default `kv_store`).
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    /// Key classifier (default: built-in deny-list).
    pub fn classifier(mut self, classifier: KeyClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Failure hook (default: [`TracingObserver`]).
    pub fn observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Notification bus buffer size (default 256).
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Apply table, bus size and classifier settings from `config`.
    pub fn config(self, config: &SyncConfig) -> Result<Self> {
        config.validate()?;
        let classifier = config.classifier()?;
        Ok(self
            .table(config.table.clone())
            .event_capacity(config.event_capacity)
            .classifier(classifier))
    }

    /// Finish. Call [`SyncShim::init`] on the result before use.
    pub fn build(self) -> SyncShim<L> {
        SyncShim {
            shared: Arc::new(Shared {
                local: self.local,
                remote: self.remote,
                table: self.table,
                classifier: self.classifier,
                observer: self.observer,
                notifier: Notifier::new(self.event_capacity),
                cache: RwLock::new(HashMap::new()),
                unsynced: Mutex::new(HashSet::new()),
                mirrors: MirrorLanes::default(),
                initialized: AtomicBool::new(false),
                pending: Mutex::new(Vec::new()),
                feed: Mutex::new(None),
            }),
        }
    }
}

impl<L> std::fmt::Debug for SyncShimBuilder<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncShimBuilder")
            .field("table", &self.table)
            .field("event_capacity", &self.event_capacity)
            .finish_non_exhaustive()
    }
}

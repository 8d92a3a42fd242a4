#![allow(dead_code)]

use parking_lot::Mutex;
use shared_storage::{MemoryBackend, MemoryStore, SyncFailure, SyncObserver, SyncShim};
use std::sync::Arc;
use std::time::Duration;

pub const TABLE: &str = "kv_store";

/// Observer that keeps every failure for later assertions.
#[derive(Default)]
pub struct RecordingObserver {
    failures: Mutex<Vec<SyncFailure>>,
}

impl RecordingObserver {
    pub fn failures(&self) -> Vec<SyncFailure> {
        self.failures.lock().clone()
    }

    pub fn count_matching(&self, pred: impl Fn(&SyncFailure) -> bool) -> usize {
        self.failures.lock().iter().filter(|f| pred(f)).count()
    }
}

impl SyncObserver for RecordingObserver {
    fn on_failure(&self, failure: &SyncFailure) {
        self.failures.lock().push(failure.clone());
    }
}

pub struct Session {
    pub shim: SyncShim<MemoryStore>,
    pub observer: Arc<RecordingObserver>,
}

/// Built but not initialized.
pub fn session(remote: &Arc<MemoryBackend>) -> Session {
    init_tracing();
    let observer = Arc::new(RecordingObserver::default());
    let shim = SyncShim::builder(MemoryStore::new(), remote.clone())
        .table(TABLE)
        .observer(observer.clone())
        .build();
    Session { shim, observer }
}

pub async fn started(remote: &Arc<MemoryBackend>) -> Session {
    let s = session(remote);
    s.shim.init().await;
    s
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

/// Give spawned feed tasks a chance to drain.
pub async fn quiesce() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Route `tracing` output to the test harness. Set `RUST_LOG` to see it.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

//! Per-key ordering of remote mirrors.
//!
//! Every write of a syncable key takes a [`MirrorTicket`] before its remote
//! call. Tickets for one key reach the remote table in the order they were
//! taken, however the tasks carrying them get scheduled, so the table ends on
//! the session's latest value.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

struct Lane {
    in_flight: usize,
    // Resolves once the most recently taken ticket is dropped.
    tail: oneshot::Receiver<()>,
}

/// Lanes for every key with a mirror in flight.
#[derive(Default, Clone)]
pub(crate) struct MirrorLanes {
    lanes: Arc<Mutex<HashMap<String, Lane>>>,
}

impl MirrorLanes {
    /// Register a write of `key`. Call right after the local write so ticket
    /// order matches write order.
    pub(crate) fn begin(&self, key: &str) -> MirrorTicket {
        let (done, tail) = oneshot::channel();
        let mut lanes = self.lanes.lock();
        let previous = match lanes.get_mut(key) {
            Some(lane) => {
                lane.in_flight += 1;
                Some(std::mem::replace(&mut lane.tail, tail))
            }
            None => {
                lanes.insert(key.to_owned(), Lane { in_flight: 1, tail });
                None
            }
        };
        MirrorTicket {
            lanes: self.clone(),
            key: key.to_owned(),
            previous,
            _done: done,
        }
    }

    /// `true` while a write of `key` has not reached the remote table yet.
    pub(crate) fn is_pending(&self, key: &str) -> bool {
        self.lanes.lock().contains_key(key)
    }
}

impl std::fmt::Debug for MirrorLanes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MirrorLanes")
            .field("pending", &self.lanes.lock().len())
            .finish()
    }
}

/// One registered write. Dropping it lets the next write of the key go.
pub(crate) struct MirrorTicket {
    lanes: MirrorLanes,
    key: String,
    previous: Option<oneshot::Receiver<()>>,
    _done: oneshot::Sender<()>,
}

impl MirrorTicket {
    /// Wait until every earlier write of the key is done.
    pub(crate) async fn wait_turn(&mut self) {
        if let Some(previous) = self.previous.take() {
            // The sender is only ever dropped, never used; either outcome means done.
            let _ = previous.await;
        }
    }
}

impl Drop for MirrorTicket {
    fn drop(&mut self) {
        let mut lanes = self.lanes.lanes.lock();
        if let Some(lane) = lanes.get_mut(&self.key) {
            lane.in_flight -= 1;
            if lane.in_flight == 0 {
                lanes.remove(&self.key);
            }
        }
    }
}

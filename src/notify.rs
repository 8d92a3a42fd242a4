//! Storage-change notifications, shaped like the browser's `storage` event.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// One key changed. `None` means absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    /// Key that changed.
    pub key: String,
    /// Value after the change.
    pub new_value: Option<String>,
    /// Value before the change.
    pub old_value: Option<String>,
}

/// Handle for removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&ChangeNotification) + Send + Sync>;

/// Fans notifications out to synchronous listeners and to a broadcast bus.
///
/// Listeners run inline, in registration order, on the thread that made the
/// change. The bus is for async consumers; slow receivers lag instead of
/// blocking the writer.
pub struct Notifier {
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
    bus: broadcast::Sender<ChangeNotification>,
}

impl Notifier {
    /// Notifier whose bus buffers `capacity` events per receiver.
    pub fn new(capacity: usize) -> Self {
        let (bus, _) = broadcast::channel(capacity.max(1));
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            bus,
        }
    }

    /// Register a listener.
    pub fn add_listener<F>(&self, f: F) -> ListenerId
    where
        F: Fn(&ChangeNotification) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(f)));
        id
    }

    /// Unregister a listener. Returns `false` if it was already gone.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// New receiver on the bus. Sees only events sent after this call.
    pub fn events(&self) -> broadcast::Receiver<ChangeNotification> {
        self.bus.subscribe()
    }

    /// Deliver `notification` to every listener, then to the bus.
    pub fn emit(&self, notification: ChangeNotification) {
        // Snapshot so listeners may add/remove listeners without deadlocking.
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&notification);
        }
        let _ = self.bus.send(notification);
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("listeners", &self.listeners.read().len())
            .field("bus_receivers", &self.bus.receiver_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn change(key: &str) -> ChangeNotification {
        ChangeNotification {
            key: key.into(),
            new_value: Some("1".into()),
            old_value: None,
        }
    }

    #[test]
    fn listeners_run_in_order_and_can_be_removed() {
        let n = Notifier::new(8);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = Arc::clone(&seen);
        let first = n.add_listener(move |c| s1.lock().push(format!("first:{}", c.key)));
        let s2 = Arc::clone(&seen);
        n.add_listener(move |c| s2.lock().push(format!("second:{}", c.key)));

        n.emit(change("a"));
        assert!(n.remove_listener(first));
        assert!(!n.remove_listener(first));
        n.emit(change("b"));

        assert_eq!(*seen.lock(), vec!["first:a", "second:a", "second:b"]);
    }

    #[test]
    fn bus_receives_events_after_subscribe() {
        let n = Notifier::new(8);
        n.emit(change("early"));
        let mut rx = n.events();
        n.emit(change("late"));
        assert_eq!(rx.try_recv().unwrap().key, "late");
        assert!(rx.try_recv().is_err());
    }
}

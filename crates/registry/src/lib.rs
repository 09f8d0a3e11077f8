//! Berth watch registry: fans "namespace changed" signals out to subscribers.
//!
//! Every subscriber owns a single-slot channel. A notify that finds the slot
//! already full is dropped, so any burst of changes collapses into one pending
//! wake-up. The wake-up carries no payload; subscribers re-read status after it.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use berth_core::ChangeSink;
use metrics::{counter, gauge};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Process-unique subscription identifier.
pub type WatchId = u64;

type Subscribers = HashMap<String, HashMap<WatchId, mpsc::Sender<()>>>;

struct Inner {
    /// namespace -> (id -> wake-up slot). A namespace key exists iff it has a live subscriber.
    watchers: Mutex<Subscribers>,
    /// Kept apart from `watchers` so id allocation never waits on a notify.
    next_id: AtomicU64,
}

/// Concurrent namespace -> subscriber registry. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WatchRegistry {
    inner: Arc<Inner>,
}

/// Receiving half of a subscription.
#[derive(Debug)]
pub struct Notifier {
    id: WatchId,
    rx: mpsc::Receiver<()>,
}

impl Notifier {
    pub fn id(&self) -> WatchId { self.id }

    /// Wait for the next wake-up. Returns `false` once the subscription was
    /// stopped and no signal is left.
    pub async fn changed(&mut self) -> bool {
        self.rx.recv().await.is_some()
    }

    /// Consume a pending wake-up without waiting.
    pub fn try_changed(&mut self) -> bool {
        self.rx.try_recv().is_ok()
    }
}

/// Releases a subscription. Calling [`StopHandle::stop`] or dropping the handle
/// both remove the registration; consuming `self` makes a second stop impossible.
#[derive(Debug)]
pub struct StopHandle {
    tx: oneshot::Sender<()>,
}

impl StopHandle {
    pub fn stop(self) {
        let _ = self.tx.send(());
    }
}

impl Default for WatchRegistry {
    fn default() -> Self { Self::new() }
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self { inner: Arc::new(Inner { watchers: Mutex::new(HashMap::new()), next_id: AtomicU64::new(0) }) }
    }

    fn watchers(&self) -> MutexGuard<'_, Subscribers> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.inner.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn alloc_id(&self) -> WatchId {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Subscribe to changes in `namespace`.
    ///
    /// Spawns a cleanup task on the current Tokio runtime that removes the
    /// registration once the returned [`StopHandle`] is stopped or dropped.
    ///
    /// # Panics
    /// When called outside a Tokio runtime.
    pub fn watch(&self, namespace: &str) -> (Notifier, StopHandle) {
        let id = self.alloc_id();
        let (tx, rx) = mpsc::channel::<()>(1);
        {
            let mut map = self.watchers();
            map.entry(namespace.to_string()).or_default().insert(id, tx);
            gauge!("registry_watchers", total(&map) as f64);
        }
        debug!(ns = %namespace, id, "watch registered");

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let registry = self.clone();
        let ns = namespace.to_string();
        tokio::spawn(async move {
            // Err means the handle was dropped without an explicit stop.
            let _ = stop_rx.await;
            registry.remove(&ns, id);
        });

        (Notifier { id, rx }, StopHandle { tx: stop_tx })
    }

    /// Wake every subscriber of `namespace`, coalescing with any unread signal.
    /// Registrations whose [`Notifier`] was dropped are removed on the way.
    pub fn notify(&self, namespace: &str) {
        let slots: Vec<(WatchId, mpsc::Sender<()>)> = match self.watchers().get(namespace) {
            Some(subs) => subs.iter().map(|(id, tx)| (*id, tx.clone())).collect(),
            None => return,
        };
        let mut closed = Vec::new();
        for (id, tx) in slots {
            match tx.try_send(()) {
                Ok(()) => { counter!("registry_notify_total", 1u64); }
                Err(mpsc::error::TrySendError::Full(())) => { counter!("registry_notify_coalesced_total", 1u64); }
                Err(mpsc::error::TrySendError::Closed(())) => closed.push(id),
            }
        }
        for id in closed {
            debug!(ns = %namespace, id, "notifier dropped before stop; removing");
            self.remove(namespace, id);
        }
    }

    /// Remove a registration. Idempotent: an absent id only logs a warning,
    /// since it can race with a concurrent stop.
    pub fn remove(&self, namespace: &str, id: WatchId) {
        let mut map = self.watchers();
        let removed = match map.get_mut(namespace) {
            Some(subs) => {
                let removed = subs.remove(&id).is_some();
                if subs.is_empty() {
                    map.remove(namespace);
                }
                removed
            }
            None => false,
        };
        gauge!("registry_watchers", total(&map) as f64);
        drop(map);
        if removed {
            debug!(ns = %namespace, id, "watch removed");
        } else {
            warn!(ns = %namespace, id, "failed to look up watcher for deletion; already removed");
        }
    }

    pub fn subscriber_count(&self, namespace: &str) -> usize {
        self.watchers().get(namespace).map(HashMap::len).unwrap_or(0)
    }

    /// Number of namespaces with at least one live subscriber.
    pub fn namespace_count(&self) -> usize {
        self.watchers().len()
    }
}

impl ChangeSink for WatchRegistry {
    fn notify(&self, namespace: &str) {
        WatchRegistry::notify(self, namespace);
    }
}

fn total(map: &Subscribers) -> usize {
    map.values().map(HashMap::len).sum()
}

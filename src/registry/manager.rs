//! Listener registry: user identity to live delivery queues.

use crate::types::{ListenerId, SharedUpdate, UserId};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::types::{DeliveryReport, ListenerStats, RegistryTotals, Subscription};

/// Default queue capacity per listener.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Registry side of one listener.
struct Listener {
    id: ListenerId,
    sender: Sender<SharedUpdate>,
    stats: Arc<ListenerStats>,
}

/// Result of offering one update to one listener queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Enqueue {
    Delivered,
    /// Queue full; counted as a drop.
    Dropped,
    /// Receiver already gone. Not a drop: nobody is listening.
    Closed,
}

impl Listener {
    /// Never blocks.
    fn try_send(&self, update: &SharedUpdate) -> Enqueue {
        match self.sender.try_send(Arc::clone(update)) {
            Ok(()) => {
                self.stats.record_delivered();
                Enqueue::Delivered
            }
            Err(TrySendError::Full(_)) => {
                self.stats.record_dropped();
                Enqueue::Dropped
            }
            // The handle owns the receiver and detaches before it goes away,
            // so this only happens mid-teardown.
            Err(TrySendError::Disconnected(_)) => Enqueue::Closed,
        }
    }
}

/// Concurrent multimap from user identity to listener queues.
///
/// Lock discipline: attach/detach take the write lock, delivery takes the
/// read lock. Nothing that can block runs under either; delivery only uses
/// `try_send`, so one full queue never holds up anybody else.
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<UserId, Vec<Listener>>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl ListenerRegistry {
    /// Create a registry with the default queue capacity.
    pub fn new() -> Arc<Self> {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create a registry whose listener queues hold `capacity` updates.
    ///
    /// Zero is bumped to one: a rendezvous queue would drop everything.
    pub fn with_queue_capacity(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            listeners: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: capacity.max(1),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Attach a new listener for `user_id`. Always succeeds.
    pub fn attach(self: &Arc<Self>, user_id: impl Into<UserId>) -> Subscription {
        let user_id = user_id.into();
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.queue_capacity);
        let stats = Arc::new(ListenerStats::default());

        let listener = Listener {
            id,
            sender,
            stats: Arc::clone(&stats),
        };

        self.listeners
            .write()
            .entry(user_id.clone())
            .or_default()
            .push(listener);

        info!(user_id = %user_id, listener_id = %id, "listener attached");

        Subscription {
            id,
            user_id,
            receiver,
            stats,
            registry: Arc::downgrade(self),
        }
    }

    /// Detach a listener. Idempotent.
    ///
    /// Handles attached through another registry are ignored: listener ids
    /// are only unique within one registry.
    pub fn detach(&self, subscription: &Subscription) {
        if !self.owns(subscription) {
            debug!(
                user_id = %subscription.user_id(),
                listener_id = %subscription.id(),
                "ignoring detach of a foreign listener"
            );
            return;
        }
        if !subscription.is_detached() {
            self.remove(subscription.user_id(), subscription.id());
        }
    }

    fn owns(&self, subscription: &Subscription) -> bool {
        std::ptr::eq(subscription.registry.as_ptr(), self)
    }

    /// Remove exactly one entry and close its queue. Returns false if it was
    /// already gone.
    pub(crate) fn remove(&self, user_id: &UserId, id: ListenerId) -> bool {
        let removed = {
            let mut listeners = self.listeners.write();
            let Some(queues) = listeners.get_mut(user_id) else {
                return false;
            };
            let Some(pos) = queues.iter().position(|l| l.id == id) else {
                return false;
            };
            let listener = queues.swap_remove(pos);
            if queues.is_empty() {
                listeners.remove(user_id);
            }
            listener.stats.mark_closed();
            listener
        };

        info!(
            user_id = %user_id,
            listener_id = %id,
            dropped = removed.stats.dropped(),
            "listener detached"
        );
        // Dropping the only sender closes the queue.
        drop(removed);
        true
    }

    /// Enqueue `update` for every listener of `user_id` without blocking.
    ///
    /// A full queue drops the update for that listener only.
    pub fn deliver_to(&self, user_id: &UserId, update: &SharedUpdate) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        let listeners = self.listeners.read();
        let Some(queues) = listeners.get(user_id) else {
            return report;
        };

        for listener in queues {
            match listener.try_send(update) {
                Enqueue::Delivered => report.delivered += 1,
                Enqueue::Dropped => {
                    report.dropped += 1;
                    warn!(
                        user_id = %user_id,
                        listener_id = %listener.id,
                        kind = update.kind(),
                        "listener queue full, update dropped"
                    );
                }
                Enqueue::Closed => debug!(
                    user_id = %user_id,
                    listener_id = %listener.id,
                    "listener queue closed, skipping"
                ),
            }
        }
        drop(listeners);

        self.delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.dropped.fetch_add(report.dropped as u64, Ordering::Relaxed);
        report
    }

    /// Detach every listener. Their streams end after the queued updates.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Listener> = {
            let mut listeners = self.listeners.write();
            listeners.drain().flat_map(|(_, queues)| queues).collect()
        };
        for listener in &drained {
            listener.stats.mark_closed();
        }
        debug!(count = drained.len(), "closed all listeners");
        drained.len()
    }

    /// Number of attached listeners across all users.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().values().map(Vec::len).sum()
    }

    /// Number of listeners attached for one user.
    pub fn listener_count_for(&self, user_id: &UserId) -> usize {
        self.listeners.read().get(user_id).map_or(0, Vec::len)
    }

    /// Number of users with at least one listener.
    pub fn user_count(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn totals(&self) -> RegistryTotals {
        let listeners = self.listeners.read();
        RegistryTotals {
            listeners: listeners.values().map(Vec::len).sum(),
            users: listeners.len(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

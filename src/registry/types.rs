//! Listener handle and per-listener counters.

use crate::types::{ListenerId, SharedUpdate, UserId};
use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::manager::ListenerRegistry;

/// Counters shared between a registry entry and its [`Subscription`].
#[derive(Debug, Default)]
pub struct ListenerStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
    /// Set once, by whoever removes the entry from the registry.
    closed: AtomicBool,
}

impl ListenerStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn record_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Outcome of delivering one update to every listener of one user.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    /// Queues that accepted the update.
    pub delivered: usize,
    /// Queues that were full; the update was dropped for them.
    pub dropped: usize,
}

impl DeliveryReport {
    pub fn merge(&mut self, other: DeliveryReport) {
        self.delivered += other.delivered;
        self.dropped += other.dropped;
    }
}

/// Registry-wide counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RegistryTotals {
    pub listeners: usize,
    pub users: usize,
    pub delivered: u64,
    pub dropped: u64,
}

/// Handle to one attached listener.
///
/// Reads happen through [`stream`](Self::stream) or the `recv*` methods. The
/// stream ends once the listener is detached, by this handle or by
/// [`ListenerRegistry::close_all`]. Dropping the handle detaches it.
pub struct Subscription {
    pub(crate) id: ListenerId,
    pub(crate) user_id: UserId,
    pub(crate) receiver: Receiver<SharedUpdate>,
    pub(crate) stats: Arc<ListenerStats>,
    pub(crate) registry: Weak<ListenerRegistry>,
}

impl Subscription {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Blocking iterator over updates; finishes after detach once the
    /// already queued updates are consumed.
    pub fn stream(&self) -> crossbeam_channel::Iter<'_, SharedUpdate> {
        self.receiver.iter()
    }

    /// Receive the next update (blocking).
    pub fn recv(&self) -> Result<SharedUpdate, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an update (non-blocking).
    pub fn try_recv(&self) -> Result<SharedUpdate, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<SharedUpdate, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Underlying queue, for use in `select!`.
    pub fn receiver(&self) -> &Receiver<SharedUpdate> {
        &self.receiver
    }

    /// Updates dropped for this listener because its queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.stats.dropped()
    }

    pub fn delivered_count(&self) -> u64 {
        self.stats.delivered()
    }

    pub fn is_detached(&self) -> bool {
        self.stats.is_closed()
    }

    /// Remove this listener from the registry and close its queue.
    ///
    /// Safe to call from any thread and any number of times.
    pub fn detach(&self) {
        if self.stats.is_closed() {
            return;
        }
        match self.registry.upgrade() {
            Some(registry) => {
                registry.remove(&self.user_id, self.id);
            }
            // Registry is gone and took the sender with it.
            None => self.stats.mark_closed(),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("user_id", &self.user_id)
            .field("detached", &self.is_detached())
            .finish()
    }
}

//! Listener registry and notification outbox.
//!
//! Store mutations push `StoreChange`s into the outbox while the store lock
//! is held, which fixes their order. Delivery happens later, outside every
//! lock, by whichever thread wins the `draining` flag; other threads only
//! enqueue. A callback that causes further changes therefore never
//! reorders notifications, it just extends the queue being drained.
//!
//! The registry keeps weak references: the caller owns its listener and
//! stops receiving callbacks once it drops it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::domain::StoreChange;
use crate::ports::SecurityInfoListener;

// =============================================================================
// REGISTRY
// =============================================================================

/// Identity of a registered listener (address of its allocation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(usize);

impl ListenerId {
    pub fn of(listener: &Arc<dyn SecurityInfoListener>) -> Self {
        Self(Arc::as_ptr(listener) as *const () as usize)
    }
}

struct Registration {
    id: ListenerId,
    listener: Weak<dyn SecurityInfoListener>,
}

/// Non-owning set of listeners.
#[derive(Default)]
pub struct ListenerRegistry {
    entries: RwLock<Vec<Registration>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `listener`. Returns `false` if it was already registered.
    pub fn register(&self, listener: &Arc<dyn SecurityInfoListener>) -> bool {
        let id = ListenerId::of(listener);
        let mut entries = self.entries.write();
        // A dead entry at the same address belongs to a dropped listener
        entries.retain(|entry| entry.id != id || entry.listener.strong_count() > 0);
        if entries.iter().any(|entry| entry.id == id) {
            return false;
        }
        entries.push(Registration {
            id,
            listener: Arc::downgrade(listener),
        });
        true
    }

    /// Remove `listener`. Returns `false` if it was not registered.
    pub fn unregister(&self, listener: &Arc<dyn SecurityInfoListener>) -> bool {
        let id = ListenerId::of(listener);
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        entries.len() != before
    }

    /// `true` if `id` is currently registered.
    pub fn is_registered(&self, id: ListenerId) -> bool {
        self.entries.read().iter().any(|entry| entry.id == id)
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|entry| entry.listener.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<(ListenerId, Weak<dyn SecurityInfoListener>)> {
        let mut entries = self.entries.write();
        entries.retain(|entry| entry.listener.strong_count() > 0);
        entries
            .iter()
            .map(|entry| (entry.id, entry.listener.clone()))
            .collect()
    }
}

// =============================================================================
// OUTBOX
// =============================================================================

/// Ordered queue of pending notifications with a single active drainer.
pub struct NotificationOutbox {
    queue: Mutex<VecDeque<StoreChange>>,
    draining: AtomicBool,
    registry: Arc<ListenerRegistry>,
}

impl NotificationOutbox {
    pub fn new(registry: Arc<ListenerRegistry>) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            registry,
        }
    }

    /// Registry notifications are delivered to.
    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    /// Enqueue a change. Call while holding the lock that produced it.
    pub fn push(&self, change: StoreChange) {
        self.queue.lock().push_back(change);
    }

    /// Number of undelivered changes.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Deliver queued changes. Call with no locks held.
    ///
    /// Returns the number of changes this call delivered; `0` if another
    /// thread is already draining (it will pick up the queued changes).
    pub fn drain(&self) -> usize {
        let mut delivered = 0;
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return delivered;
            }

            {
                let _flag = DrainFlag(&self.draining);
                loop {
                    let next = self.queue.lock().pop_front();
                    match next {
                        Some(change) => {
                            self.deliver(&change);
                            delivered += 1;
                        }
                        None => break,
                    }
                }
            }

            // A push may have landed between the last pop and the flag reset
            if self.queue.lock().is_empty() {
                return delivered;
            }
        }
    }

    fn deliver(&self, change: &StoreChange) {
        for (id, weak) in self.registry.snapshot() {
            // Unregistration must take effect even for queued changes
            if !self.registry.is_registered(id) {
                continue;
            }
            let Some(listener) = weak.upgrade() else {
                continue;
            };
            match change {
                StoreChange::Added(info) => listener.on_application_added(info),
                StoreChange::StateChanged { old, new } => {
                    listener.on_application_state_changed(old, new)
                }
                StoreChange::Removed(info) => listener.on_application_removed(info),
            }
        }
        trace!(endpoint = %change.endpoint(), "Notification delivered");
    }
}

/// Clears the draining flag even if a listener panics.
struct DrainFlag<'a>(&'a AtomicBool);

impl Drop for DrainFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

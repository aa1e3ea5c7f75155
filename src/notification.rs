//! Removal notifications and their delivery.
//!
//! Every way an entry can leave the map (explicit removal, replacement,
//! reclamation, expiration, size eviction) produces exactly one
//! [`RemovalNotification`]. Segments enqueue notifications while holding
//! their lock and the map delivers them to the [`RemovalListener`] only
//! after the lock is released:
//!
//! ```text
//!   segment (locked)                       caller thread (unlocked)
//!   ────────────────                       ────────────────────────
//!   remove_entry ──enqueue──► SegQueue ──► deliver_pending ──► listener
//! ```
//!
//! When no listener is configured the queue is [`NotificationQueue::Discarding`]
//! and enqueueing costs a single branch. A listener that panics is caught
//! and logged; the operation that triggered the removal still succeeds.

use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use tracing::warn;

/// Why an entry was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalCause {
    /// Removed by `remove`, `remove_if_eq` or `clear`.
    Explicit,
    /// The value was overwritten by `insert`, `replace` or `replace_if_eq`.
    Replaced,
    /// The weakly held key or value had no remaining strong references.
    Collected,
    /// The entry's access or write deadline passed.
    Expired,
    /// Evicted to keep the segment within its maximum size.
    Size,
}

impl RemovalCause {
    /// Returns `true` if the removal was automatic rather than requested.
    pub fn was_evicted(self) -> bool {
        matches!(
            self,
            RemovalCause::Collected | RemovalCause::Expired | RemovalCause::Size
        )
    }
}

impl fmt::Display for RemovalCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemovalCause::Explicit => "explicit",
            RemovalCause::Replaced => "replaced",
            RemovalCause::Collected => "collected",
            RemovalCause::Expired => "expired",
            RemovalCause::Size => "size",
        };
        f.write_str(name)
    }
}

/// A removed key, its last value, and the cause.
///
/// `key` or `value` is `None` when it had already been reclaimed.
pub struct RemovalNotification<K, V> {
    key: Option<Arc<K>>,
    value: Option<Arc<V>>,
    cause: RemovalCause,
}

impl<K, V> RemovalNotification<K, V> {
    pub(crate) fn new(key: Option<Arc<K>>, value: Option<Arc<V>>, cause: RemovalCause) -> Self {
        Self { key, value, cause }
    }

    pub fn key(&self) -> Option<&Arc<K>> {
        self.key.as_ref()
    }

    pub fn value(&self) -> Option<&Arc<V>> {
        self.value.as_ref()
    }

    pub fn cause(&self) -> RemovalCause {
        self.cause
    }

    pub fn was_evicted(&self) -> bool {
        self.cause.was_evicted()
    }

    pub fn into_parts(self) -> (Option<Arc<K>>, Option<Arc<V>>, RemovalCause) {
        (self.key, self.value, self.cause)
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for RemovalNotification<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemovalNotification")
            .field("key", &self.key)
            .field("value", &self.value)
            .field("cause", &self.cause)
            .finish()
    }
}

/// Receives removal notifications outside of any segment lock.
///
/// Any `Fn(RemovalNotification<K, V>) + Send + Sync` closure is a listener.
/// The listener may call back into the map.
pub trait RemovalListener<K, V>: Send + Sync {
    fn on_removal(&self, notification: RemovalNotification<K, V>);
}

impl<K, V, F> RemovalListener<K, V> for F
where
    F: Fn(RemovalNotification<K, V>) + Send + Sync,
{
    fn on_removal(&self, notification: RemovalNotification<K, V>) {
        self(notification)
    }
}

/// Pending notifications shared by all segments of one map.
pub(crate) enum NotificationQueue<K, V> {
    /// No listener: notifications are never built.
    Discarding,
    Delivering {
        pending: SegQueue<RemovalNotification<K, V>>,
        listener: Arc<dyn RemovalListener<K, V>>,
    },
}

impl<K, V> NotificationQueue<K, V> {
    pub(crate) fn new(listener: Option<Arc<dyn RemovalListener<K, V>>>) -> Self {
        match listener {
            Some(listener) => NotificationQueue::Delivering {
                pending: SegQueue::new(),
                listener,
            },
            None => NotificationQueue::Discarding,
        }
    }

    pub(crate) fn is_enabled(&self) -> bool {
        matches!(self, NotificationQueue::Delivering { .. })
    }

    /// Builds and queues a notification, unless discarding.
    #[inline]
    pub(crate) fn enqueue_with(&self, build: impl FnOnce() -> RemovalNotification<K, V>) {
        if let NotificationQueue::Delivering { pending, .. } = self {
            pending.push(build());
        }
    }

    /// Hands every queued notification to the listener.
    ///
    /// Must not be called while holding a segment lock.
    pub(crate) fn deliver_pending(&self) {
        let NotificationQueue::Delivering { pending, listener } = self else {
            return;
        };
        while let Some(notification) = pending.pop() {
            let cause = notification.cause();
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_removal(notification)));
            if let Err(payload) = outcome {
                warn!(
                    %cause,
                    panic = panic_message(payload.as_ref()),
                    "removal listener panicked"
                );
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        match self {
            NotificationQueue::Delivering { pending, .. } => pending.len(),
            NotificationQueue::Discarding => 0,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "<non-string panic payload>"
    }
}

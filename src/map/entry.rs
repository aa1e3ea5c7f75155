//! The per-key storage: a published [`Node`] and its writer-side [`Entry`].
//!
//! Readers never lock. They reach a `Node` through the segment's bucket
//! table under a `crossbeam_epoch` guard, so a node a writer unlinks stays
//! valid until every reader that could still be standing on it has unpinned.
//!
//! Everything only writers touch lives in an [`Entry`] in the segment's
//! `SlotArena`, one per node:
//!
//! - a pointer to the entry's current node;
//! - the eviction ordering, via `eviction` links (size-bounded maps only);
//! - the expiration ordering, via `expiration` links and the deadline the
//!   entry was queued with (expiring maps only).
//!
//! Which orderings an entry joins is decided once per map by the
//! [`EntryFactory`] capability flags rather than by entry type.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

use crate::ds::{Linked, Links, SlotId};
use crate::map::reference::{KeyRef, Strength, ValueRef};
use crate::time::is_after;

/// Marker for the least-recently-used ordering.
pub(crate) struct EvictionOrder;

/// Marker for the deadline ordering.
pub(crate) struct ExpirationOrder;

/// An entry as published to unlocked readers.
pub(crate) struct Node<K, V> {
    key: KeyRef<K>,
    hash: u32,
    /// Arena slot holding this node's [`Entry`].
    slot: SlotId,
    /// Unique per segment; distinguishes this entry from later occupants
    /// of the same slot.
    stamp: u64,
    /// Never null.
    value: Atomic<ValueRef<V>>,
    /// Absolute expiration time in ticker nanoseconds.
    deadline: AtomicU64,
    next: Atomic<Node<K, V>>,
}

impl<K, V> Node<K, V> {
    #[inline]
    pub(crate) fn key(&self) -> &KeyRef<K> {
        &self.key
    }

    #[inline]
    pub(crate) fn hash(&self) -> u32 {
        self.hash
    }

    #[inline]
    pub(crate) fn slot(&self) -> SlotId {
        self.slot
    }

    #[inline]
    pub(crate) fn stamp(&self) -> u64 {
        self.stamp
    }

    #[inline]
    pub(crate) fn handle(&self) -> EntryHandle {
        EntryHandle {
            id: self.slot,
            stamp: self.stamp,
        }
    }

    #[inline]
    pub(crate) fn value<'g>(&self, guard: &'g Guard) -> &'g ValueRef<V> {
        // SAFETY: the pointer is never null, and a swapped-out value is
        // destroyed only after every guard that could have loaded it is gone.
        unsafe { self.value.load(Ordering::Acquire, guard).deref() }
    }

    /// Publishes `value`. Readers that loaded the previous value keep it
    /// until their guard is released.
    pub(crate) fn swap_value(&self, value: ValueRef<V>, guard: &Guard) {
        let old = self.value.swap(Owned::new(value), Ordering::AcqRel, guard);
        // SAFETY: `old` is unreachable from this node once swapped out.
        unsafe { guard.defer_destroy(old) };
    }

    #[inline]
    pub(crate) fn next<'g>(&self, guard: &'g Guard) -> Shared<'g, Node<K, V>> {
        self.next.load(Ordering::Acquire, guard)
    }

    #[inline]
    pub(crate) fn next_link(&self) -> &Atomic<Node<K, V>> {
        &self.next
    }

    #[inline]
    pub(crate) fn deadline(&self) -> u64 {
        self.deadline.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_deadline(&self, deadline: u64) {
        self.deadline.store(deadline, Ordering::Release);
    }

    /// Moves the deadline forward to `deadline`; never moves it back.
    pub(crate) fn extend_deadline(&self, deadline: u64) {
        let _ = self
            .deadline
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                is_after(deadline, current).then_some(deadline)
            });
    }

    #[inline]
    pub(crate) fn is_expired_at(&self, now: u64) -> bool {
        is_after(now, self.deadline())
    }

    /// Returns `true` if the key or the value has been reclaimed.
    #[inline]
    pub(crate) fn is_collected(&self, guard: &Guard) -> bool {
        self.key.is_reclaimed() || self.value(guard).is_reclaimed()
    }

    /// The value if the entry is logically present at `now`.
    pub(crate) fn live_value(&self, now: u64, expires: bool, guard: &Guard) -> Option<Arc<V>> {
        if self.key.is_reclaimed() {
            return None;
        }
        if expires && self.is_expired_at(now) {
            return None;
        }
        self.value(guard).get()
    }

    /// A copy of this node linked in front of `next`, used when a table
    /// expansion moves the node to another chain.
    pub(crate) fn duplicate(&self, next: Shared<'_, Node<K, V>>, guard: &Guard) -> Self {
        Node {
            key: self.key.clone(),
            hash: self.hash,
            slot: self.slot,
            stamp: self.stamp,
            value: Atomic::new(self.value(guard).clone()),
            deadline: AtomicU64::new(self.deadline()),
            next: Atomic::from(next),
        }
    }
}

impl<K, V> Drop for Node<K, V> {
    fn drop(&mut self) {
        // SAFETY: a node is dropped only once no reader can reach it, and it
        // owns the value box it currently points at.
        unsafe {
            let value = self.value.load(Ordering::Relaxed, epoch::unprotected());
            if !value.is_null() {
                drop(value.into_owned());
            }
        }
    }
}

/// Writer-side bookkeeping for one node, kept under the segment lock.
pub(crate) struct Entry<K, V> {
    node: Atomic<Node<K, V>>,
    /// Deadline the entry was last queued for expiration with. Orders the
    /// expiration queue; the node's own deadline may run ahead of it.
    queued_deadline: u64,
    eviction: Links,
    expiration: Links,
}

impl<K, V> Entry<K, V> {
    /// An entry whose node is published afterwards with [`set_node`].
    ///
    /// [`set_node`]: Entry::set_node
    pub(crate) fn detached() -> Self {
        Self {
            node: Atomic::null(),
            queued_deadline: 0,
            eviction: Links::default(),
            expiration: Links::default(),
        }
    }

    #[inline]
    pub(crate) fn node<'g>(&self, guard: &'g Guard) -> Option<&'g Node<K, V>> {
        // SAFETY: the node is either published in the table or retired
        // through the epoch, so it outlives `guard`.
        unsafe { self.node_ptr(guard).as_ref() }
    }

    #[inline]
    pub(crate) fn node_ptr<'g>(&self, guard: &'g Guard) -> Shared<'g, Node<K, V>> {
        self.node.load(Ordering::Relaxed, guard)
    }

    #[inline]
    pub(crate) fn set_node(&self, node: Shared<'_, Node<K, V>>) {
        self.node.store(node, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn queued_deadline(&self) -> u64 {
        self.queued_deadline
    }

    #[inline]
    pub(crate) fn set_queued_deadline(&mut self, deadline: u64) {
        self.queued_deadline = deadline;
    }
}

impl<K, V> Linked<EvictionOrder> for Entry<K, V> {
    fn links(&self) -> &Links {
        &self.eviction
    }
    fn links_mut(&mut self) -> &mut Links {
        &mut self.eviction
    }
}

impl<K, V> Linked<ExpirationOrder> for Entry<K, V> {
    fn links(&self) -> &Links {
        &self.expiration
    }
    fn links_mut(&mut self) -> &mut Links {
        &mut self.expiration
    }
}

/// A reference to an entry that can be held outside the segment lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryHandle {
    pub(crate) id: SlotId,
    pub(crate) stamp: u64,
}

/// Builds nodes for one map configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EntryFactory {
    key_strength: Strength,
    value_strength: Strength,
    evictable: bool,
    expirable: bool,
}

impl EntryFactory {
    pub(crate) fn new(
        key_strength: Strength,
        value_strength: Strength,
        evictable: bool,
        expirable: bool,
    ) -> Self {
        Self {
            key_strength,
            value_strength,
            evictable,
            expirable,
        }
    }

    /// Entries join the eviction ordering.
    #[inline]
    pub(crate) fn evictable(&self) -> bool {
        self.evictable
    }

    /// Entries join the expiration ordering.
    #[inline]
    pub(crate) fn expirable(&self) -> bool {
        self.expirable
    }

    /// Keys or values can be reclaimed, so segments must sweep.
    #[inline]
    pub(crate) fn tracks_references(&self) -> bool {
        self.key_strength == Strength::Weak || self.value_strength == Strength::Weak
    }

    /// A node for `slot`, linked in front of `next`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_node<K, V>(
        &self,
        key: Arc<K>,
        hash: u32,
        slot: SlotId,
        stamp: u64,
        value: Arc<V>,
        deadline: u64,
        next: Shared<'_, Node<K, V>>,
    ) -> Node<K, V> {
        Node {
            key: KeyRef::new(key, self.key_strength),
            hash,
            slot,
            stamp,
            value: Atomic::new(self.value_ref(value)),
            deadline: AtomicU64::new(deadline),
            next: Atomic::from(next),
        }
    }

    pub(crate) fn value_ref<V>(&self, value: Arc<V>) -> ValueRef<V> {
        ValueRef::new(value, self.value_strength)
    }
}

//! One shard of the cache map.
//!
//! ## Architecture
//!
//! ```text
//!   Segment
//!   ├── count / mod_count (atomics, read without locking)
//!   ├── table: Atomic<Table>                      published bucket heads
//!   │     bucket ─► Node ─► Node ─► …             walked under an epoch guard
//!   ├── recency_queue: SegQueue<EntryHandle>      lock-free, fed by readers
//!   └── state: RwLock<SegmentState>               writers only
//!       ├── entries: SlotArena<Entry>             one per node; holds links
//!       ├── eviction_queue   (LRU head ─► MRU tail)
//!       └── expiration_queue (earliest queued deadline ─► latest)
//! ```
//!
//! Reads never take the lock. They pin an epoch, walk the published chain
//! and, on a hit, push an [`EntryHandle`] onto the recency queue; the next
//! locked pass replays those handles onto the eviction and expiration
//! orderings. Writers serialize on the lock, relink chains with release
//! stores and retire unlinked nodes through the epoch, so a reader still
//! standing on a node never sees it freed. Table expansion copies the nodes
//! that change chains and publishes the new table with one store.
//!
//! ## Maintenance
//!
//! There is no timer thread. Every write runs the locked maintenance pass
//! first (replay reads, sweep reclaimed references, expire), and reads run it
//! opportunistically through `try_write` after every `DRAIN_THRESHOLD + 1`
//! reads or when they stumble over a dead entry. The clock is read after the
//! lock is taken, so deadlines reach the expiration queue in order. Removal
//! notifications produced under the lock are delivered only after the guard
//! is dropped.

use std::borrow::Borrow;
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};
use crossbeam_queue::SegQueue;
use parking_lot::RwLock;
use tracing::trace;

use crate::ds::{IntrusiveList, SlotArena, SlotId};
use crate::error::InvariantError;
use crate::map::entry::{Entry, EntryFactory, EntryHandle, EvictionOrder, ExpirationOrder, Node};
use crate::map::reference::{KeyRef, ValueRef};
use crate::notification::{NotificationQueue, RemovalCause, RemovalNotification};
use crate::time::{Ticker, is_after, later_of};

/// Largest bucket table a segment will grow to.
pub(crate) const MAXIMUM_CAPACITY: usize = 1 << 30;

/// Reads between opportunistic maintenance attempts is `DRAIN_THRESHOLD + 1`.
const DRAIN_THRESHOLD: usize = 0x3F;

/// Buckets examined by one incremental reclamation sweep.
const DRAIN_MAX: usize = 16;

/// Which timestamp drives expiration, with its duration in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Expiry {
    AfterAccess(u64),
    AfterWrite(u64),
}

impl Expiry {
    pub(crate) fn nanos(self) -> u64 {
        match self {
            Expiry::AfterAccess(nanos) | Expiry::AfterWrite(nanos) => nanos,
        }
    }

    fn refreshes_on_read(self) -> bool {
        matches!(self, Expiry::AfterAccess(_))
    }
}

/// Configuration and collaborators shared by every segment of one map.
pub(crate) struct SegmentContext<K, V> {
    pub(crate) factory: EntryFactory,
    pub(crate) expiry: Option<Expiry>,
    pub(crate) ticker: Arc<dyn Ticker>,
    pub(crate) notifications: NotificationQueue<K, V>,
}

/// A live entry copied out of a segment for iteration.
pub(crate) struct Snapshot<K, V> {
    pub(crate) key: KeyRef<K>,
    pub(crate) value: ValueRef<V>,
    pub(crate) deadline: u64,
}

/// Bucket heads published to readers.
struct Table<K, V> {
    buckets: Box<[Atomic<Node<K, V>>]>,
}

impl<K, V> Table<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            buckets: (0..capacity).map(|_| Atomic::null()).collect(),
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    fn index_of(&self, hash: u32) -> usize {
        hash as usize & (self.buckets.len() - 1)
    }

    #[inline]
    fn bucket(&self, hash: u32) -> &Atomic<Node<K, V>> {
        &self.buckets[self.index_of(hash)]
    }
}

struct Lookup<'g, K, V> {
    node: Option<&'g Node<K, V>>,
    saw_reclaimed: bool,
}

struct SegmentState<K, V> {
    entries: SlotArena<Entry<K, V>>,
    eviction_queue: IntrusiveList<EvictionOrder>,
    expiration_queue: IntrusiveList<ExpirationOrder>,
    /// Grow the table once the entry count would exceed this.
    threshold: usize,
    next_stamp: u64,
    sweep_cursor: usize,
}

impl<K, V> SegmentState<K, V> {
    fn next_stamp(&mut self) -> u64 {
        let stamp = self.next_stamp;
        self.next_stamp = self.next_stamp.wrapping_add(1);
        stamp
    }
}

/// Entry count above which a table of `capacity` buckets grows.
fn threshold_for(capacity: usize, max_segment_size: Option<usize>) -> usize {
    let threshold = capacity * 3 / 4;
    // A table that is full exactly at the eviction boundary never needs to
    // double.
    if Some(threshold) == max_segment_size {
        threshold + 1
    } else {
        threshold
    }
}

pub(crate) struct Segment<K, V> {
    table: Atomic<Table<K, V>>,
    state: RwLock<SegmentState<K, V>>,
    /// Live entries, including reclaimed ones not yet swept.
    count: AtomicUsize,
    /// Bumped on every structural or value change.
    mod_count: AtomicUsize,
    read_count: AtomicUsize,
    recency_queue: SegQueue<EntryHandle>,
    max_segment_size: Option<usize>,
    context: Arc<SegmentContext<K, V>>,
}

impl<K, V> Segment<K, V> {
    /// Creates a segment with a table of `initial_capacity` buckets.
    ///
    /// `initial_capacity` must be a power of two.
    pub(crate) fn new(
        initial_capacity: usize,
        max_segment_size: Option<usize>,
        context: Arc<SegmentContext<K, V>>,
    ) -> Self {
        debug_assert!(initial_capacity.is_power_of_two());
        Self {
            table: Atomic::new(Table::new(initial_capacity)),
            state: RwLock::new(SegmentState {
                entries: SlotArena::with_capacity(initial_capacity),
                eviction_queue: IntrusiveList::new(),
                expiration_queue: IntrusiveList::new(),
                threshold: threshold_for(initial_capacity, max_segment_size),
                next_stamp: 0,
                sweep_cursor: 0,
            }),
            count: AtomicUsize::new(0),
            mod_count: AtomicUsize::new(0),
            read_count: AtomicUsize::new(0),
            recency_queue: SegQueue::new(),
            max_segment_size,
            context,
        }
    }

    #[inline]
    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn mod_count(&self) -> usize {
        self.mod_count.load(Ordering::Acquire)
    }

    pub(crate) fn max_segment_size(&self) -> Option<usize> {
        self.max_segment_size
    }

    #[inline]
    fn now(&self) -> u64 {
        self.context.ticker.read()
    }

    #[inline]
    fn expires(&self) -> bool {
        self.context.factory.expirable()
    }

    /// Reads must be replayed onto some ordering.
    #[inline]
    fn records_access(&self) -> bool {
        self.context.factory.evictable()
            || self.context.expiry.is_some_and(Expiry::refreshes_on_read)
    }

    fn publish_count(&self, state: &SegmentState<K, V>) {
        self.count.store(state.entries.len(), Ordering::Release);
    }

    fn bump_mod_count(&self) {
        self.mod_count.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    fn table<'g>(&self, guard: &'g Guard) -> &'g Table<K, V> {
        // SAFETY: the table is never null; `expand` retires a replaced table
        // through the epoch.
        unsafe { self.table.load(Ordering::Acquire, guard).deref() }
    }

    /// Walks the bucket chain for `hash` looking for `key`.
    fn find<'g, Q>(&self, key: &Q, hash: u32, guard: &'g Guard) -> Lookup<'g, K, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let mut saw_reclaimed = false;
        let mut cursor = self.table(guard).bucket(hash).load(Ordering::Acquire, guard);
        // SAFETY: chain nodes are retired only through the epoch, so every
        // node reachable under `guard` outlives it.
        while let Some(node) = unsafe { cursor.as_ref() } {
            if node.hash() == hash {
                match node.key().matches(key) {
                    Some(true) => {
                        return Lookup {
                            node: Some(node),
                            saw_reclaimed,
                        };
                    },
                    Some(false) => {},
                    None => saw_reclaimed = true,
                }
            }
            cursor = node.next(guard);
        }
        Lookup {
            node: None,
            saw_reclaimed,
        }
    }

    /// Every node published in the current table, bucket by bucket.
    fn nodes<'g>(&self, guard: &'g Guard) -> impl Iterator<Item = &'g Node<K, V>>
    where
        K: 'g,
        V: 'g,
    {
        self.table(guard).buckets.iter().flat_map(move |bucket| {
            let mut cursor = bucket.load(Ordering::Acquire, guard);
            std::iter::from_fn(move || {
                // SAFETY: as in `find`.
                let node = unsafe { cursor.as_ref() }?;
                cursor = node.next(guard);
                Some(node)
            })
        })
    }

    /// Scans every live value for one equal to `value`.
    pub(crate) fn contains_value(&self, value: &V, now: u64) -> bool
    where
        V: PartialEq,
    {
        if self.count() == 0 {
            return false;
        }
        let guard = &epoch::pin();
        let expires = self.expires();
        self.nodes(guard).any(|node| {
            node.live_value(now, expires, guard)
                .is_some_and(|live| *live == *value)
        })
    }

    /// Copies out every entry that is live at `now`.
    pub(crate) fn snapshot(&self, now: u64) -> Vec<Snapshot<K, V>> {
        if self.count() == 0 {
            return Vec::new();
        }
        let guard = &epoch::pin();
        let expires = self.expires();
        self.nodes(guard)
            .filter(|node| node.live_value(now, expires, guard).is_some())
            .map(|node| Snapshot {
                key: node.key().clone(),
                value: node.value(guard).clone(),
                deadline: node.deadline(),
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Invariants
    // -----------------------------------------------------------------------

    /// Checks chain placement, arena agreement, ordering membership and the
    /// deadline order of the expiration queue.
    pub(crate) fn check_invariants(&self) -> Result<(), InvariantError> {
        let state = self.state.read();
        let guard = &epoch::pin();
        let table = self.table(guard);
        let len = state.entries.len();

        if !table.len().is_power_of_two() {
            return Err(InvariantError::new(format!(
                "table length {} is not a power of two",
                table.len()
            )));
        }

        let mut chained = 0usize;
        for (index, bucket) in table.buckets.iter().enumerate() {
            let mut cursor = bucket.load(Ordering::Acquire, guard);
            // SAFETY: as in `find`.
            while let Some(node) = unsafe { cursor.as_ref() } {
                if table.index_of(node.hash()) != index {
                    return Err(InvariantError::new(format!(
                        "node for {:?} with hash {:#x} chained in bucket {}",
                        node.slot(),
                        node.hash(),
                        index
                    )));
                }
                let owner = state.entries.get(node.slot()).and_then(|e| e.node(guard));
                if !owner.is_some_and(|owner| ptr::eq(owner, node)) {
                    return Err(InvariantError::new(format!(
                        "node in bucket {} is not the one {:?} points at",
                        index,
                        node.slot()
                    )));
                }
                chained += 1;
                if chained > len {
                    return Err(InvariantError::new("bucket chains contain a cycle"));
                }
                cursor = node.next(guard);
            }
        }
        if chained != len {
            return Err(InvariantError::new(format!(
                "{} entries chained, arena holds {}",
                chained, len
            )));
        }

        if self.count() != len {
            return Err(InvariantError::new(format!(
                "published count {} disagrees with arena length {}",
                self.count(),
                len
            )));
        }

        let expected_evictable = if self.context.factory.evictable() { len } else { 0 };
        if state.eviction_queue.len() != expected_evictable {
            return Err(InvariantError::new(format!(
                "eviction queue holds {}, expected {}",
                state.eviction_queue.len(),
                expected_evictable
            )));
        }
        state
            .eviction_queue
            .validate(&state.entries)
            .map_err(|msg| InvariantError::new(format!("eviction queue: {}", msg)))?;

        let expected_expirable = if self.expires() { len } else { 0 };
        if state.expiration_queue.len() != expected_expirable {
            return Err(InvariantError::new(format!(
                "expiration queue holds {}, expected {}",
                state.expiration_queue.len(),
                expected_expirable
            )));
        }
        state
            .expiration_queue
            .validate(&state.entries)
            .map_err(|msg| InvariantError::new(format!("expiration queue: {}", msg)))?;

        // Expiration stops at the first live head; that is only sound while
        // queued deadlines never decrease from head to tail.
        let mut previous: Option<u64> = None;
        for id in state.expiration_queue.iter_ids(&state.entries) {
            let Some(queued) = state.entries.get(id).map(Entry::queued_deadline) else {
                break;
            };
            if let Some(previous) = previous {
                if is_after(previous, queued) {
                    return Err(InvariantError::new(format!(
                        "expiration queue out of order: {:?} queued for {} after {}",
                        id, queued, previous
                    )));
                }
            }
            previous = Some(queued);
        }

        if let Some(max) = self.max_segment_size {
            if len > max {
                return Err(InvariantError::new(format!(
                    "segment holds {} entries, maximum is {}",
                    len, max
                )));
            }
        }
        Ok(())
    }

    #[cfg(test)]
    fn eviction_order(&self) -> Vec<Arc<K>> {
        let state = self.state.read();
        let guard = &epoch::pin();
        state
            .eviction_queue
            .iter_ids(&state.entries)
            .filter_map(|id| state.entries.get(id).and_then(|e| e.node(guard)))
            .filter_map(|node| node.key().get())
            .collect()
    }

    #[cfg(test)]
    fn table_len(&self) -> usize {
        let guard = &epoch::pin();
        self.table(guard).len()
    }
}

/// Operations that retire nodes or values through the epoch. Retired
/// memory may be dropped on another thread, hence the bounds.
impl<K, V> Segment<K, V>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub(crate) fn get<Q>(&self, key: &Q, hash: u32) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        if self.count() == 0 {
            return None;
        }
        let now = self.now();
        let (value, stale) = {
            let guard = &epoch::pin();
            let lookup = self.find(key, hash, guard);
            match lookup.node {
                None => (None, lookup.saw_reclaimed),
                Some(node) if self.expires() && node.is_expired_at(now) => (None, true),
                Some(node) => match node.value(guard).get() {
                    Some(value) => {
                        self.record_read(node, now);
                        (Some(value), lookup.saw_reclaimed)
                    },
                    None => (None, true),
                },
            }
        };
        if stale {
            self.try_maintain();
        }
        self.post_read_cleanup();
        value
    }

    pub(crate) fn contains_key<Q>(&self, key: &Q, hash: u32) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        if self.count() == 0 {
            return false;
        }
        let now = self.now();
        let (present, stale) = {
            let guard = &epoch::pin();
            let lookup = self.find(key, hash, guard);
            match lookup.node {
                None => (false, lookup.saw_reclaimed),
                Some(node) => {
                    let live = node.live_value(now, self.expires(), guard).is_some();
                    (live, !live)
                },
            }
        };
        if stale {
            self.try_maintain();
        }
        self.post_read_cleanup();
        present
    }

    /// Records an unlocked read for later replay.
    fn record_read(&self, node: &Node<K, V>, now: u64) {
        if let Some(Expiry::AfterAccess(ttl)) = self.context.expiry {
            node.extend_deadline(now.wrapping_add(ttl));
        }
        if self.records_access() {
            self.recency_queue.push(node.handle());
        }
    }

    fn post_read_cleanup(&self) {
        let reads = self.read_count.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        if reads & DRAIN_THRESHOLD == 0 {
            self.try_maintain();
        }
    }

    /// Runs the maintenance pass if the lock is free right now.
    fn try_maintain(&self) {
        let Some(mut state) = self.state.try_write() else {
            return;
        };
        {
            let guard = &epoch::pin();
            let now = self.now();
            self.run_locked_maintenance(&mut *state, now, false, guard);
        }
        drop(state);
        self.context.notifications.deliver_pending();
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Takes the write lock, reads the clock, runs maintenance, then `f`;
    /// delivers notifications once the lock is released.
    fn write_with<R>(&self, f: impl FnOnce(&mut SegmentState<K, V>, u64, &Guard) -> R) -> R {
        let result = {
            let mut state = self.state.write();
            let guard = &epoch::pin();
            let now = self.now();
            self.run_locked_maintenance(&mut *state, now, false, guard);
            f(&mut *state, now, guard)
        };
        self.context.notifications.deliver_pending();
        result
    }

    /// Looks up `key` under the lock, removing it first if it has already
    /// expired but was not yet reached by maintenance.
    fn find_live<'g, Q>(
        &self,
        state: &mut SegmentState<K, V>,
        key: &Q,
        hash: u32,
        now: u64,
        guard: &'g Guard,
    ) -> Option<&'g Node<K, V>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        let node = self.find(key, hash, guard).node?;
        if self.expires() && node.is_expired_at(now) {
            self.remove_entry(state, node.slot(), RemovalCause::Expired, guard);
            return None;
        }
        Some(node)
    }

    pub(crate) fn put(
        &self,
        key: Arc<K>,
        hash: u32,
        value: Arc<V>,
        only_if_absent: bool,
    ) -> Option<Arc<V>>
    where
        K: Eq,
    {
        self.write_with(|state, now, guard| {
            if let Some(cause) = self.discard_cause() {
                self.context
                    .notifications
                    .enqueue_with(|| RemovalNotification::new(Some(key), Some(value), cause));
                return None;
            }

            if state.entries.len() + 1 > state.threshold {
                self.expand(state, guard);
            }

            if let Some(node) = self.find_live(state, &*key, hash, now, guard) {
                let id = node.slot();
                return match node.value(guard).get() {
                    None => {
                        // The old value was reclaimed: this is an insert in
                        // everything but table position.
                        self.bump_mod_count();
                        self.set_value(node, value, guard);
                        self.context.notifications.enqueue_with(|| {
                            RemovalNotification::new(Some(key), None, RemovalCause::Collected)
                        });
                        self.record_write(state, id, node, now);
                        None
                    },
                    Some(existing) if only_if_absent => {
                        self.record_locked_read(state, id, node, now);
                        Some(existing)
                    },
                    Some(existing) => {
                        self.bump_mod_count();
                        let replaced = Arc::clone(&existing);
                        self.context.notifications.enqueue_with(|| {
                            RemovalNotification::new(
                                Some(key),
                                Some(replaced),
                                RemovalCause::Replaced,
                            )
                        });
                        self.set_value(node, value, guard);
                        self.record_write(state, id, node, now);
                        Some(existing)
                    },
                };
            }

            self.evict_for_insert(state, guard);

            let stamp = state.next_stamp();
            let id = state.entries.insert(Entry::detached());
            let deadline = self
                .context
                .expiry
                .map_or(0, |expiry| now.wrapping_add(expiry.nanos()));
            let bucket = self.table(guard).bucket(hash);
            let head = bucket.load(Ordering::Relaxed, guard);
            let node = self
                .context
                .factory
                .new_node(key, hash, id, stamp, value, deadline, head);
            let node = Owned::new(node).into_shared(guard);
            bucket.store(node, Ordering::Release);
            if let Some(entry) = state.entries.get(id) {
                entry.set_node(node);
            }
            // SAFETY: just published; retired only through the epoch.
            if let Some(node) = unsafe { node.as_ref() } {
                self.record_write(state, id, node, now);
            }
            self.bump_mod_count();
            self.publish_count(state);
            None
        })
    }

    /// Configurations that can never hold an entry discard every insert.
    fn discard_cause(&self) -> Option<RemovalCause> {
        if self.max_segment_size == Some(0) {
            Some(RemovalCause::Size)
        } else if self.context.expiry.is_some_and(|expiry| expiry.nanos() == 0) {
            Some(RemovalCause::Expired)
        } else {
            None
        }
    }

    pub(crate) fn remove<Q>(&self, key: &Q, hash: u32) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        if self.count() == 0 {
            return None;
        }
        self.write_with(|state, now, guard| {
            let node = self.find_live(state, key, hash, now, guard)?;
            let value = node.value(guard).get();
            let cause = if value.is_some() {
                RemovalCause::Explicit
            } else {
                RemovalCause::Collected
            };
            self.remove_entry(state, node.slot(), cause, guard);
            value
        })
    }

    pub(crate) fn remove_if_eq<Q>(&self, key: &Q, hash: u32, expected: &V) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
        V: PartialEq,
    {
        if self.count() == 0 {
            return false;
        }
        self.write_with(|state, now, guard| {
            let Some(node) = self.find_live(state, key, hash, now, guard) else {
                return false;
            };
            match node.value(guard).get() {
                Some(current) if *current == *expected => {
                    self.remove_entry(state, node.slot(), RemovalCause::Explicit, guard);
                    true
                },
                Some(_) => false,
                None => {
                    self.remove_entry(state, node.slot(), RemovalCause::Collected, guard);
                    false
                },
            }
        })
    }

    pub(crate) fn replace<Q>(&self, key: &Q, hash: u32, value: Arc<V>) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        if self.count() == 0 {
            return None;
        }
        self.write_with(|state, now, guard| {
            let node = self.find_live(state, key, hash, now, guard)?;
            let Some(existing) = node.value(guard).get() else {
                self.remove_entry(state, node.slot(), RemovalCause::Collected, guard);
                return None;
            };
            self.bump_mod_count();
            self.notify_replaced(node, Arc::clone(&existing));
            self.set_value(node, value, guard);
            self.record_write(state, node.slot(), node, now);
            Some(existing)
        })
    }

    pub(crate) fn replace_if_eq<Q>(
        &self,
        key: &Q,
        hash: u32,
        expected: &V,
        value: Arc<V>,
    ) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
        V: PartialEq,
    {
        if self.count() == 0 {
            return false;
        }
        self.write_with(|state, now, guard| {
            let Some(node) = self.find_live(state, key, hash, now, guard) else {
                return false;
            };
            match node.value(guard).get() {
                None => {
                    self.remove_entry(state, node.slot(), RemovalCause::Collected, guard);
                    false
                },
                Some(current) if *current == *expected => {
                    self.bump_mod_count();
                    self.notify_replaced(node, current);
                    self.set_value(node, value, guard);
                    self.record_write(state, node.slot(), node, now);
                    true
                },
                Some(_) => {
                    self.record_locked_read(state, node.slot(), node, now);
                    false
                },
            }
        })
    }

    /// Removes every entry, notifying each as explicitly removed.
    pub(crate) fn clear(&self) {
        if self.count() == 0 {
            return;
        }
        {
            let mut state = self.state.write();
            let guard = &epoch::pin();
            while self.recency_queue.pop().is_some() {}
            for bucket in self.table(guard).buckets.iter() {
                bucket.store(Shared::null(), Ordering::Release);
            }
            let notifications = &self.context.notifications;
            for entry in state.entries.drain() {
                let ptr = entry.node_ptr(guard);
                // SAFETY: unlinked above; readers pinned earlier keep the
                // node alive until they unpin.
                let Some(node) = (unsafe { ptr.as_ref() }) else {
                    continue;
                };
                let cause = if node.is_collected(guard) {
                    RemovalCause::Collected
                } else {
                    RemovalCause::Explicit
                };
                notifications.enqueue_with(|| {
                    RemovalNotification::new(node.key().get(), node.value(guard).get(), cause)
                });
                unsafe { guard.defer_destroy(ptr) };
            }
            state.eviction_queue.reset();
            state.expiration_queue.reset();
            self.read_count.store(0, Ordering::Release);
            self.bump_mod_count();
            self.publish_count(&state);
        }
        self.context.notifications.deliver_pending();
    }

    /// Runs a full maintenance pass, waiting for the lock.
    pub(crate) fn clean_up(&self) {
        {
            let mut state = self.state.write();
            let guard = &epoch::pin();
            let now = self.now();
            let before = state.entries.len();
            self.run_locked_maintenance(&mut *state, now, true, guard);
            trace!(
                removed = before - state.entries.len(),
                remaining = state.entries.len(),
                "segment maintenance"
            );
        }
        self.context.notifications.deliver_pending();
    }

    // -----------------------------------------------------------------------
    // Locked bookkeeping
    // -----------------------------------------------------------------------

    fn run_locked_maintenance(
        &self,
        state: &mut SegmentState<K, V>,
        now: u64,
        full: bool,
        guard: &Guard,
    ) {
        self.drain_recency_queue(state, guard);
        self.sweep_reclaimed(state, if full { None } else { Some(DRAIN_MAX) }, guard);
        self.expire_entries(state, now, guard);
        self.read_count.store(0, Ordering::Release);
    }

    /// Replays recorded reads onto the eviction and expiration orderings.
    fn drain_recency_queue(&self, state: &mut SegmentState<K, V>, guard: &Guard) {
        if !self.records_access() {
            return;
        }
        let refresh_expiration = self.context.expiry.is_some_and(Expiry::refreshes_on_read);
        // Readers may keep pushing; replay only what was queued on entry.
        for _ in 0..self.recency_queue.len() {
            let Some(handle) = self.recency_queue.pop() else {
                break;
            };
            let Some(node) = state.entries.get(handle.id).and_then(|e| e.node(guard)) else {
                continue;
            };
            if node.stamp() != handle.stamp {
                continue;
            }
            if state.eviction_queue.contains(&state.entries, handle.id) {
                state.eviction_queue.push_back(&mut state.entries, handle.id);
            }
            if refresh_expiration && state.expiration_queue.contains(&state.entries, handle.id) {
                self.enqueue_for_expiration(state, handle.id, node.deadline());
            }
        }
    }

    /// Removes entries whose key or value was reclaimed.
    ///
    /// `budget` limits the number of buckets visited; the cursor rotates so
    /// successive passes cover the whole table.
    fn sweep_reclaimed(&self, state: &mut SegmentState<K, V>, budget: Option<usize>, guard: &Guard) {
        if !self.context.factory.tracks_references() || state.entries.is_empty() {
            return;
        }
        let table = self.table(guard);
        let buckets = table.len();
        let span = budget.map_or(buckets, |budget| budget.min(buckets));
        let mut victims = Vec::new();
        for step in 0..span {
            let index = (state.sweep_cursor + step) & (buckets - 1);
            let mut cursor = table.buckets[index].load(Ordering::Relaxed, guard);
            // SAFETY: as in `find`.
            while let Some(node) = unsafe { cursor.as_ref() } {
                if node.is_collected(guard) {
                    victims.push(node.slot());
                }
                cursor = node.next(guard);
            }
        }
        state.sweep_cursor = (state.sweep_cursor + span) & (buckets - 1);
        for id in victims {
            self.remove_entry(state, id, RemovalCause::Collected, guard);
        }
    }

    /// Removes expired entries from the head of the expiration ordering.
    ///
    /// A head whose queued deadline has passed but whose node was refreshed
    /// by a read not yet replayed is moved to the tail instead.
    fn expire_entries(&self, state: &mut SegmentState<K, V>, now: u64, guard: &Guard) {
        if !self.expires() || state.expiration_queue.is_empty() {
            return;
        }
        for _ in 0..state.expiration_queue.len() {
            let Some(id) = state.expiration_queue.front() else {
                break;
            };
            let head = state
                .entries
                .get(id)
                .and_then(|e| e.node(guard).map(|node| (node, e.queued_deadline())));
            let Some((node, queued)) = head else {
                state.expiration_queue.pop_front(&mut state.entries);
                continue;
            };
            if node.is_expired_at(now) {
                self.remove_entry(state, id, RemovalCause::Expired, guard);
            } else if is_after(now, queued) {
                self.enqueue_for_expiration(state, id, node.deadline());
            } else {
                break;
            }
        }
    }

    /// Evicts least recently used entries until one more fits.
    fn evict_for_insert(&self, state: &mut SegmentState<K, V>, guard: &Guard) {
        let Some(max) = self.max_segment_size else {
            return;
        };
        self.drain_recency_queue(state, guard);
        while state.entries.len() >= max {
            let Some(victim) = state.eviction_queue.front() else {
                break;
            };
            self.remove_entry(state, victim, RemovalCause::Size, guard);
        }
    }

    /// Moves `id` to the tail of the expiration queue. The queued deadline is
    /// never earlier than the current tail's, which keeps the queue sorted
    /// even when a reader's clock ran ahead of the lock holder's.
    fn enqueue_for_expiration(&self, state: &mut SegmentState<K, V>, id: SlotId, deadline: u64) {
        let tail = state
            .expiration_queue
            .back()
            .and_then(|tail| state.entries.get(tail))
            .map(Entry::queued_deadline);
        let queued = tail.map_or(deadline, |tail| later_of(deadline, tail));
        if let Some(entry) = state.entries.get_mut(id) {
            entry.set_queued_deadline(queued);
        }
        state.expiration_queue.push_back(&mut state.entries, id);
    }

    fn record_write(&self, state: &mut SegmentState<K, V>, id: SlotId, node: &Node<K, V>, now: u64) {
        if self.context.factory.evictable() {
            state.eviction_queue.push_back(&mut state.entries, id);
        }
        if let Some(expiry) = self.context.expiry {
            let deadline = now.wrapping_add(expiry.nanos());
            match expiry {
                Expiry::AfterAccess(_) => node.extend_deadline(deadline),
                Expiry::AfterWrite(_) => node.set_deadline(deadline),
            }
            self.enqueue_for_expiration(state, id, deadline);
        }
    }

    fn record_locked_read(
        &self,
        state: &mut SegmentState<K, V>,
        id: SlotId,
        node: &Node<K, V>,
        now: u64,
    ) {
        if self.context.factory.evictable() {
            state.eviction_queue.push_back(&mut state.entries, id);
        }
        if let Some(Expiry::AfterAccess(ttl)) = self.context.expiry {
            let deadline = now.wrapping_add(ttl);
            node.extend_deadline(deadline);
            self.enqueue_for_expiration(state, id, deadline);
        }
    }

    fn set_value(&self, node: &Node<K, V>, value: Arc<V>, guard: &Guard) {
        node.swap_value(self.context.factory.value_ref(value), guard);
    }

    fn notify_replaced(&self, node: &Node<K, V>, old: Arc<V>) {
        self.context.notifications.enqueue_with(|| {
            RemovalNotification::new(node.key().get(), Some(old), RemovalCause::Replaced)
        });
    }

    fn remove_entry(
        &self,
        state: &mut SegmentState<K, V>,
        id: SlotId,
        cause: RemovalCause,
        guard: &Guard,
    ) {
        let Some(node) = state.entries.get(id).and_then(|e| e.node(guard)) else {
            return;
        };
        self.unlink(node, guard);
        self.discard_unlinked(state, id, cause, guard);
    }

    /// Detaches `node` from its bucket chain. Readers standing on it still
    /// follow its `next` back into the chain.
    fn unlink(&self, node: &Node<K, V>, guard: &Guard) {
        let mut link = self.table(guard).bucket(node.hash());
        loop {
            let current = link.load(Ordering::Relaxed, guard);
            // SAFETY: as in `find`.
            let Some(candidate) = (unsafe { current.as_ref() }) else {
                return;
            };
            if ptr::eq(candidate, node) {
                link.store(node.next(guard), Ordering::Release);
                return;
            }
            link = candidate.next_link();
        }
    }

    /// Drops an entry whose node is no longer in any bucket chain.
    fn discard_unlinked(
        &self,
        state: &mut SegmentState<K, V>,
        id: SlotId,
        cause: RemovalCause,
        guard: &Guard,
    ) {
        state.eviction_queue.remove(&mut state.entries, id);
        state.expiration_queue.remove(&mut state.entries, id);
        let Some(entry) = state.entries.remove(id) else {
            return;
        };
        let ptr = entry.node_ptr(guard);
        // SAFETY: unreachable from the table; readers pinned before the
        // unlink keep it alive until they unpin.
        if let Some(node) = unsafe { ptr.as_ref() } {
            self.context.notifications.enqueue_with(|| {
                RemovalNotification::new(node.key().get(), node.value(guard).get(), cause)
            });
            unsafe { guard.defer_destroy(ptr) };
        }
        self.bump_mod_count();
        self.publish_count(state);
    }

    /// Doubles the bucket table.
    ///
    /// For each old chain, the longest suffix whose members all land in the
    /// same new bucket is attached there unchanged; the preceding nodes are
    /// copied into the new table and the originals retired, so readers still
    /// walking the old table see intact chains. Reclaimed nodes met while
    /// copying are dropped instead.
    fn expand(&self, state: &mut SegmentState<K, V>, guard: &Guard) {
        let old_ptr = self.table.load(Ordering::Relaxed, guard);
        let old = self.table(guard);
        let old_capacity = old.len();
        if old_capacity >= MAXIMUM_CAPACITY {
            return;
        }
        let new_capacity = old_capacity << 1;
        let new = Table::new(new_capacity);
        state.threshold = threshold_for(new_capacity, self.max_segment_size);

        let mut retired = Vec::new();
        let mut collected = Vec::new();
        for bucket in old.buckets.iter() {
            let head = bucket.load(Ordering::Relaxed, guard);
            // SAFETY: as in `find`.
            let Some(head_node) = (unsafe { head.as_ref() }) else {
                continue;
            };

            let mut last_run = head;
            let mut last_index = new.index_of(head_node.hash());
            let mut cursor = head_node.next(guard);
            while let Some(node) = unsafe { cursor.as_ref() } {
                let index = new.index_of(node.hash());
                if index != last_index {
                    last_index = index;
                    last_run = cursor;
                }
                cursor = node.next(guard);
            }
            new.buckets[last_index].store(last_run, Ordering::Relaxed);

            let mut cursor = head;
            while cursor != last_run {
                // SAFETY: `cursor` precedes `last_run` in a live chain.
                let node = unsafe { cursor.deref() };
                let next = node.next(guard);
                if node.is_collected(guard) {
                    collected.push(node.slot());
                } else {
                    let target = &new.buckets[new.index_of(node.hash())];
                    let copy = node.duplicate(target.load(Ordering::Relaxed, guard), guard);
                    let copy = Owned::new(copy).into_shared(guard);
                    target.store(copy, Ordering::Relaxed);
                    if let Some(entry) = state.entries.get(node.slot()) {
                        entry.set_node(copy);
                    }
                    retired.push(cursor);
                }
                cursor = next;
            }
        }

        self.table.store(Owned::new(new), Ordering::Release);
        // SAFETY: the old table and the copied-over nodes are unreachable
        // for readers that pin from now on.
        unsafe {
            guard.defer_destroy(old_ptr);
            for node in retired {
                guard.defer_destroy(node);
            }
        }
        for id in collected {
            self.discard_unlinked(state, id, RemovalCause::Collected, guard);
        }
        trace!(old_capacity, new_capacity, "expanded segment table");
    }
}

impl<K, V> Drop for Segment<K, V> {
    fn drop(&mut self) {
        // SAFETY: `&mut self` means no reader or writer can reach the table;
        // every published node is owned by exactly one chain position.
        unsafe {
            let guard = epoch::unprotected();
            let table = self.table.load(Ordering::Relaxed, guard);
            let Some(current) = table.as_ref() else {
                return;
            };
            for bucket in current.buckets.iter() {
                let mut cursor = bucket.load(Ordering::Relaxed, guard);
                while let Some(node) = cursor.as_ref() {
                    let next = node.next(guard);
                    drop(cursor.into_owned());
                    cursor = next;
                }
            }
            drop(table.into_owned());
        }
    }
}

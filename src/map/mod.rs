//! The segmented concurrent map.
//!
//! A [`CacheMap`] splits its keys over a power-of-two number of
//! [`Segment`](segment::Segment)s chosen from the high bits of a spread
//! hash. Each segment is an independently locked hash table with its own
//! share of the maximum size, so contention and eviction stay local:
//!
//! ```text
//!   key ──hash_key──► spread u32 ──high bits──► segment[i]
//!                                 └─low bits──► bucket within segment[i]
//! ```
//!
//! Keys and values are stored as `Arc`s and handed back as `Arc`s; with
//! weak strength the map holds only `Weak` references (see [`Strength`]).
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use segmented_cache::CacheMap;
//!
//! let map: CacheMap<String, u64> = CacheMap::builder()
//!     .maximum_size(1_000)
//!     .expire_after_write(Duration::from_secs(60))
//!     .build();
//!
//! map.insert("answer".to_string(), 42);
//! assert_eq!(map.get("answer").as_deref(), Some(&42));
//! assert_eq!(map.len(), 1);
//! ```

pub(crate) mod entry;
pub mod iter;
pub mod reference;
pub(crate) mod segment;

use std::borrow::Borrow;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use rustc_hash::FxBuildHasher;
use tracing::debug;

use crate::builder::CacheMapBuilder;
use crate::ds::{MAX_SEGMENTS, SegmentSelector, hash_key};
use crate::error::InvariantError;
use crate::notification::{NotificationQueue, RemovalListener};
use crate::time::Ticker;

pub use iter::{Iter, Keys, Values};
pub use reference::Strength;

use entry::EntryFactory;
use segment::{Expiry, MAXIMUM_CAPACITY, Segment, SegmentContext};

/// Attempts at a consistent unlocked read of the segment counters.
const RETRIES_BEFORE_GIVING_UP: usize = 3;

/// Smallest per-segment share of the maximum size that justifies another
/// segment.
const MIN_ENTRIES_PER_SEGMENT: usize = 20;

/// Validated construction parameters, produced by [`CacheMapBuilder`].
pub(crate) struct MapSettings<K, V, S> {
    pub(crate) concurrency_level: usize,
    pub(crate) initial_capacity: usize,
    pub(crate) maximum_size: Option<usize>,
    pub(crate) key_strength: Strength,
    pub(crate) value_strength: Strength,
    pub(crate) expiry: Option<Expiry>,
    pub(crate) listener: Option<Arc<dyn RemovalListener<K, V>>>,
    pub(crate) ticker: Arc<dyn Ticker>,
    pub(crate) hasher: S,
}

/// A concurrent, segmented hash map with optional size eviction,
/// expiration, weak references and removal notifications.
///
/// All operations take `&self`; share the map between threads with an
/// `Arc<CacheMap<..>>`.
pub struct CacheMap<K, V, S = FxBuildHasher> {
    segments: Box<[Segment<K, V>]>,
    selector: SegmentSelector,
    hasher: S,
    context: Arc<SegmentContext<K, V>>,
    maximum_size: Option<usize>,
}

impl<K, V> CacheMap<K, V>
where
    K: Hash + Eq,
{
    /// Creates an unbounded map with strong references and default tuning.
    pub fn new() -> Self {
        CacheMapBuilder::new().build()
    }

    /// Starts configuring a map.
    pub fn builder() -> CacheMapBuilder<K, V> {
        CacheMapBuilder::new()
    }
}

impl<K, V> Default for CacheMap<K, V>
where
    K: Hash + Eq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> CacheMap<K, V, S> {
    pub(crate) fn from_settings(settings: MapSettings<K, V, S>) -> Self {
        let MapSettings {
            concurrency_level,
            initial_capacity,
            maximum_size,
            key_strength,
            value_strength,
            expiry,
            listener,
            ticker,
            hasher,
        } = settings;

        let concurrency_level = concurrency_level.min(MAX_SEGMENTS);
        let mut segment_count = 1usize;
        while segment_count < concurrency_level
            && maximum_size.is_none_or(|max| segment_count * MIN_ENTRIES_PER_SEGMENT <= max)
        {
            segment_count <<= 1;
        }
        let selector = SegmentSelector::new(segment_count);

        let mut initial_capacity = initial_capacity.min(MAXIMUM_CAPACITY);
        if let Some(max) = maximum_size {
            initial_capacity = initial_capacity.min(max);
        }
        let segment_capacity = initial_capacity
            .div_ceil(segment_count)
            .max(1)
            .next_power_of_two();

        let context = Arc::new(SegmentContext {
            factory: EntryFactory::new(
                key_strength,
                value_strength,
                maximum_size.is_some(),
                expiry.is_some(),
            ),
            expiry,
            ticker,
            notifications: NotificationQueue::new(listener),
        });

        let segments = (0..segment_count)
            .map(|index| {
                let share = maximum_size.map(|max| {
                    let base = max / segment_count;
                    if index < max % segment_count { base + 1 } else { base }
                });
                Segment::new(segment_capacity, share, Arc::clone(&context))
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        debug!(
            segments = segment_count,
            segment_capacity,
            maximum_size = ?maximum_size,
            expiry = ?expiry,
            ?key_strength,
            ?value_strength,
            notifications = context.notifications.is_enabled(),
            "created cache map"
        );

        Self {
            segments,
            selector,
            hasher,
            context,
            maximum_size,
        }
    }

    pub(crate) fn segments(&self) -> &[Segment<K, V>] {
        &self.segments
    }

    #[inline]
    pub(crate) fn now(&self) -> u64 {
        self.context.ticker.read()
    }

    #[inline]
    pub(crate) fn expires(&self) -> bool {
        self.context.expiry.is_some()
    }

    /// Number of segments, always a power of two.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// The configured maximum number of entries, if size-bounded.
    pub fn maximum_size(&self) -> Option<usize> {
        self.maximum_size
    }

    fn mod_count_sum(&self) -> usize {
        self.segments
            .iter()
            .fold(0usize, |sum, s| sum.wrapping_add(s.mod_count()))
    }

    /// Number of entries, including expired or reclaimed entries not yet
    /// cleaned up.
    ///
    /// Segment counts are summed without locking and the sum is accepted
    /// once the segments' modification counters are unchanged across the
    /// read; under constant writes the last sum is returned.
    pub fn len(&self) -> usize {
        let mut sum = 0;
        for _ in 0..RETRIES_BEFORE_GIVING_UP {
            let before = self.mod_count_sum();
            sum = self.segments.iter().map(Segment::count).sum();
            if self.mod_count_sum() == before {
                break;
            }
        }
        sum
    }

    /// Returns `true` if no segment held an entry at any single moment
    /// observed by the check.
    pub fn is_empty(&self) -> bool {
        let mut mod_counts = Vec::with_capacity(self.segments.len());
        for segment in self.segments.iter() {
            if segment.count() != 0 {
                return false;
            }
            mod_counts.push(segment.mod_count());
        }
        // A segment may have been filled and drained while others were read.
        self.segments
            .iter()
            .zip(mod_counts)
            .all(|(segment, seen)| segment.count() == 0 && segment.mod_count() == seen)
    }

    /// Returns `true` if some live entry holds a value equal to `value`.
    ///
    /// This scans every segment and is proportional to the map's size.
    pub fn contains_value(&self, value: &V) -> bool
    where
        V: PartialEq,
    {
        let now = self.now();
        let mut last = None;
        for _ in 0..RETRIES_BEFORE_GIVING_UP {
            let mut sum = 0usize;
            for segment in self.segments.iter() {
                if segment.contains_value(value, now) {
                    return true;
                }
                sum = sum.wrapping_add(segment.mod_count());
            }
            if last == Some(sum) {
                break;
            }
            last = Some(sum);
        }
        false
    }

    /// Iterates over live `(key, value)` pairs.
    ///
    /// Weakly consistent: never fails under concurrent modification and
    /// never yields an entry that was already gone when its segment was
    /// reached.
    pub fn iter(&self) -> Iter<'_, K, V, S> {
        Iter::new(self)
    }

    pub fn keys(&self) -> Keys<'_, K, V, S> {
        Keys::new(self)
    }

    pub fn values(&self) -> Values<'_, K, V, S> {
        Values::new(self)
    }

    /// Validates every segment's internal structure.
    ///
    /// Intended for tests; takes each segment's lock in shared mode in turn.
    pub fn check_invariants(&self) -> Result<(), InvariantError> {
        if !self.segments.len().is_power_of_two()
            || self.segments.len() != self.selector.segment_count()
        {
            return Err(InvariantError::new(format!(
                "{} segments for a selector over {}",
                self.segments.len(),
                self.selector.segment_count()
            )));
        }
        if let Some(max) = self.maximum_size {
            let shares: usize = self
                .segments
                .iter()
                .filter_map(Segment::max_segment_size)
                .sum();
            if shares != max {
                return Err(InvariantError::new(format!(
                    "segment shares sum to {}, maximum is {}",
                    shares, max
                )));
            }
        }
        for (index, segment) in self.segments.iter().enumerate() {
            segment
                .check_invariants()
                .map_err(|err| InvariantError::new(format!("segment {}: {}", index, err)))?;
        }
        Ok(())
    }
}

/// Removed nodes and values are freed once no reader can still see them,
/// possibly on another thread.
impl<K, V, S> CacheMap<K, V, S>
where
    K: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Removes every entry, notifying each as explicitly removed.
    pub fn clear(&self) {
        for segment in self.segments.iter() {
            segment.clear();
        }
    }

    /// Runs all pending maintenance now: replays recorded reads, removes
    /// every expired entry and every entry whose weak key or value has been
    /// reclaimed, and delivers the resulting notifications.
    pub fn clean_up(&self) {
        for segment in self.segments.iter() {
            segment.clean_up();
        }
    }
}

impl<K, V, S> CacheMap<K, V, S>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher,
{
    #[inline]
    fn segment_for<Q>(&self, key: &Q) -> (&Segment<K, V>, u32)
    where
        Q: Hash + ?Sized,
    {
        let hash = hash_key(&self.hasher, key);
        (&self.segments[self.selector.segment_for(hash)], hash)
    }

    /// Returns the value for `key` if it is present and live.
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (segment, hash) = self.segment_for(key);
        segment.get(key, hash)
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (segment, hash) = self.segment_for(key);
        segment.contains_key(key, hash)
    }

    /// Associates `value` with `key`, returning the previous live value.
    ///
    /// A replaced value produces a [`Replaced`] notification. On a
    /// size-bounded map the insert may evict the segment's least recently
    /// used entry first.
    ///
    /// [`Replaced`]: crate::notification::RemovalCause::Replaced
    pub fn insert(&self, key: impl Into<Arc<K>>, value: impl Into<Arc<V>>) -> Option<Arc<V>> {
        let key = key.into();
        let (segment, hash) = self.segment_for(&*key);
        segment.put(key, hash, value.into(), false)
    }

    /// Inserts only if no live value is present; otherwise returns the
    /// existing value and leaves it in place.
    pub fn insert_if_absent(
        &self,
        key: impl Into<Arc<K>>,
        value: impl Into<Arc<V>>,
    ) -> Option<Arc<V>> {
        let key = key.into();
        let (segment, hash) = self.segment_for(&*key);
        segment.put(key, hash, value.into(), true)
    }

    /// Removes `key`, returning its live value.
    pub fn remove<Q>(&self, key: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (segment, hash) = self.segment_for(key);
        segment.remove(key, hash)
    }

    /// Removes `key` only if its live value equals `expected`.
    pub fn remove_if_eq<Q>(&self, key: &Q, expected: &V) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        let (segment, hash) = self.segment_for(key);
        segment.remove_if_eq(key, hash, expected)
    }

    /// Replaces the value of `key` only if it is present.
    pub fn replace<Q>(&self, key: &Q, value: impl Into<Arc<V>>) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let (segment, hash) = self.segment_for(key);
        segment.replace(key, hash, value.into())
    }

    /// Replaces the value of `key` only if its live value equals `expected`.
    pub fn replace_if_eq<Q>(&self, key: &Q, expected: &V, value: impl Into<Arc<V>>) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: PartialEq,
    {
        let (segment, hash) = self.segment_for(key);
        segment.replace_if_eq(key, hash, expected, value.into())
    }
}

impl<K, V, S> fmt::Debug for CacheMap<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheMap")
            .field("len", &self.len())
            .field("segments", &self.segments.len())
            .field("maximum_size", &self.maximum_size)
            .field("expiry", &self.context.expiry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::time::FakeTicker;

    #[test]
    fn segment_count_follows_concurrency_and_size() {
        let map: CacheMap<u64, u64> = CacheMap::builder().concurrency_level(16).build();
        assert_eq!(map.segment_count(), 16);

        let map: CacheMap<u64, u64> = CacheMap::builder().concurrency_level(5).build();
        assert_eq!(map.segment_count(), 8);

        // 100 entries support at most 4 segments of 20+.
        let map: CacheMap<u64, u64> = CacheMap::builder()
            .concurrency_level(64)
            .maximum_size(100)
            .build();
        assert_eq!(map.segment_count(), 4);

        let map: CacheMap<u64, u64> = CacheMap::builder().maximum_size(10).build();
        assert_eq!(map.segment_count(), 1);
    }

    #[test]
    fn maximum_size_is_distributed_exactly() {
        let map: CacheMap<u64, u64> = CacheMap::builder()
            .concurrency_level(4)
            .maximum_size(103)
            .build();
        let shares: Vec<_> = map
            .segments()
            .iter()
            .filter_map(Segment::max_segment_size)
            .collect();
        assert_eq!(shares, vec![26, 26, 26, 25]);
        map.check_invariants().unwrap();
    }

    #[test]
    fn basic_operations() {
        let map: CacheMap<String, u32> = CacheMap::new();
        assert!(map.is_empty());
        assert_eq!(map.insert("a".to_string(), 1), None);
        assert_eq!(map.insert("a".to_string(), 2).as_deref(), Some(&1));
        assert_eq!(map.insert_if_absent("a".to_string(), 3).as_deref(), Some(&2));
        assert!(map.contains_key("a"));
        assert!(map.contains_value(&2));
        assert!(!map.contains_value(&3));
        assert_eq!(map.len(), 1);
        assert!(!map.is_empty());

        assert_eq!(map.replace("missing", 9), None);
        assert!(!map.contains_key("missing"));
        assert!(map.replace_if_eq("a", &2, 4));
        assert!(!map.remove_if_eq("a", &2));
        assert_eq!(map.remove("a").as_deref(), Some(&4));
        assert!(map.is_empty());
        map.check_invariants().unwrap();
    }

    #[test]
    fn iteration_skips_expired_entries() {
        let ticker = Arc::new(FakeTicker::new());
        let map: CacheMap<u32, u32> = CacheMap::builder()
            .expire_after_write(Duration::from_secs(1))
            .ticker(ticker.clone())
            .build();
        map.insert(1, 10);
        ticker.advance(Duration::from_millis(600));
        map.insert(2, 20);
        ticker.advance(Duration::from_millis(600));

        let mut live: Vec<_> = map.iter().map(|(k, v)| (*k, *v)).collect();
        live.sort_unstable();
        assert_eq!(live, vec![(2, 20)]);
        assert_eq!(map.keys().map(|k| *k).collect::<Vec<_>>(), vec![2]);
        assert_eq!(map.values().map(|v| *v).collect::<Vec<_>>(), vec![20]);
    }

    #[test]
    fn debug_output_is_summary() {
        let map: CacheMap<u32, u32> = CacheMap::builder().maximum_size(50).build();
        map.insert(1, 1);
        let rendered = format!("{:?}", map);
        assert!(rendered.contains("CacheMap"));
        assert!(rendered.contains("len: 1"));
        assert!(rendered.contains("maximum_size: Some(50)"));
    }
}

#[cfg(test)]
mod property_tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use super::*;
    use crate::time::FakeTicker;
    use proptest::prelude::*;

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u16, u16),
        InsertIfAbsent(u16, u16),
        Remove(u16),
        Replace(u16, u16),
        Get(u16),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u16..64, any::<u16>()).prop_map(|(k, v)| Op::Insert(k, v)),
            (0u16..64, any::<u16>()).prop_map(|(k, v)| Op::InsertIfAbsent(k, v)),
            (0u16..64).prop_map(Op::Remove),
            (0u16..64, any::<u16>()).prop_map(|(k, v)| Op::Replace(k, v)),
            (0u16..64).prop_map(Op::Get),
        ]
    }

    #[derive(Debug, Clone)]
    enum TimedOp {
        Insert(u8, u16),
        Get(u8),
        Replace(u8, u16),
        AdvanceMillis(u16),
    }

    fn timed_op() -> impl Strategy<Value = TimedOp> {
        prop_oneof![
            3 => (0u8..16, any::<u16>()).prop_map(|(k, v)| TimedOp::Insert(k, v)),
            3 => (0u8..16).prop_map(TimedOp::Get),
            1 => (0u8..16, any::<u16>()).prop_map(|(k, v)| TimedOp::Replace(k, v)),
            2 => (0u16..150).prop_map(TimedOp::AdvanceMillis),
        ]
    }

    /// Replays `ops` against an expiring map and a model of
    /// `key -> (value, last refresh)`, checking invariants after every step.
    fn run_timed(ops: Vec<TimedOp>, refresh_on_read: bool) -> Result<(), TestCaseError> {
        let ttl = Duration::from_millis(100);
        let ttl_nanos = ttl.as_nanos() as u64;
        let ticker = Arc::new(FakeTicker::new());
        let builder = CacheMap::builder().concurrency_level(2).ticker(ticker.clone());
        let builder = if refresh_on_read {
            builder.expire_after_access(ttl)
        } else {
            builder.expire_after_write(ttl)
        };
        let map: CacheMap<u8, u16> = builder.build();
        let mut model: HashMap<u8, (u16, u64)> = HashMap::new();

        for op in ops {
            let now = ticker.read();
            model.retain(|_, (_, touched)| now - *touched <= ttl_nanos);
            match op {
                TimedOp::Insert(k, v) => {
                    let previous = model.insert(k, (v, now)).map(|(old, _)| old);
                    prop_assert_eq!(map.insert(k, v).map(|x| *x), previous);
                },
                TimedOp::Get(k) => {
                    let expected = model.get_mut(&k).map(|(value, touched)| {
                        if refresh_on_read {
                            *touched = now;
                        }
                        *value
                    });
                    prop_assert_eq!(map.get(&k).map(|x| *x), expected);
                },
                TimedOp::Replace(k, v) => {
                    let previous = model
                        .get_mut(&k)
                        .map(|slot| std::mem::replace(slot, (v, now)).0);
                    prop_assert_eq!(map.replace(&k, v).map(|x| *x), previous);
                },
                TimedOp::AdvanceMillis(ms) => ticker.advance(Duration::from_millis(u64::from(ms))),
            }
            if let Err(err) = map.check_invariants() {
                return Err(TestCaseError::fail(err.to_string()));
            }
        }

        let now = ticker.read();
        model.retain(|_, (_, touched)| now - *touched <= ttl_nanos);
        map.clean_up();
        prop_assert_eq!(map.len(), model.len());
        prop_assert!(map.check_invariants().is_ok());
        Ok(())
    }

    proptest! {
        /// Write expiration removes exactly the entries not written for
        /// longer than the duration, and keeps the deadline queue sorted.
        #[cfg_attr(miri, ignore)]
        #[test]
        fn prop_expire_after_write_matches_model(ops in prop::collection::vec(timed_op(), 0..200)) {
            run_timed(ops, false)?;
        }

        /// Same under access expiration, where reads push deadlines out.
        #[cfg_attr(miri, ignore)]
        #[test]
        fn prop_expire_after_access_matches_model(ops in prop::collection::vec(timed_op(), 0..200)) {
            run_timed(ops, true)?;
        }

        /// An unbounded map behaves exactly like a `HashMap`.
        #[cfg_attr(miri, ignore)]
        #[test]
        fn prop_matches_hashmap(ops in prop::collection::vec(op(), 0..300)) {
            let map: CacheMap<u16, u16> = CacheMap::builder().concurrency_level(4).build();
            let mut model = HashMap::new();
            for op in ops {
                match op {
                    Op::Insert(k, v) => {
                        prop_assert_eq!(map.insert(k, v).map(|x| *x), model.insert(k, v));
                    },
                    Op::InsertIfAbsent(k, v) => {
                        let existing = model.get(&k).copied();
                        if existing.is_none() {
                            model.insert(k, v);
                        }
                        prop_assert_eq!(map.insert_if_absent(k, v).map(|x| *x), existing);
                    },
                    Op::Remove(k) => {
                        prop_assert_eq!(map.remove(&k).map(|x| *x), model.remove(&k));
                    },
                    Op::Replace(k, v) => {
                        let previous = model.get_mut(&k).map(|slot| std::mem::replace(slot, v));
                        prop_assert_eq!(map.replace(&k, v).map(|x| *x), previous);
                    },
                    Op::Get(k) => {
                        prop_assert_eq!(map.get(&k).map(|x| *x), model.get(&k).copied());
                    },
                }
            }
            prop_assert_eq!(map.len(), model.len());
            prop_assert!(map.check_invariants().is_ok());
        }

        /// A bounded map never holds more than its maximum size.
        #[cfg_attr(miri, ignore)]
        #[test]
        fn prop_len_within_maximum(
            max in 0usize..120,
            concurrency in 1usize..16,
            keys in prop::collection::vec(0u32..500, 0..400)
        ) {
            let map: CacheMap<u32, u32> = CacheMap::builder()
                .concurrency_level(concurrency)
                .maximum_size(max)
                .build();
            for key in keys {
                map.insert(key, key);
                prop_assert!(map.len() <= max);
            }
            prop_assert!(map.check_invariants().is_ok());
        }
    }
}

//! Weakly consistent iteration over a [`CacheMap`].
//!
//! Each segment's published table is copied out when the iterator first
//! reaches it; iteration takes no lock at all.
//! Entries removed or expired after the copy are skipped when yielded;
//! entries inserted into a segment after it was copied are not seen.

use std::fmt::{self, Debug};
use std::iter::FusedIterator;
use std::sync::Arc;

use crate::map::CacheMap;
use crate::map::segment::Snapshot;
use crate::time::is_after;

/// Iterator over `(key, value)` pairs, created by [`CacheMap::iter`].
pub struct Iter<'a, K, V, S> {
    map: &'a CacheMap<K, V, S>,
    next_segment: usize,
    current: std::vec::IntoIter<Snapshot<K, V>>,
}

impl<'a, K, V, S> Iter<'a, K, V, S> {
    pub(crate) fn new(map: &'a CacheMap<K, V, S>) -> Self {
        Self {
            map,
            next_segment: 0,
            current: Vec::new().into_iter(),
        }
    }

    fn advance_segment(&mut self) -> bool {
        let segments = self.map.segments();
        while self.next_segment < segments.len() {
            let segment = &segments[self.next_segment];
            self.next_segment += 1;
            let snapshot = segment.snapshot(self.map.now());
            if !snapshot.is_empty() {
                self.current = snapshot.into_iter();
                return true;
            }
        }
        false
    }
}

impl<K, V, S> Iterator for Iter<'_, K, V, S> {
    type Item = (Arc<K>, Arc<V>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            while let Some(snapshot) = self.current.next() {
                if self.map.expires() && is_after(self.map.now(), snapshot.deadline) {
                    continue;
                }
                if let (Some(key), Some(value)) = (snapshot.key.get(), snapshot.value.get()) {
                    return Some((key, value));
                }
            }
            if !self.advance_segment() {
                return None;
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, None)
    }
}

impl<K, V, S> FusedIterator for Iter<'_, K, V, S> {}

impl<K, V, S> Debug for Iter<'_, K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Iter")
            .field("next_segment", &self.next_segment)
            .field("buffered", &self.current.len())
            .finish()
    }
}

/// Iterator over keys, created by [`CacheMap::keys`].
pub struct Keys<'a, K, V, S> {
    inner: Iter<'a, K, V, S>,
}

impl<'a, K, V, S> Keys<'a, K, V, S> {
    pub(crate) fn new(map: &'a CacheMap<K, V, S>) -> Self {
        Self {
            inner: Iter::new(map),
        }
    }
}

impl<K, V, S> Iterator for Keys<'_, K, V, S> {
    type Item = Arc<K>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(k, _)| k)
    }
}

impl<K, V, S> FusedIterator for Keys<'_, K, V, S> {}

impl<K, V, S> Debug for Keys<'_, K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys").field("inner", &self.inner).finish()
    }
}

/// Iterator over values, created by [`CacheMap::values`].
pub struct Values<'a, K, V, S> {
    inner: Iter<'a, K, V, S>,
}

impl<'a, K, V, S> Values<'a, K, V, S> {
    pub(crate) fn new(map: &'a CacheMap<K, V, S>) -> Self {
        Self {
            inner: Iter::new(map),
        }
    }
}

impl<K, V, S> Iterator for Values<'_, K, V, S> {
    type Item = Arc<V>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|(_, v)| v)
    }
}

impl<K, V, S> FusedIterator for Values<'_, K, V, S> {}

impl<K, V, S> Debug for Values<'_, K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Values").field("inner", &self.inner).finish()
    }
}

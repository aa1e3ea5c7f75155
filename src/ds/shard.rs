//! Hash spreading and segment selection.
//!
//! Keys are hashed once with the map's `BuildHasher`, folded to 32 bits and
//! then passed through [`spread_hash`]. Both consumers of the result mask it
//! against a power of two:
//!
//! ```text
//!   key ──BuildHasher──► u64 ──fold──► u32 ──spread_hash──► h
//!
//!   segment index = (h >> shift) & (segments - 1)     high bits
//!   bucket index  =  h & (table_len - 1)              low bits
//! ```
//!
//! Because segment selection uses the high bits and bucket selection the low
//! bits, a hasher whose output varies in only a few bit positions would
//! otherwise pile keys into one segment or one bucket. The spreading step
//! mixes every input bit into both ends of the word.
//!
//! ## Example Usage
//!
//! ```
//! use segmented_cache::ds::{SegmentSelector, spread_hash};
//!
//! let selector = SegmentSelector::new(8);
//! assert_eq!(selector.segment_count(), 8);
//!
//! let h = spread_hash(0xdead_beef);
//! assert!(selector.segment_for(h) < 8);
//! assert_eq!(selector.segment_for(h), selector.segment_for(h));
//! ```

use std::hash::{BuildHasher, Hash, Hasher};

/// Upper bound on the number of segments.
pub const MAX_SEGMENTS: usize = 1 << 16;

/// Applies a supplemental bit-mixing function to a 32-bit hash.
///
/// This is a variant of the single-word Wang/Jenkins integer hash. It is a
/// bijection, so distinct inputs stay distinct; its only purpose is to push
/// entropy into the bit ranges that power-of-two masking looks at.
#[inline]
pub fn spread_hash(h: u32) -> u32 {
    let mut h = h;
    h = h.wrapping_add((h << 15) ^ 0xffff_cd7d);
    h ^= h >> 10;
    h = h.wrapping_add(h << 3);
    h ^= h >> 6;
    h = h.wrapping_add((h << 2).wrapping_add(h << 14));
    h ^ (h >> 16)
}

/// Hashes `key` with `hasher` and spreads the folded result.
#[inline]
pub fn hash_key<Q, S>(hasher: &S, key: &Q) -> u32
where
    Q: Hash + ?Sized,
    S: BuildHasher,
{
    let mut state = hasher.build_hasher();
    key.hash(&mut state);
    let full = state.finish();
    spread_hash((full ^ (full >> 32)) as u32)
}

/// Maps spread hashes to one of a power-of-two number of segments.
///
/// The segment count is the smallest power of two not below the requested
/// count, clamped to `[1, MAX_SEGMENTS]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentSelector {
    shift: u32,
    mask: u32,
}

impl SegmentSelector {
    /// Creates a selector for at least `segments` segments.
    ///
    /// ```
    /// use segmented_cache::ds::SegmentSelector;
    ///
    /// assert_eq!(SegmentSelector::new(5).segment_count(), 8);
    /// assert_eq!(SegmentSelector::new(0).segment_count(), 1);
    /// ```
    pub fn new(segments: usize) -> Self {
        let count = segments.clamp(1, MAX_SEGMENTS).next_power_of_two();
        let bits = count.trailing_zeros();
        Self {
            shift: 32 - bits,
            mask: (count - 1) as u32,
        }
    }

    pub fn segment_count(&self) -> usize {
        self.mask as usize + 1
    }

    /// Selects a segment from the high bits of a spread hash.
    #[inline]
    pub fn segment_for(&self, hash: u32) -> usize {
        // A shift of 32 (single segment) must yield 0, not overflow.
        (hash.checked_shr(self.shift).unwrap_or(0) & self.mask) as usize
    }
}

impl Default for SegmentSelector {
    /// A single-segment selector.
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxBuildHasher;

    #[test]
    fn selector_rounds_up_to_power_of_two() {
        assert_eq!(SegmentSelector::new(1).segment_count(), 1);
        assert_eq!(SegmentSelector::new(3).segment_count(), 4);
        assert_eq!(SegmentSelector::new(16).segment_count(), 16);
        assert_eq!(
            SegmentSelector::new(usize::MAX).segment_count(),
            MAX_SEGMENTS
        );
    }

    #[test]
    fn single_segment_always_selects_zero() {
        let selector = SegmentSelector::new(1);
        for h in [0u32, 1, 0x8000_0000, u32::MAX] {
            assert_eq!(selector.segment_for(h), 0);
        }
    }

    #[test]
    fn selection_uses_high_bits() {
        let selector = SegmentSelector::new(4);
        assert_eq!(selector.segment_for(0x0000_ffff), 0);
        assert_eq!(selector.segment_for(0x4000_0000), 1);
        assert_eq!(selector.segment_for(0xc000_0000), 3);
    }

    #[test]
    fn spreading_separates_low_bit_only_hashes() {
        // Hashes that differ only above bit 20 would all land in bucket 0 of a
        // small table without spreading.
        let buckets: std::collections::HashSet<u32> =
            (0u32..64).map(|i| spread_hash(i << 20) & 15).collect();
        assert!(buckets.len() > 8, "only {} buckets used", buckets.len());
    }

    #[test]
    fn hash_key_is_deterministic_for_equal_keys() {
        let hasher = FxBuildHasher;
        assert_eq!(hash_key(&hasher, "user:1"), hash_key(&hasher, "user:1"));
        assert_eq!(
            hash_key(&hasher, &String::from("k")),
            hash_key(&hasher, "k")
        );
    }
}

//! Time sources for expiration.
//!
//! A [`Ticker`] reports nanoseconds on an arbitrary monotonic origin. Values
//! may wrap around `u64::MAX`; every comparison the cache makes is
//! wrap-safe (see [`is_after`]).
//!
//! ```
//! use std::time::Duration;
//! use segmented_cache::time::{FakeTicker, Ticker};
//!
//! let ticker = FakeTicker::new();
//! ticker.advance(Duration::from_millis(5));
//! assert_eq!(ticker.read(), 5_000_000);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A monotonic nanosecond clock.
pub trait Ticker: Send + Sync {
    fn read(&self) -> u64;
}

/// Reads `std::time::Instant` relative to the ticker's creation.
#[derive(Debug, Clone, Copy)]
pub struct SystemTicker {
    origin: Instant,
}

impl SystemTicker {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemTicker {
    fn default() -> Self {
        Self::new()
    }
}

impl Ticker for SystemTicker {
    fn read(&self) -> u64 {
        // Truncation only matters after ~584 years of uptime; wrap-safe
        // comparisons tolerate it anyway.
        self.origin.elapsed().as_nanos() as u64
    }
}

/// A manually advanced ticker for deterministic tests.
#[derive(Debug, Default)]
pub struct FakeTicker {
    nanos: AtomicU64,
}

impl FakeTicker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the ticker at `nanos`.
    pub fn starting_at(nanos: u64) -> Self {
        Self {
            nanos: AtomicU64::new(nanos),
        }
    }

    /// Moves time forward, wrapping at `u64::MAX`.
    pub fn advance(&self, by: Duration) {
        let delta = duration_to_nanos(by);
        let _ = self
            .nanos
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.wrapping_add(delta))
            });
    }

    pub fn set_nanos(&self, nanos: u64) {
        self.nanos.store(nanos, Ordering::Release);
    }
}

impl Ticker for FakeTicker {
    fn read(&self) -> u64 {
        self.nanos.load(Ordering::Acquire)
    }
}

/// Converts a duration to nanoseconds, clamped to `i64::MAX`.
///
/// Deadlines are compared through a signed difference, so no single offset
/// may exceed half the `u64` range.
pub(crate) fn duration_to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos())
        .unwrap_or(u64::MAX)
        .min(i64::MAX as u64)
}

/// Returns `true` if `now` is strictly past `deadline`, across wraparound.
#[inline]
pub(crate) fn is_after(now: u64, deadline: u64) -> bool {
    (now.wrapping_sub(deadline) as i64) > 0
}

/// The later of two instants, across wraparound.
#[inline]
pub(crate) fn later_of(a: u64, b: u64) -> u64 {
    if is_after(a, b) { a } else { b }
}

//! Error types for the segmented cache.
//!
//! ## Key Components
//!
//! - [`InvariantError`]: Returned by [`CacheMap::check_invariants`] when a
//!   segment's chains, orderings or counters disagree.
//! - [`ConfigError`]: Returned by [`CacheMapBuilder::try_build`] when the
//!   configuration is invalid, for example when an option is set twice.
//!
//! ## Example Usage
//!
//! ```
//! use std::time::Duration;
//! use segmented_cache::CacheMap;
//! use segmented_cache::error::ConfigError;
//!
//! let ok: Result<CacheMap<String, i32>, ConfigError> =
//!     CacheMap::builder().maximum_size(100).try_build();
//! assert!(ok.is_ok());
//!
//! let bad = CacheMap::<String, i32>::builder()
//!     .expire_after_write(Duration::from_secs(1))
//!     .expire_after_access(Duration::from_secs(1))
//!     .try_build();
//! assert!(bad.is_err());
//! ```
//!
//! [`CacheMap::check_invariants`]: crate::CacheMap::check_invariants
//! [`CacheMapBuilder::try_build`]: crate::builder::CacheMapBuilder::try_build

use std::fmt;

// ---------------------------------------------------------------------------
// InvariantError
// ---------------------------------------------------------------------------

/// Error returned when a map's internal structure is inconsistent.
///
/// Produced by [`CacheMap::check_invariants`](crate::CacheMap::check_invariants).
/// The message names the segment and the structure that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvariantError(String);

impl InvariantError {
    /// Creates a new `InvariantError` with the given description.
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Returns the error description.
    #[inline]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvariantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for InvariantError {}

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Error returned when a builder configuration is invalid.
///
/// Only the first problem found is reported.
///
/// # Example
///
/// ```
/// use segmented_cache::CacheMap;
///
/// let err = CacheMap::<u64, u64>::builder()
///     .concurrency_level(0)
///     .try_build()
///     .unwrap_err();
/// assert!(err.to_string().contains("concurrency level"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError(String);

impl ConfigError {
    /// Creates a new `ConfigError` with the given description.
    #[inline]
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }

    /// Returns the error description.
    #[inline]
    pub fn message(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for ConfigError {}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

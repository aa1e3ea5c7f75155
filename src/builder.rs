//! Fluent configuration for [`CacheMap`].
//!
//! Every option may be set at most once; setting one twice, or combining
//! options that exclude each other, is reported by [`try_build`] as a
//! [`ConfigError`] (and by [`build`] as a panic).
//!
//! ## Example
//!
//! ```rust
//! use std::time::Duration;
//! use segmented_cache::builder::CacheMapBuilder;
//! use segmented_cache::notification::RemovalNotification;
//!
//! let map = CacheMapBuilder::<String, Vec<u8>>::new()
//!     .concurrency_level(8)
//!     .maximum_size(10_000)
//!     .expire_after_access(Duration::from_secs(300))
//!     .weak_values()
//!     .removal_listener(|n: RemovalNotification<String, Vec<u8>>| {
//!         let _ = n.cause();
//!     })
//!     .try_build();
//! assert!(map.is_ok());
//!
//! let twice = CacheMapBuilder::<String, u32>::new()
//!     .maximum_size(10)
//!     .maximum_size(20)
//!     .try_build();
//! assert!(twice.is_err());
//! ```
//!
//! [`try_build`]: CacheMapBuilder::try_build
//! [`build`]: CacheMapBuilder::build

use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxBuildHasher;

use crate::error::ConfigError;
use crate::map::segment::Expiry;
use crate::map::{CacheMap, MapSettings, Strength};
use crate::notification::RemovalListener;
use crate::time::{SystemTicker, Ticker, duration_to_nanos};

pub const DEFAULT_CONCURRENCY_LEVEL: usize = 4;
pub const DEFAULT_INITIAL_CAPACITY: usize = 16;

/// Builder for [`CacheMap`].
///
/// Unset options use their defaults: concurrency level
/// [`DEFAULT_CONCURRENCY_LEVEL`], initial capacity
/// [`DEFAULT_INITIAL_CAPACITY`], strong keys and values, no size bound, no
/// expiration, no listener, [`SystemTicker`] and [`FxBuildHasher`].
pub struct CacheMapBuilder<K, V, S = FxBuildHasher> {
    concurrency_level: Option<usize>,
    initial_capacity: Option<usize>,
    maximum_size: Option<usize>,
    key_strength: Option<Strength>,
    value_strength: Option<Strength>,
    expire_after_access: Option<Duration>,
    expire_after_write: Option<Duration>,
    listener: Option<Arc<dyn RemovalListener<K, V>>>,
    ticker: Option<Arc<dyn Ticker>>,
    hasher: S,
    /// First misconfiguration seen; reported by `try_build`.
    error: Option<ConfigError>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> CacheMapBuilder<K, V> {
    pub fn new() -> Self {
        Self::with_hasher(FxBuildHasher)
    }
}

impl<K, V> Default for CacheMapBuilder<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S> CacheMapBuilder<K, V, S> {
    /// Starts a builder that hashes keys with `hasher`.
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            concurrency_level: None,
            initial_capacity: None,
            maximum_size: None,
            key_strength: None,
            value_strength: None,
            expire_after_access: None,
            expire_after_write: None,
            listener: None,
            ticker: None,
            hasher,
            error: None,
            _marker: PhantomData,
        }
    }

    /// Replaces the hash builder, keeping every other option.
    pub fn hasher<S2>(self, hasher: S2) -> CacheMapBuilder<K, V, S2> {
        CacheMapBuilder {
            concurrency_level: self.concurrency_level,
            initial_capacity: self.initial_capacity,
            maximum_size: self.maximum_size,
            key_strength: self.key_strength,
            value_strength: self.value_strength,
            expire_after_access: self.expire_after_access,
            expire_after_write: self.expire_after_write,
            listener: self.listener,
            ticker: self.ticker,
            hasher,
            error: self.error,
            _marker: PhantomData,
        }
    }

    fn fail(&mut self, message: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(ConfigError::new(message));
        }
    }

    fn set_once<T>(&mut self, slot: fn(&mut Self) -> &mut Option<T>, name: &str, value: T) {
        if slot(self).is_some() {
            self.fail(format!("{} was already set", name));
            return;
        }
        *slot(self) = Some(value);
    }

    /// Expected number of concurrently writing threads. The map uses the
    /// next power of two of segments, limited by the maximum size.
    pub fn concurrency_level(mut self, level: usize) -> Self {
        if level == 0 {
            self.fail("concurrency level must be greater than zero");
        }
        self.set_once(|b| &mut b.concurrency_level, "concurrency level", level);
        self
    }

    /// Number of entries the map should hold without growing its tables.
    pub fn initial_capacity(mut self, capacity: usize) -> Self {
        self.set_once(|b| &mut b.initial_capacity, "initial capacity", capacity);
        self
    }

    /// Bounds the number of entries. Each segment evicts its least recently
    /// used entry before exceeding its share. Zero discards every insert.
    pub fn maximum_size(mut self, size: usize) -> Self {
        self.set_once(|b| &mut b.maximum_size, "maximum size", size);
        self
    }

    pub fn key_strength(mut self, strength: Strength) -> Self {
        self.set_once(|b| &mut b.key_strength, "key strength", strength);
        self
    }

    pub fn value_strength(mut self, strength: Strength) -> Self {
        self.set_once(|b| &mut b.value_strength, "value strength", strength);
        self
    }

    /// Holds keys weakly; an entry disappears once its key's last external
    /// `Arc` is dropped.
    pub fn weak_keys(self) -> Self {
        self.key_strength(Strength::Weak)
    }

    /// Holds values weakly.
    pub fn weak_values(self) -> Self {
        self.value_strength(Strength::Weak)
    }

    /// Expires entries `duration` after their last read or write.
    pub fn expire_after_access(mut self, duration: Duration) -> Self {
        if self.expire_after_write.is_some() {
            self.fail("expire_after_access cannot be combined with expire_after_write");
        }
        self.set_once(|b| &mut b.expire_after_access, "expire_after_access", duration);
        self
    }

    /// Expires entries `duration` after they were written.
    pub fn expire_after_write(mut self, duration: Duration) -> Self {
        if self.expire_after_access.is_some() {
            self.fail("expire_after_write cannot be combined with expire_after_access");
        }
        self.set_once(|b| &mut b.expire_after_write, "expire_after_write", duration);
        self
    }

    /// Receives one notification per removed entry, outside any lock.
    pub fn removal_listener(mut self, listener: impl RemovalListener<K, V> + 'static) -> Self {
        let listener: Arc<dyn RemovalListener<K, V>> = Arc::new(listener);
        self.set_once(|b| &mut b.listener, "removal listener", listener);
        self
    }

    /// Time source for expiration; defaults to [`SystemTicker`].
    pub fn ticker(mut self, ticker: Arc<dyn Ticker>) -> Self {
        self.set_once(|b| &mut b.ticker, "ticker", ticker);
        self
    }

    /// Builds the map.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid. For a non-panicking
    /// alternative, use [`try_build`](Self::try_build).
    pub fn build(self) -> CacheMap<K, V, S>
    where
        K: Hash + Eq,
        S: BuildHasher,
    {
        match self.try_build() {
            Ok(map) => map,
            Err(e) => panic!("{}", e),
        }
    }

    /// Builds the map, returning the first configuration error instead of
    /// panicking.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if an option was set twice, the concurrency
    /// level is zero, or both expiration modes were requested.
    pub fn try_build(self) -> Result<CacheMap<K, V, S>, ConfigError>
    where
        K: Hash + Eq,
        S: BuildHasher,
    {
        if let Some(error) = self.error {
            return Err(error);
        }
        let expiry = match (self.expire_after_access, self.expire_after_write) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::new(
                    "expire_after_access and expire_after_write are mutually exclusive",
                ));
            },
            (Some(access), None) => Some(Expiry::AfterAccess(duration_to_nanos(access))),
            (None, Some(write)) => Some(Expiry::AfterWrite(duration_to_nanos(write))),
            (None, None) => None,
        };
        Ok(CacheMap::from_settings(MapSettings {
            concurrency_level: self.concurrency_level.unwrap_or(DEFAULT_CONCURRENCY_LEVEL),
            initial_capacity: self.initial_capacity.unwrap_or(DEFAULT_INITIAL_CAPACITY),
            maximum_size: self.maximum_size,
            key_strength: self.key_strength.unwrap_or_default(),
            value_strength: self.value_strength.unwrap_or_default(),
            expiry,
            listener: self.listener,
            ticker: self
                .ticker
                .unwrap_or_else(|| Arc::new(SystemTicker::new())),
            hasher: self.hasher,
        }))
    }
}

impl<K, V, S> fmt::Debug for CacheMapBuilder<K, V, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheMapBuilder")
            .field("concurrency_level", &self.concurrency_level)
            .field("initial_capacity", &self.initial_capacity)
            .field("maximum_size", &self.maximum_size)
            .field("key_strength", &self.key_strength)
            .field("value_strength", &self.value_strength)
            .field("expire_after_access", &self.expire_after_access)
            .field("expire_after_write", &self.expire_after_write)
            .field("has_listener", &self.listener.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::hash::{BuildHasherDefault, DefaultHasher};

    use super::*;

    #[test]
    fn defaults_build() {
        let map = CacheMapBuilder::<u64, String>::new().build();
        assert_eq!(map.segment_count(), DEFAULT_CONCURRENCY_LEVEL);
        assert_eq!(map.maximum_size(), None);
        assert!(map.is_empty());
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = CacheMapBuilder::<u64, u64>::new()
            .concurrency_level(0)
            .try_build()
            .unwrap_err();
        assert!(err.message().contains("concurrency level"));
    }

    #[test]
    fn options_can_be_set_only_once() {
        let err = CacheMapBuilder::<u64, u64>::new()
            .weak_keys()
            .key_strength(Strength::Strong)
            .try_build()
            .unwrap_err();
        assert_eq!(err.to_string(), "key strength was already set");

        let err = CacheMapBuilder::<u64, u64>::new()
            .initial_capacity(1)
            .initial_capacity(2)
            .try_build()
            .unwrap_err();
        assert!(err.message().contains("initial capacity"));
    }

    #[test]
    fn expiration_modes_are_exclusive() {
        let result = CacheMapBuilder::<u64, u64>::new()
            .expire_after_write(Duration::from_secs(1))
            .expire_after_access(Duration::from_secs(1))
            .try_build();
        assert!(result.is_err());
    }

    #[test]
    #[should_panic(expected = "maximum size was already set")]
    fn build_panics_on_invalid_configuration() {
        let _ = CacheMapBuilder::<u64, u64>::new()
            .maximum_size(1)
            .maximum_size(2)
            .build();
    }

    #[test]
    fn custom_hasher_is_used() {
        let map = CacheMapBuilder::<String, u32>::new()
            .hasher(BuildHasherDefault::<DefaultHasher>::default())
            .build();
        map.insert("k".to_string(), 1);
        assert_eq!(map.get("k").as_deref(), Some(&1));
    }
}

//! segmented-cache: a concurrent, segmented key/value cache map.
//!
//! [`CacheMap`] shards keys over independently locked segments and can
//! bound its size (per-segment LRU eviction), expire entries after access
//! or after write, hold keys and values weakly, and report every removal to
//! a [`RemovalListener`](notification::RemovalListener).
//!
//! Configure a map with [`CacheMap::builder`]; see the [`map`] module for
//! the structure and [`notification`] for removal semantics.

pub mod builder;
pub mod ds;
pub mod error;
pub mod map;
pub mod notification;
pub mod prelude;
pub mod time;

pub use builder::CacheMapBuilder;
pub use map::{CacheMap, Strength};

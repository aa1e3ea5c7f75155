//! Strong and weak holders for keys and values.
//!
//! The map keeps keys as `Arc<K>` and values as `Arc<V>`. With
//! [`Strength::Weak`] it keeps only a `Weak` instead, so the entry lives
//! exactly as long as some caller still owns a strong `Arc`. Dropping the
//! last strong reference is what "reclaimed" means here; segments notice it
//! by sweeping and report the entry as [`RemovalCause::Collected`].
//!
//! [`RemovalCause::Collected`]: crate::notification::RemovalCause::Collected

use std::borrow::Borrow;
use std::sync::{Arc, Weak};

/// How the map holds a key or a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Strength {
    /// Held until removed.
    #[default]
    Strong,
    /// Held only while a caller keeps a strong `Arc` alive.
    Weak,
}

/// A key held with some [`Strength`].
pub(crate) enum KeyRef<K> {
    Strong(Arc<K>),
    Weak(Weak<K>),
}

impl<K> KeyRef<K> {
    pub(crate) fn new(key: Arc<K>, strength: Strength) -> Self {
        match strength {
            Strength::Strong => KeyRef::Strong(key),
            Strength::Weak => KeyRef::Weak(Arc::downgrade(&key)),
        }
    }

    /// Returns the key, or `None` if it was reclaimed.
    #[inline]
    pub(crate) fn get(&self) -> Option<Arc<K>> {
        match self {
            KeyRef::Strong(key) => Some(Arc::clone(key)),
            KeyRef::Weak(key) => key.upgrade(),
        }
    }

    #[inline]
    pub(crate) fn is_reclaimed(&self) -> bool {
        match self {
            KeyRef::Strong(_) => false,
            KeyRef::Weak(key) => key.strong_count() == 0,
        }
    }

    /// Compares against a borrowed lookup key.
    ///
    /// `None` means the key was reclaimed and matches nothing.
    #[inline]
    pub(crate) fn matches<Q>(&self, query: &Q) -> Option<bool>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        match self {
            KeyRef::Strong(key) => Some((**key).borrow() == query),
            KeyRef::Weak(key) => key.upgrade().map(|key| (*key).borrow() == query),
        }
    }
}

impl<K> Clone for KeyRef<K> {
    fn clone(&self) -> Self {
        match self {
            KeyRef::Strong(key) => KeyRef::Strong(Arc::clone(key)),
            KeyRef::Weak(key) => KeyRef::Weak(Weak::clone(key)),
        }
    }
}

/// A value held with some [`Strength`].
///
/// Reading never blocks. `Clone` is the copy operation: it yields a second
/// reference to the same value with the same strength, used when values
/// are snapshotted for iteration outside the segment lock.
pub(crate) enum ValueRef<V> {
    Strong(Arc<V>),
    Weak(Weak<V>),
}

impl<V> ValueRef<V> {
    pub(crate) fn new(value: Arc<V>, strength: Strength) -> Self {
        match strength {
            Strength::Strong => ValueRef::Strong(value),
            Strength::Weak => ValueRef::Weak(Arc::downgrade(&value)),
        }
    }

    /// Returns the value, or `None` if it was reclaimed.
    #[inline]
    pub(crate) fn get(&self) -> Option<Arc<V>> {
        match self {
            ValueRef::Strong(value) => Some(Arc::clone(value)),
            ValueRef::Weak(value) => value.upgrade(),
        }
    }

    #[inline]
    pub(crate) fn is_reclaimed(&self) -> bool {
        match self {
            ValueRef::Strong(_) => false,
            ValueRef::Weak(value) => value.strong_count() == 0,
        }
    }
}

impl<V> Clone for ValueRef<V> {
    fn clone(&self) -> Self {
        match self {
            ValueRef::Strong(value) => ValueRef::Strong(Arc::clone(value)),
            ValueRef::Weak(value) => ValueRef::Weak(Weak::clone(value)),
        }
    }
}

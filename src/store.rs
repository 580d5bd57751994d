//! Concurrent key-value store
//!
//! A thin generic wrapper over `DashMap` used as the substrate for every
//! cache in the crate: the service-record map, and the rotation-cursor map
//! inside the selector. All operations are atomic per key; no multi-key
//! transactions are provided because every record is independently keyed
//! and independently refreshed.

use dashmap::DashMap;

/// Thread-safe mapping from string keys to cloneable values
///
/// # Thread Safety
///
/// Reads and writes are lock-free per shard. `get` returns a clone so
/// callers never hold a reference into the map while other writers race.
///
/// # Example
///
/// ```
/// use svcreg::store::Store;
///
/// let store: Store<u32> = Store::new();
/// store.insert("a".to_string(), 1);
/// assert_eq!(store.get("a"), Some(1));
/// ```
#[derive(Debug)]
pub struct Store<V> {
    map: DashMap<String, V>,
}

impl<V: Clone> Store<V> {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: DashMap::new(),
        }
    }

    /// Get a clone of the value for `key`, if present
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    /// Insert or replace the value for `key`
    pub fn insert(&self, key: String, value: V) {
        self.map.insert(key, value);
    }

    /// Remove the value for `key`, returning it if present
    pub fn remove(&self, key: &str) -> Option<V> {
        self.map.remove(key).map(|(_, v)| v)
    }

    /// Check whether `key` is present
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Snapshot of all entries as owned pairs
    ///
    /// Used by the refresh loop to iterate without holding shard locks
    /// across fetches.
    #[must_use]
    pub fn entries(&self) -> Vec<(String, V)> {
        self.map
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }
}

impl<V: Clone> Default for Store<V> {
    fn default() -> Self {
        Self::new()
    }
}

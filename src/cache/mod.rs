// SPDX-License-Identifier: MPL-2.0
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Keyed store with cumulative change tracking.
//!
//! [`DiffCache`] remembers which keys were upserted or deleted since the
//! last [`flush_diffs`](DiffCache::flush_diffs), so that callers can forward
//! only what changed instead of the whole fleet state.
//!
//! # Examples
//!
//! ```
//! use octofleet_lib::cache::DiffCache;
//!
//! let mut cache = DiffCache::new();
//! cache.set_value("p1", 10);
//! cache.set_value("p2", 20);
//! cache.delete_value(&"p2");
//!
//! let diffs = cache.flush_diffs();
//! assert_eq!(diffs.updated, vec![("p1", 10)]);
//! assert_eq!(diffs.deleted, vec!["p2"]);
//!
//! // Draining is destructive
//! assert!(cache.flush_diffs().is_empty());
//! ```

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Changes accumulated since the previous flush.
#[derive(Debug, Clone, PartialEq)]
pub struct Diffs<K, V> {
    /// Keys upserted since the last flush, with their current values.
    pub updated: Vec<(K, V)>,
    /// Keys deleted since the last flush.
    pub deleted: Vec<K>,
}

impl<K, V> Diffs<K, V> {
    /// Returns true if nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.deleted.is_empty()
    }
}

/// Associative store that tracks updated and deleted keys.
///
/// A key is never in both tracking sets: marking it in one removes it
/// from the other. The cache does no locking of its own; the embedding
/// component serializes writes.
#[derive(Debug, Clone)]
pub struct DiffCache<K, V> {
    values: HashMap<K, V>,
    updated: HashSet<K>,
    deleted: HashSet<K>,
}

impl<K, V> DiffCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: HashMap::new(),
            updated: HashSet::new(),
            deleted: HashSet::new(),
        }
    }

    /// Upserts a value and marks the key updated.
    pub fn set_value(&mut self, key: K, value: V) {
        self.deleted.remove(&key);
        self.updated.insert(key.clone());
        self.values.insert(key, value);
    }

    /// Removes a value and marks the key deleted.
    ///
    /// Returns the removed value, if any. The key is marked deleted either
    /// way so that consumers drop anything they still hold for it.
    pub fn delete_value(&mut self, key: &K) -> Option<V> {
        self.updated.remove(key);
        self.deleted.insert(key.clone());
        self.values.remove(key)
    }

    /// Returns the value stored under `key`.
    #[must_use]
    pub fn get_value(&self, key: &K) -> Option<&V> {
        self.values.get(key)
    }

    /// Returns clones of all stored values.
    #[must_use]
    pub fn get_all_values(&self) -> Vec<V> {
        self.values.values().cloned().collect()
    }

    /// Returns all stored keys.
    #[must_use]
    pub fn keys(&self) -> Vec<K> {
        self.values.keys().cloned().collect()
    }

    /// Returns the number of stored values.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Returns true if a flush would report anything.
    #[must_use]
    pub fn has_pending_diffs(&self) -> bool {
        !self.updated.is_empty() || !self.deleted.is_empty()
    }

    /// Returns the accumulated diffs and clears both tracking sets.
    ///
    /// This is a read-once drain; a second flush right after returns
    /// nothing.
    pub fn flush_diffs(&mut self) -> Diffs<K, V> {
        let updated = self
            .updated
            .drain()
            .filter_map(|key| self.values.get(&key).cloned().map(|value| (key, value)))
            .collect();
        let deleted = self.deleted.drain().collect();

        Diffs { updated, deleted }
    }
}

impl<K, V> Default for DiffCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

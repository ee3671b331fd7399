//! Local value store port, and an in-memory LRU implementation of it.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::common::{unix_now, Id, StoredValue};

/// Default maximum number of keys held by a [MemoryDatabase].
pub const MAX_KEYS: usize = 1000;
/// Default maximum number of values (one per originator) held under a single key.
pub const MAX_VALUES_PER_KEY: usize = 32;

/// Values held by the local node, keyed by [Id] then by originator.
pub trait Database: Send + Debug {
    /// Up to `max_values` (all if 0) unexpired values stored under `key`.
    fn get(&mut self, key: &Id, max_values: usize) -> Vec<StoredValue>;

    /// The value the local node published under `key`, if any.
    fn local(&mut self, key: &Id) -> Option<StoredValue>;

    /// Store a value, replacing any previous value from the same originator.
    ///
    /// Returns `false` if the value was refused.
    fn store(&mut self, key: Id, value: StoredValue) -> bool;

    /// Remove the value stored under `key` by `originator`.
    fn remove(&mut self, key: &Id, originator: &Id) -> Option<StoredValue>;

    /// Keys with at least one unexpired value.
    fn keys(&mut self) -> Vec<Id>;
}

#[derive(Debug)]
/// [Database] kept in memory, evicting the least recently used keys when full.
///
/// Values stored on behalf of other nodes expire after their `life_hours`,
/// values published by the local node live outside the LRU until removed.
pub struct MemoryDatabase {
    /// Values published by the local node, never evicted.
    originals: HashMap<Id, StoredValue>,
    /// Values stored on behalf of other nodes, by key then originator.
    values: LruCache<Id, BTreeMap<Id, StoredValue>>,
    max_values_per_key: usize,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new(MAX_KEYS, MAX_VALUES_PER_KEY)
    }
}

impl MemoryDatabase {
    pub fn new(max_keys: usize, max_values_per_key: usize) -> Self {
        Self {
            originals: HashMap::new(),
            values: LruCache::new(NonZeroUsize::new(max_keys).unwrap_or(NonZeroUsize::MIN)),
            max_values_per_key: max_values_per_key.max(1),
        }
    }

    /// Drop expired values under `key`, and the key itself once empty.
    fn purge(&mut self, key: &Id, now: u64) {
        let empty = match self.values.peek_mut(key) {
            Some(values) => {
                values.retain(|_, value| !value.is_expired_at(now));
                values.is_empty()
            }
            None => false,
        };

        if empty {
            self.values.pop(key);
        }
    }
}

impl Database for MemoryDatabase {
    fn get(&mut self, key: &Id, max_values: usize) -> Vec<StoredValue> {
        self.purge(key, unix_now());

        let limit = if max_values == 0 {
            usize::MAX
        } else {
            max_values
        };

        let cached = self.values.get(key).into_iter().flat_map(|values| values.values());

        self.originals
            .get(key)
            .into_iter()
            .chain(cached)
            .take(limit)
            .cloned()
            .collect()
    }

    fn local(&mut self, key: &Id) -> Option<StoredValue> {
        self.originals.get(key).cloned()
    }

    fn store(&mut self, key: Id, value: StoredValue) -> bool {
        let originator = value.value.originator;

        if value.original {
            if let Some(values) = self.values.peek_mut(&key) {
                values.remove(&originator);
            }
            self.originals.insert(key, value);

            return true;
        }

        // A cached copy never overwrites the local original.
        if self
            .originals
            .get(&key)
            .is_some_and(|original| original.value.originator == originator)
        {
            return false;
        }

        let max_values_per_key = self.max_values_per_key;
        let values = self.values.get_or_insert_mut(key, BTreeMap::new);

        if !values.contains_key(&originator) && values.len() >= max_values_per_key {
            return false;
        }

        values.insert(originator, value);

        true
    }

    fn remove(&mut self, key: &Id, originator: &Id) -> Option<StoredValue> {
        if self
            .originals
            .get(key)
            .is_some_and(|original| &original.value.originator == originator)
        {
            return self.originals.remove(key);
        }

        let values = self.values.peek_mut(key)?;
        let removed = values.remove(originator);

        if values.is_empty() {
            self.values.pop(key);
        }

        removed
    }

    fn keys(&mut self) -> Vec<Id> {
        let now = unix_now();
        let cached: Vec<Id> = self.values.iter().map(|(key, _)| *key).collect();

        for key in &cached {
            self.purge(key, now);
        }

        let mut keys: Vec<Id> = self.originals.keys().copied().collect();
        keys.extend(
            cached
                .into_iter()
                .filter(|key| self.values.contains(key) && !self.originals.contains_key(key)),
        );

        keys
    }
}

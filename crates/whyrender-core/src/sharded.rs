//! Sharded concurrent hash map shared by every tracker store.
//!
//! Each shard is a `RwLock<HashMap<K, V>>` padded to 128 bytes, and the key
//! hash picks the shard. Renders of unrelated components therefore contend
//! only when their keys land in the same shard, and the background
//! maintenance pass locks one shard at a time instead of the whole map.

use std::collections::HashMap;
use std::collections::hash_map::{DefaultHasher, Entry};
use std::hash::{Hash, Hasher};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Default number of shards. Power of 2 for fast modulo.
const DEFAULT_SHARDS: usize = 32;

/// Upper bound on the shard count.
const MAX_SHARDS: usize = 256;

#[inline]
fn shard_for<K: Hash>(key: &K, shard_count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % shard_count
}

/// 128-byte alignment keeps two shards' locks off the same cache line.
#[repr(align(128))]
struct Shard<K, V> {
    map: RwLock<HashMap<K, V>>,
}

impl<K, V> Shard<K, V> {
    fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<K, V>> {
        self.map.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<K, V>> {
        self.map.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A sharded concurrent hash map.
///
/// Thread-safe without external locking. Operations on keys in different
/// shards never touch the same lock. Closures passed to the `*_with`
/// methods run under the shard lock and must not call back into the map.
pub struct ShardedMap<K, V> {
    shards: Box<[Shard<K, V>]>,
}

impl<K, V> std::fmt::Debug for ShardedMap<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sizes: Vec<usize> = self.shards.iter().map(|s| s.read().len()).collect();
        f.debug_struct("ShardedMap")
            .field("shard_count", &self.shards.len())
            .field("entries", &sizes.iter().sum::<usize>())
            .finish()
    }
}

impl<K, V> ShardedMap<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Create a map with the default shard count.
    #[must_use]
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    /// Create with a specific shard count, clamped to `[1, 256]`.
    #[must_use]
    pub fn with_shards(n: usize) -> Self {
        let n = n.clamp(1, MAX_SHARDS);
        let shards: Vec<Shard<K, V>> = (0..n).map(|_| Shard::new()).collect();
        Self {
            shards: shards.into_boxed_slice(),
        }
    }

    /// Number of shards.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    #[inline]
    fn shard(&self, key: &K) -> &Shard<K, V> {
        &self.shards[shard_for(key, self.shards.len())]
    }

    /// Insert or update a key-value pair. Returns the old value if any.
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard(&key).write().insert(key, value)
    }

    /// Get a clone of the value for a key.
    pub fn get(&self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        self.shard(key).read().get(key).cloned()
    }

    /// Check if the map contains a key.
    pub fn contains_key(&self, key: &K) -> bool {
        self.shard(key).read().contains_key(key)
    }

    /// Remove a key and return its value.
    pub fn remove(&self, key: &K) -> Option<V> {
        self.shard(key).write().remove(key)
    }

    /// Remove a key only if `pred` holds for its current value.
    pub fn remove_if<F>(&self, key: &K, pred: F) -> Option<V>
    where
        F: FnOnce(&V) -> bool,
    {
        let mut guard = self.shard(key).write();
        if guard.get(key).is_some_and(pred) {
            guard.remove(key)
        } else {
            None
        }
    }

    /// Apply a function to a value under a read lock.
    pub fn read_with<F, R>(&self, key: &K, f: F) -> Option<R>
    where
        F: FnOnce(&V) -> R,
    {
        self.shard(key).read().get(key).map(f)
    }

    /// Apply a mutating function to a value under a write lock.
    pub fn write_with<F, R>(&self, key: &K, f: F) -> Option<R>
    where
        F: FnOnce(&mut V) -> R,
    {
        self.shard(key).write().get_mut(key).map(f)
    }

    /// Run `f` against the entry for `key`, inserting `init()` first when
    /// the key is absent. The whole operation holds the shard's write lock.
    pub fn upsert_with<I, F, R>(&self, key: K, init: I, f: F) -> R
    where
        I: FnOnce() -> V,
        F: FnOnce(&mut V) -> R,
    {
        let mut guard = self.shard(&key).write();
        f(guard.entry(key).or_insert_with(init))
    }

    /// Run `f` against the raw map entry for `key` under the shard's write
    /// lock, for callers that need to move a value into either branch.
    pub fn entry_with<F, R>(&self, key: K, f: F) -> R
    where
        F: FnOnce(Entry<'_, K, V>) -> R,
    {
        let mut guard = self.shard(&key).write();
        f(guard.entry(key))
    }

    /// Return a clone of the value for `key`, inserting `init()` when absent.
    ///
    /// The boolean is `true` when this call inserted the value.
    pub fn get_or_insert_with<F>(&self, key: K, init: F) -> (V, bool)
    where
        V: Clone,
        F: FnOnce() -> V,
    {
        let mut guard = self.shard(&key).write();
        if let Some(existing) = guard.get(&key) {
            return (existing.clone(), false);
        }
        let value = init();
        guard.insert(key, value.clone());
        (value, true)
    }

    /// Total number of entries across all shards.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    /// Map every entry to a value under each shard's read lock in turn.
    pub fn collect_with<F, R>(&self, mut f: F) -> Vec<R>
    where
        F: FnMut(&K, &V) -> R,
    {
        let mut result = Vec::new();
        for shard in self.shards.iter() {
            let guard = shard.read();
            result.extend(guard.iter().map(|(k, v)| f(k, v)));
        }
        result
    }

    /// Retain only entries satisfying a predicate. Returns the removed
    /// entries so callers can release resources they hold.
    pub fn drain_where<F>(&self, mut pred: F) -> Vec<(K, V)>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut removed = Vec::new();
        for shard in self.shards.iter() {
            let mut guard = shard.write();
            let doomed: Vec<K> = guard
                .iter()
                .filter(|(k, v)| pred(k, v))
                .map(|(k, _)| k.clone())
                .collect();
            for key in doomed {
                if let Some(value) = guard.remove(&key) {
                    removed.push((key, value));
                }
            }
        }
        removed
    }

    /// Retain only entries satisfying a predicate.
    pub fn retain<F>(&self, mut f: F)
    where
        F: FnMut(&K, &V) -> bool,
    {
        for shard in self.shards.iter() {
            shard.write().retain(|k, v| f(k, v));
        }
    }

    /// Clear all entries, returning how many were removed.
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut guard = shard.write();
            removed += guard.len();
            guard.clear();
        }
        removed
    }
}

impl<K: Hash + Eq + Clone, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

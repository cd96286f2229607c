//! Object pool for snapshot field maps.
//!
//! Every snapshot borrows its field map from an [`ObjectPool`] and hands it
//! back when the snapshot is replaced or evicted. Values are reset on
//! return, never on checkout, so an idle value may hold stale contents
//! only while it sits in the pool. Each checkout carries a lease id; a
//! return whose lease is not outstanding is rejected and counted instead
//! of putting a second copy into the idle list.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tracing::warn;

use crate::counter::ShardedCounter;
use crate::error::PoolError;
use crate::value::FieldValue;

/// Values that can be cleared for reuse.
pub trait Reset {
    fn reset(&mut self);
}

impl<K, V, S: BuildHasher> Reset for HashMap<K, V, S>
where
    K: Eq + Hash,
{
    fn reset(&mut self) {
        self.clear();
    }
}

impl<T> Reset for Vec<T> {
    fn reset(&mut self) {
        self.clear();
    }
}

/// Field name to value mapping held by a snapshot.
pub type FieldMap = HashMap<&'static str, FieldValue>;

/// A field map borrowed from the snapshot pool.
pub type PooledDictionary = Pooled<FieldMap>;

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatistics {
    pub idle: usize,
    pub outstanding: usize,
    pub created: u64,
    pub reused: u64,
    pub returned: u64,
    pub discarded: u64,
    pub rejected_returns: u64,
}

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

struct PoolInner<T> {
    idle: Mutex<Vec<T>>,
    outstanding: Mutex<HashSet<u64>>,
    next_lease: AtomicU64,
    max_idle: usize,
    factory: Factory<T>,
    created: ShardedCounter,
    reused: ShardedCounter,
    returned: ShardedCounter,
    discarded: ShardedCounter,
    rejected: ShardedCounter,
}

impl<T: Reset> PoolInner<T> {
    fn release(&self, lease: u64, mut value: T) -> Result<(), PoolError> {
        let was_outstanding = self
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&lease);
        if !was_outstanding {
            self.rejected.increment();
            warn!(lease, "rejected return of a lease that is not outstanding");
            return Err(PoolError::UnknownLease(lease));
        }

        value.reset();
        self.returned.increment();
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < self.max_idle {
            idle.push(value);
        } else {
            self.discarded.increment();
        }
        Ok(())
    }
}

/// Thread-safe pool of reusable values.
pub struct ObjectPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for ObjectPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("max_idle", &self.inner.max_idle)
            .finish()
    }
}

impl<T: Reset> ObjectPool<T> {
    /// Pool that keeps at most `max_idle` idle values and fabricates new
    /// ones with `factory` when empty.
    pub fn new<F>(max_idle: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::new()),
                outstanding: Mutex::new(HashSet::new()),
                next_lease: AtomicU64::new(1),
                max_idle,
                factory: Box::new(factory),
                created: ShardedCounter::new(),
                reused: ShardedCounter::new(),
                returned: ShardedCounter::new(),
                discarded: ShardedCounter::new(),
                rejected: ShardedCounter::new(),
            }),
        }
    }

    /// Borrow a value; it returns to the pool when the guard drops.
    pub fn acquire(&self) -> Pooled<T> {
        let reused = self
            .inner
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let value = match reused {
            Some(value) => {
                self.inner.reused.increment();
                value
            }
            None => {
                self.inner.created.increment();
                (self.inner.factory)()
            }
        };
        let lease = self.inner.next_lease.fetch_add(1, Ordering::Relaxed);
        self.inner
            .outstanding
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(lease);
        Pooled {
            value: Some(value),
            lease,
            pool: Arc::clone(&self.inner),
        }
    }

    #[must_use]
    pub fn statistics(&self) -> PoolStatistics {
        let inner = &self.inner;
        PoolStatistics {
            idle: inner.idle.lock().unwrap_or_else(PoisonError::into_inner).len(),
            outstanding: inner
                .outstanding
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
            created: inner.created.get(),
            reused: inner.reused.get(),
            returned: inner.returned.get(),
            discarded: inner.discarded.get(),
            rejected_returns: inner.rejected.get(),
        }
    }
}

impl<K, V> ObjectPool<HashMap<K, V>>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Pool of empty hash maps pre-sized to `capacity`.
    #[must_use]
    pub fn of_maps(max_idle: usize, capacity: usize) -> Self {
        Self::new(max_idle, move || HashMap::with_capacity(capacity))
    }
}

/// A value checked out of an [`ObjectPool`].
pub struct Pooled<T: Reset> {
    value: Option<T>,
    lease: u64,
    pool: Arc<PoolInner<T>>,
}

impl<T: Reset> Pooled<T> {
    #[must_use]
    pub fn lease(&self) -> u64 {
        self.lease
    }

    /// Borrow another value from the same pool.
    #[must_use]
    pub fn sibling(&self) -> Self {
        ObjectPool {
            inner: Arc::clone(&self.pool),
        }
        .acquire()
    }
}

impl<T: Reset> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Only `Drop` takes the value out.
        self.value.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Reset> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl<T: Reset + fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("lease", &self.lease)
            .field("value", &self.value)
            .finish()
    }
}

impl<T: Reset> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            let _ = self.pool.release(self.lease, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max_idle: usize) -> ObjectPool<FieldMap> {
        ObjectPool::of_maps(max_idle, 4)
    }

    #[test]
    fn returned_values_are_cleared_before_reuse() {
        let pool = pool(4);
        {
            let mut map = pool.acquire();
            map.insert("count", FieldValue::from(1));
            map.insert("title", FieldValue::from("A"));
        }
        let map = pool.acquire();
        assert!(map.is_empty(), "stale fields must not leak into a reused map");
        let stats = pool.statistics();
        assert_eq!((stats.created, stats.reused, stats.returned), (1, 1, 1));
    }

    #[test]
    fn concurrent_borrowers_get_distinct_values() {
        let pool = pool(4);
        let mut a = pool.acquire();
        let b = pool.acquire();
        assert_ne!(a.lease(), b.lease());
        a.insert("only_a", FieldValue::Null);
        assert!(!b.contains_key("only_a"));
        assert_eq!(pool.statistics().outstanding, 2);
    }

    #[test]
    fn double_return_is_rejected() {
        let pool = pool(4);
        let lease = pool.acquire().lease();
        let err = pool.inner.release(lease, FieldMap::new()).unwrap_err();
        assert_eq!(err, PoolError::UnknownLease(lease));
        let stats = pool.statistics();
        assert_eq!(stats.rejected_returns, 1);
        assert_eq!(stats.idle, 1, "rejected value is not added to the idle list");
    }

    #[test]
    fn idle_list_is_bounded() {
        let pool = pool(1);
        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);
        let stats = pool.statistics();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.discarded, 1);
    }

    #[test]
    fn sibling_borrows_from_same_pool() {
        let pool = pool(4);
        let a = pool.acquire();
        let b = a.sibling();
        assert_eq!(pool.statistics().outstanding, 2);
        drop((a, b));
        assert_eq!(pool.statistics().idle, 2);
    }

    #[test]
    fn concurrent_acquire_release() {
        let pool = pool(8);
        let threads: Vec<_> = (0..8)
            .map(|i| {
                let pool = pool.clone();
                std::thread::spawn(move || {
                    for j in 0..500 {
                        let mut map = pool.acquire();
                        assert!(map.is_empty());
                        map.insert("n", FieldValue::from(i * 1_000 + j));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let stats = pool.statistics();
        assert_eq!(stats.outstanding, 0);
        assert_eq!(stats.returned, 4_000);
        assert_eq!(stats.rejected_returns, 0);
    }
}

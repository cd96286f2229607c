//! Sharded atomic counters for hot-path statistics.
//!
//! Every tracked render bumps several counters (cache hits, snapshot
//! stores, frequency samples). A single `AtomicU64` per counter would
//! bounce its cache line between every rendering thread, so writes go to a
//! per-thread padded slot and reads sum the slots.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Maximum number of slots per counter.
const MAX_SLOTS: usize = 32;

fn default_slot_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().clamp(1, MAX_SLOTS))
        .unwrap_or(4)
}

/// Stable per-thread slot seed, assigned round-robin on first use.
#[inline]
fn thread_slot(slots: usize) -> usize {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    thread_local! {
        static SEED: usize = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    SEED.with(|seed| *seed % slots)
}

#[repr(align(128))]
#[derive(Debug)]
struct Slot(AtomicU64);

/// A monotonically increasing counter, reset only explicitly.
#[derive(Debug)]
pub struct ShardedCounter {
    slots: Box<[Slot]>,
}

impl ShardedCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::with_slots(default_slot_count())
    }

    /// Create a counter with a specific slot count, clamped to `[1, 32]`.
    #[must_use]
    pub fn with_slots(n: usize) -> Self {
        let n = n.clamp(1, MAX_SLOTS);
        let slots: Vec<Slot> = (0..n).map(|_| Slot(AtomicU64::new(0))).collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn increment(&self) {
        self.add(1);
    }

    #[inline]
    pub fn add(&self, value: u64) {
        let idx = thread_slot(self.slots.len());
        self.slots[idx].0.fetch_add(value, Ordering::Relaxed);
    }

    /// Aggregate value across all slots.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.slots.iter().map(|s| s.0.load(Ordering::Relaxed)).sum()
    }

    pub fn reset(&self) {
        for slot in self.slots.iter() {
            slot.0.store(0, Ordering::Relaxed);
        }
    }
}

impl Default for ShardedCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn add_and_reset() {
        let counter = ShardedCounter::with_slots(4);
        counter.increment();
        counter.add(41);
        assert_eq!(counter.get(), 42);
        counter.reset();
        assert_eq!(counter.get(), 0);
    }

    #[test]
    fn slot_count_is_clamped() {
        assert_eq!(ShardedCounter::with_slots(0).slots.len(), 1);
        assert_eq!(ShardedCounter::with_slots(1_000).slots.len(), MAX_SLOTS);
    }

    #[test]
    fn concurrent_increments_sum_exactly() {
        let counter = Arc::new(ShardedCounter::with_slots(8));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        counter.increment();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(counter.get(), 80_000);
    }
}

//! CLOCK eviction ring
//!
//! Approximates LRU over a fixed number of slots without a global lock.
//!
//! # Design
//!
//! - Each slot holds a row id (`-1` when empty) and a stale bit
//! - `insert` claims a recycled slot first, otherwise advances `insert_hand`
//!   through the ring once (first fill only)
//! - `reference` clears the stale bit; lock-free
//! - `find_one_to_evict` sweeps `evict_hand`: recent slots become stale and
//!   are skipped, stale slots are try-locked and, if occupied, returned as an
//!   `EvictionCandidate` that keeps the slot lock
//!
//! # Slot state machine
//!
//! `EMPTY -> OCCUPIED(recent) -> OCCUPIED(stale) -> EMPTY`
//!
//! The slot lock pool has exactly one stripe per slot, independent of any
//! row-keyed pool, so "hold a slot, then lock a row" never waits on a thread
//! that holds a row and waits for the same slot.

use crate::striped_lock::{IdentityBuildHasher, StripeGuard, StripedLock};
use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use thiserror::Error;

/// Full sweeps `find_one_to_evict` makes before giving up
pub const MAX_NUM_ROUNDS: usize = 3;

const EMPTY_SLOT: i32 = -1;

/// Capacity-accounting failures reported to the owner of the ring
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClockLruError {
    /// More rows inserted than there are slots
    #[error("clock ring over capacity ({capacity} slots)")]
    CapacityExceeded {
        /// Number of slots in the ring
        capacity: usize,
    },

    /// Every sweep found only recent, locked or empty slots
    #[error("no eviction candidate after {rounds} sweeps over {capacity} slots")]
    NoCandidate {
        /// Sweeps performed
        rounds: usize,
        /// Number of slots in the ring
        capacity: usize,
    },
}

/// CLOCK ring over `capacity` slots
pub struct ClockLru {
    capacity: usize,
    stale: Box<[AtomicBool]>,
    row_ids: Box<[AtomicI32]>,
    evict_hand: AtomicUsize,
    insert_hand: AtomicUsize,
    free_slots: SegQueue<usize>,
    locks: StripedLock<usize, IdentityBuildHasher>,
}

impl ClockLru {
    /// Empty ring with `capacity` slots
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            stale: (0..capacity).map(|_| AtomicBool::new(false)).collect(),
            row_ids: (0..capacity).map(|_| AtomicI32::new(EMPTY_SLOT)).collect(),
            evict_hand: AtomicUsize::new(0),
            insert_hand: AtomicUsize::new(0),
            free_slots: SegQueue::new(),
            locks: StripedLock::with_hasher(capacity, IdentityBuildHasher::default()),
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claim a free slot for `row_id`, marked recent
    pub fn insert(&self, row_id: i32) -> Result<usize, ClockLruError> {
        let slot = match self.free_slots.pop() {
            Some(slot) => slot,
            None => {
                let slot = self.insert_hand.fetch_add(1, Ordering::AcqRel);
                if slot >= self.capacity {
                    return Err(ClockLruError::CapacityExceeded {
                        capacity: self.capacity,
                    });
                }
                slot
            }
        };

        let _guard = self.locks.lock(&slot);
        debug_assert_eq!(self.row_ids[slot].load(Ordering::Acquire), EMPTY_SLOT);
        self.stale[slot].store(false, Ordering::Release);
        self.row_ids[slot].store(row_id, Ordering::Release);
        Ok(slot)
    }

    /// Mark `slot` recently used
    #[inline]
    pub fn reference(&self, slot: usize) {
        self.stale[slot].store(false, Ordering::Release);
    }

    /// Whether `slot` currently holds `row_id`
    pub fn has_row(&self, row_id: i32, slot: usize) -> bool {
        slot < self.capacity && self.row_ids[slot].load(Ordering::Acquire) == row_id
    }

    /// Sweep for a stale, occupied slot and return it locked
    ///
    /// The candidate must be ended with `evict` or `keep_and_release`;
    /// dropping it behaves like `keep_and_release`.
    pub fn find_one_to_evict(&self) -> Result<EvictionCandidate<'_>, ClockLruError> {
        let max_steps = MAX_NUM_ROUNDS * self.capacity;
        for _ in 0..max_steps {
            let slot = self.evict_hand.fetch_add(1, Ordering::AcqRel) % self.capacity;

            // Recent slots get a second chance.
            if !self.stale[slot].swap(true, Ordering::AcqRel) {
                continue;
            }

            let guard = match self.locks.try_lock(&slot) {
                Some(guard) => guard,
                None => continue,
            };

            let row_id = self.row_ids[slot].load(Ordering::Acquire);
            if row_id == EMPTY_SLOT {
                continue;
            }

            return Ok(EvictionCandidate {
                lru: self,
                slot,
                row_id,
                _guard: guard,
            });
        }
        Err(ClockLruError::NoCandidate {
            rounds: MAX_NUM_ROUNDS,
            capacity: self.capacity,
        })
    }
}

impl std::fmt::Debug for ClockLru {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClockLru")
            .field("capacity", &self.capacity)
            .field("insert_hand", &self.insert_hand.load(Ordering::Relaxed))
            .field("free_slots", &self.free_slots.len())
            .finish()
    }
}

/// A locked slot chosen for eviction
///
/// Holds the slot lock for its whole lifetime. The owner re-checks whatever
/// it needs (e.g. the row's reference count) and then ends the candidate with
/// exactly one of the consuming methods.
#[must_use = "an eviction candidate holds its slot lock until evicted or released"]
pub struct EvictionCandidate<'a> {
    lru: &'a ClockLru,
    slot: usize,
    row_id: i32,
    _guard: StripeGuard<'a>,
}

impl<'a> EvictionCandidate<'a> {
    /// Row occupying the slot
    pub fn row_id(&self) -> i32 {
        self.row_id
    }

    /// Slot index
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Empty the slot, recycle it, and release the lock
    pub fn evict(self) {
        self.lru.row_ids[self.slot].store(EMPTY_SLOT, Ordering::Release);
        self.lru.free_slots.push(self.slot);
    }

    /// Leave the slot occupied and release the lock
    pub fn keep_and_release(self) {}
}

impl std::fmt::Debug for EvictionCandidate<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvictionCandidate")
            .field("slot", &self.slot)
            .field("row_id", &self.row_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_fill_then_overflow() {
        let lru = ClockLru::new(10);
        for i in 0..10 {
            assert_eq!(lru.insert(i).unwrap(), i as usize);
        }
        assert_eq!(
            lru.insert(10),
            Err(ClockLruError::CapacityExceeded { capacity: 10 })
        );
    }

    #[test]
    fn test_evict_recycles_slot() {
        let lru = ClockLru::new(10);
        for i in 0..10 {
            lru.insert(i).unwrap();
        }
        let candidate = lru.find_one_to_evict().unwrap();
        let (slot, row) = (candidate.slot(), candidate.row_id());
        assert!((0..10).contains(&row));
        candidate.evict();
        assert!(!lru.has_row(row, slot));
        assert_eq!(lru.insert(100).unwrap(), slot);
        assert!(lru.has_row(100, slot));
    }

    #[test]
    fn test_referenced_slot_gets_second_chance() {
        let lru = ClockLru::new(4);
        for i in 0..4 {
            lru.insert(i).unwrap();
        }
        // First sweep flips every slot to stale, then returns slot 0.
        let first = lru.find_one_to_evict().unwrap();
        assert_eq!(first.row_id(), 0);
        first.keep_and_release();

        lru.reference(0);
        let second = lru.find_one_to_evict().unwrap();
        assert_eq!(second.row_id(), 1);
    }

    #[test]
    fn test_candidate_holds_slot_lock() {
        let lru = ClockLru::new(2);
        lru.insert(0).unwrap();
        lru.insert(1).unwrap();
        let held = lru.find_one_to_evict().unwrap();
        let other = lru.find_one_to_evict().unwrap();
        assert_ne!(held.slot(), other.slot());
    }

    #[test]
    fn test_no_candidate_when_all_locked() {
        let lru = ClockLru::new(1);
        lru.insert(7).unwrap();
        let _held = lru.find_one_to_evict().unwrap();
        assert_eq!(
            lru.find_one_to_evict().unwrap_err(),
            ClockLruError::NoCandidate {
                rounds: MAX_NUM_ROUNDS,
                capacity: 1
            }
        );
    }

    #[test]
    fn test_evict_even_keep_odd() {
        let capacity = 10;
        let lru = ClockLru::new(capacity);
        let mut slots = HashMap::new();
        for i in 0..capacity as i32 {
            slots.insert(i, lru.insert(i).unwrap());
        }
        for i in 0..capacity {
            let candidate = lru.find_one_to_evict().unwrap();
            assert!(slots.contains_key(&candidate.row_id()));
            if i % 2 == 0 {
                slots.remove(&candidate.row_id());
                candidate.evict();
            } else {
                candidate.keep_and_release();
            }
        }
        for row in [1, 3] {
            if let Some(slot) = slots.get(&row) {
                lru.reference(*slot);
            }
        }
        let candidate = lru.find_one_to_evict().unwrap();
        assert!(candidate.row_id() >= (capacity / 2) as i32);
        candidate.evict();
    }

    #[test]
    fn test_frequent_working_set_survives() {
        const CAPACITY: usize = 10_000;
        const THREADS: u64 = 4;
        const ITERS: usize = 1_000;
        const EVICTION_RATE: f64 = 0.9;
        const NUM_TO_REFERENCE: usize = 4;

        let lru = Arc::new(ClockLru::new(CAPACITY));
        let slots = Arc::new(Mutex::new(HashMap::new()));
        for i in 0..CAPACITY as i32 {
            slots.lock().insert(i, lru.insert(i).unwrap());
        }
        let frequent: Arc<Vec<i32>> = Arc::new((1000..1100).collect());
        let next_row = Arc::new(AtomicI32::new(CAPACITY as i32));

        let handles: Vec<_> = (0..THREADS)
            .map(|seed| {
                let lru = Arc::clone(&lru);
                let slots = Arc::clone(&slots);
                let frequent = Arc::clone(&frequent);
                let next_row = Arc::clone(&next_row);
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(seed);
                    for _ in 0..ITERS {
                        let candidate = lru.find_one_to_evict().unwrap();
                        if rng.gen::<f64>() < EVICTION_RATE {
                            slots.lock().remove(&candidate.row_id());
                            candidate.evict();
                            let row = next_row.fetch_add(1, Ordering::Relaxed);
                            let slot = lru.insert(row).unwrap();
                            slots.lock().insert(row, slot);
                        } else {
                            candidate.keep_and_release();
                            let begin = rng.gen_range(0..frequent.len());
                            for j in begin..begin + NUM_TO_REFERENCE {
                                let row = frequent[j % frequent.len()];
                                if let Some(slot) = slots.lock().get(&row).copied() {
                                    lru.reference(slot);
                                }
                            }
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let slots = slots.lock();
        let alive = frequent
            .iter()
            .filter(|row| slots.get(row).map_or(false, |s| lru.has_row(**row, *s)))
            .count();
        assert!(alive as f64 / frequent.len() as f64 >= 0.8, "alive = {alive}");
    }
}

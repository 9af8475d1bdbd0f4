//! Striped lock pool
//!
//! A fixed array of mutexes shared by an unbounded key space. A key maps to
//! stripe `hash(key) % len`; two keys on the same stripe serialize, keys on
//! different stripes never contend.
//!
//! # Design
//!
//! - Guards are RAII: the stripe is released on every exit path
//! - `try_lock` never blocks
//! - The hasher is a type parameter so integer-keyed pools can use
//!   `IdentityHasher` and get exactly one stripe per key below `len`

use parking_lot::{Mutex, MutexGuard};
use rustc_hash::FxHasher;
use std::hash::{BuildHasher, BuildHasherDefault, Hash, Hasher};
use std::marker::PhantomData;

/// Scoped ownership of one stripe; dropping it unlocks
pub type StripeGuard<'a> = MutexGuard<'a, ()>;

/// Default striping factor per available CPU
pub const STRIPES_PER_CPU: usize = 20;

/// Hasher that passes integer keys through unchanged
///
/// With `len` stripes, keys `0..len` land on distinct stripes. Used for slot
/// indexes and row ids, which are already well distributed.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityHasher(u64);

impl Hasher for IdentityHasher {
    fn finish(&self) -> u64 {
        self.0
    }

    fn write(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 = self.0.rotate_left(8) ^ u64::from(*b);
        }
    }

    fn write_u32(&mut self, i: u32) {
        self.0 = u64::from(i);
    }

    fn write_i32(&mut self, i: i32) {
        self.0 = u64::from(i as u32);
    }

    fn write_u64(&mut self, i: u64) {
        self.0 = i;
    }

    fn write_i64(&mut self, i: i64) {
        self.0 = i as u64;
    }

    fn write_usize(&mut self, i: usize) {
        self.0 = i as u64;
    }
}

/// Builder for `IdentityHasher`
pub type IdentityBuildHasher = BuildHasherDefault<IdentityHasher>;

/// Pool of mutexes indexed by key hash
///
/// # Thread Safety
///
/// `lock` blocks only on the key's own stripe. Holding two stripes of the same
/// pool at once is the caller's responsibility to order.
pub struct StripedLock<K: ?Sized, S = BuildHasherDefault<FxHasher>> {
    locks: Box<[Mutex<()>]>,
    hasher: S,
    _key: PhantomData<fn(&K)>,
}

impl<K: Hash + ?Sized> StripedLock<K> {
    /// Pool with `num_stripes` mutexes (at least one)
    pub fn new(num_stripes: usize) -> Self {
        Self::with_hasher(num_stripes, BuildHasherDefault::default())
    }

    /// Pool sized `available_parallelism * 20`
    pub fn with_default_size() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::new(cpus * STRIPES_PER_CPU)
    }
}

impl<K: Hash + ?Sized, S: BuildHasher> StripedLock<K, S> {
    /// Pool with a custom hasher
    pub fn with_hasher(num_stripes: usize, hasher: S) -> Self {
        let locks = (0..num_stripes.max(1)).map(|_| Mutex::new(())).collect();
        Self {
            locks,
            hasher,
            _key: PhantomData,
        }
    }

    /// Number of stripes
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Always false; a pool has at least one stripe
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// Stripe that guards `key`
    #[inline]
    pub fn stripe_index(&self, key: &K) -> usize {
        let mut hasher = self.hasher.build_hasher();
        key.hash(&mut hasher);
        (hasher.finish() % self.locks.len() as u64) as usize
    }

    /// Block until the key's stripe is held
    #[inline]
    pub fn lock(&self, key: &K) -> StripeGuard<'_> {
        self.locks[self.stripe_index(key)].lock()
    }

    /// Take the key's stripe if it is free
    #[inline]
    pub fn try_lock(&self, key: &K) -> Option<StripeGuard<'_>> {
        self.locks[self.stripe_index(key)].try_lock()
    }
}

impl<K: ?Sized, S> std::fmt::Debug for StripedLock<K, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripedLock")
            .field("stripes", &self.locks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn test_identity_hasher_one_stripe_per_key() {
        let pool: StripedLock<usize, IdentityBuildHasher> =
            StripedLock::with_hasher(16, IdentityBuildHasher::default());
        let stripes: Vec<_> = (0..16usize).map(|k| pool.stripe_index(&k)).collect();
        assert_eq!(stripes, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_try_lock_contention() {
        let pool: StripedLock<i32> = StripedLock::new(4);
        let guard = pool.lock(&7);
        assert!(pool.try_lock(&7).is_none());
        drop(guard);
        assert!(pool.try_lock(&7).is_some());
    }

    #[test]
    fn test_zero_stripes_clamped() {
        let pool: StripedLock<i32> = StripedLock::new(0);
        assert_eq!(pool.len(), 1);
        let _g = pool.lock(&-5);
    }

    #[test]
    fn test_mutual_exclusion_no_lost_updates() {
        const THREADS: usize = 8;
        const ITERS: u64 = 2_000;
        let pool: Arc<StripedLock<i32>> = Arc::new(StripedLock::new(3));
        let counters: Arc<Vec<AtomicU64>> = Arc::new((0..4).map(|_| AtomicU64::new(0)).collect());
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let pool = Arc::clone(&pool);
                let counters = Arc::clone(&counters);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..ITERS {
                        let key = ((t as u64 + i) % 4) as i32;
                        let _guard = pool.lock(&key);
                        // Non-atomic read-modify-write: only correct under the lock.
                        let c = &counters[key as usize];
                        let v = c.load(Ordering::Relaxed);
                        thread::yield_now();
                        c.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let total: u64 = counters.iter().map(|c| c.load(Ordering::Relaxed)).sum();
        assert_eq!(total, THREADS as u64 * ITERS);
    }

    proptest! {
        #[test]
        fn prop_stripe_index_stable_and_in_range(key in any::<i64>(), stripes in 1usize..256) {
            let pool: StripedLock<i64> = StripedLock::new(stripes);
            let idx = pool.stripe_index(&key);
            prop_assert!(idx < pool.len());
            prop_assert_eq!(idx, pool.stripe_index(&key));
        }
    }
}

//! Concurrency primitives for the client row cache
//!
//! - `StripedLock`: a fixed pool of mutexes indexed by `hash(key) % N`
//! - `ClockLru`: CLOCK approximation of LRU over a fixed slot ring, whose
//!   eviction scan hands the caller a locked `EvictionCandidate`
//!
//! Neither primitive aborts the process; capacity violations surface as
//! `ClockLruError` and the owning cache decides what is fatal.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock_lru;
pub mod striped_lock;

pub use clock_lru::{ClockLru, ClockLruError, EvictionCandidate, MAX_NUM_ROUNDS};
pub use striped_lock::{IdentityBuildHasher, IdentityHasher, StripeGuard, StripedLock};

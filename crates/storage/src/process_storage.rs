//! Process storage: the client's shared row cache
//!
//! # Design
//!
//! - DashMap from row id to `(Arc<ClientRow>, slot)`
//! - Row-keyed striped lock pool serializes check-and-insert and eviction of
//!   the same row
//! - `ClockLru` tracks recency; its slot locks are a separate pool
//! - `num_rows` counts occupied plus reserved entries and never exceeds the
//!   capacity once an insert has made room
//!
//! # Lock order
//!
//! Eviction takes the slot lock (inside the candidate) and then the row
//! stripe. Insertion takes the row stripe and then a *free* slot's lock. A
//! free slot is never held by an evictor, so the two orders cannot cycle.
//!
//! # Thread Safety
//!
//! All operations take `&self`. A row is never evicted while a `RowAccessor`
//! for it is alive: accessors are only created under the row stripe, and the
//! evictor re-checks the reference count under that same stripe.

use crate::client_row::{ClientRow, RowAccessor};
use crate::error::{Result, StorageError};
use dashmap::DashMap;
use rustc_hash::FxHasher;
use sspps_concurrency::{ClockLru, IdentityBuildHasher, StripedLock};
use sspps_core::RowId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::hash::BuildHasherDefault;
use std::sync::Arc;
use tracing::{debug, warn};

/// Eviction attempts per insert before giving up
pub const DEFAULT_EVICT_RETRY_LIMIT: usize = 4096;

#[derive(Debug)]
struct StoredRow {
    row: Arc<ClientRow>,
    slot: usize,
}

/// Result of `ProcessStorage::insert_with_accessor`
#[derive(Debug)]
pub struct InsertOutcome {
    /// False when the row was already cached (the cached row is kept)
    pub inserted: bool,
    /// Accessor to the cached row, new or pre-existing
    pub accessor: RowAccessor,
    /// Row evicted to make room, if any
    pub evicted: Option<RowId>,
}

/// Capacity-bounded concurrent row cache
pub struct ProcessStorage {
    capacity: usize,
    storage: DashMap<RowId, StoredRow, BuildHasherDefault<FxHasher>>,
    num_rows: AtomicUsize,
    locks: StripedLock<RowId, IdentityBuildHasher>,
    clock_lru: ClockLru,
    evict_retry_limit: usize,
}

impl ProcessStorage {
    /// Cache of `capacity` rows with `lock_pool_size` row stripes
    pub fn new(capacity: usize, lock_pool_size: usize) -> Self {
        Self {
            capacity,
            storage: DashMap::with_capacity_and_hasher(capacity, BuildHasherDefault::default()),
            num_rows: AtomicUsize::new(0),
            locks: StripedLock::with_hasher(lock_pool_size, IdentityBuildHasher::default()),
            clock_lru: ClockLru::new(capacity),
            evict_retry_limit: DEFAULT_EVICT_RETRY_LIMIT,
        }
    }

    /// Override the per-insert eviction attempt bound
    pub fn with_evict_retry_limit(mut self, limit: usize) -> Self {
        self.evict_retry_limit = limit.max(1);
        self
    }

    /// Maximum number of rows
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Rows currently cached or reserved by in-flight inserts
    pub fn num_rows(&self) -> usize {
        self.num_rows.load(Ordering::Acquire)
    }

    /// Whether `row_id` is cached; does not touch recency
    pub fn contains(&self, row_id: RowId) -> bool {
        self.storage.contains_key(&row_id)
    }

    /// Pin and return a cached row, marking it recently used
    pub fn find(&self, row_id: RowId) -> Option<RowAccessor> {
        let _guard = self.locks.lock(&row_id);
        let entry = self.storage.get(&row_id)?;
        self.clock_lru.reference(entry.slot);
        Some(RowAccessor::new(Arc::clone(&entry.row)))
    }

    /// Cache `row` unless `row_id` is already present
    ///
    /// Returns `Ok(false)` when another insert won; the cached row is kept
    /// and its recency refreshed.
    pub fn insert(&self, row_id: RowId, row: ClientRow) -> Result<bool> {
        self.insert_impl(row_id, row).map(|(inserted, _, _)| inserted)
    }

    /// Like `insert`, also returning an accessor and the evicted row id
    pub fn insert_with_accessor(&self, row_id: RowId, row: ClientRow) -> Result<InsertOutcome> {
        let (inserted, accessor, evicted) = self.insert_impl(row_id, row)?;
        Ok(InsertOutcome {
            inserted,
            accessor,
            evicted,
        })
    }

    fn insert_impl(
        &self,
        row_id: RowId,
        row: ClientRow,
    ) -> Result<(bool, RowAccessor, Option<RowId>)> {
        if let Some(accessor) = self.find(row_id) {
            return Ok((false, accessor, None));
        }

        let mut evicted = None;
        if self.num_rows.fetch_add(1, Ordering::AcqRel) + 1 > self.capacity {
            match self.evict_one(row_id) {
                Ok(victim) => {
                    self.num_rows.fetch_sub(1, Ordering::AcqRel);
                    evicted = Some(victim);
                }
                Err(e) => {
                    self.num_rows.fetch_sub(1, Ordering::AcqRel);
                    return Err(e);
                }
            }
        }

        let _guard = self.locks.lock(&row_id);
        if let Some(entry) = self.storage.get(&row_id) {
            // Lost the race to a concurrent insert of the same row.
            self.num_rows.fetch_sub(1, Ordering::AcqRel);
            self.clock_lru.reference(entry.slot);
            return Ok((false, RowAccessor::new(Arc::clone(&entry.row)), evicted));
        }

        let slot = match self.clock_lru.insert(row_id) {
            Ok(slot) => slot,
            Err(e) => panic!(
                "process storage accounting violated inserting row {row_id} ({} of {} rows): {e}",
                self.num_rows(),
                self.capacity
            ),
        };
        let row = Arc::new(row);
        let accessor = RowAccessor::new(Arc::clone(&row));
        self.storage.insert(row_id, StoredRow { row, slot });
        Ok((true, accessor, evicted))
    }

    /// Remove one unreferenced row; the caller's reservation stays counted
    fn evict_one(&self, inserting: RowId) -> Result<RowId> {
        for _ in 0..self.evict_retry_limit {
            let candidate = match self.clock_lru.find_one_to_evict() {
                Ok(candidate) => candidate,
                Err(e) => {
                    debug!(error = %e, "eviction sweep found no candidate, retrying");
                    continue;
                }
            };
            let victim = candidate.row_id();
            let _row_guard = self.locks.lock(&victim);

            let removable = match self.storage.get(&victim) {
                Some(entry) => entry.slot == candidate.slot() && entry.row.has_zero_ref(),
                None => false,
            };
            if removable {
                self.storage.remove(&victim);
                candidate.evict();
                return Ok(victim);
            }
            candidate.keep_and_release();
        }

        warn!(
            row_id = inserting,
            capacity = self.capacity,
            attempts = self.evict_retry_limit,
            "every eviction candidate is referenced"
        );
        Err(StorageError::EvictionExhausted {
            row_id: inserting,
            attempts: self.evict_retry_limit,
            capacity: self.capacity,
        })
    }
}

impl std::fmt::Debug for ProcessStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessStorage")
            .field("capacity", &self.capacity)
            .field("num_rows", &self.num_rows())
            .finish()
    }
}

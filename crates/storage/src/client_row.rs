//! Cached client rows and their accessors

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use sspps_core::{Clock, Row};
use std::ops::Deref;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;

/// A row held by the process cache
///
/// The row data sits behind a read/write lock so many application threads
/// can read while the bg worker refreshes it. `ref_count` counts live
/// `RowAccessor`s; the cache only evicts rows whose count is zero.
#[derive(Debug)]
pub struct ClientRow {
    clock: AtomicI32,
    ref_count: AtomicUsize,
    row: RwLock<Box<dyn Row>>,
}

impl ClientRow {
    /// Wrap `row`, fresh as of server clock `clock`
    pub fn new(clock: Clock, row: Box<dyn Row>) -> Self {
        Self {
            clock: AtomicI32::new(clock),
            ref_count: AtomicUsize::new(0),
            row: RwLock::new(row),
        }
    }

    /// Server clock the data reflects
    pub fn clock(&self) -> Clock {
        self.clock.load(Ordering::Acquire)
    }

    /// Record a fresher server clock
    pub fn set_clock(&self, clock: Clock) {
        self.clock.store(clock, Ordering::Release);
    }

    /// Number of live accessors
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Whether the row may be evicted
    pub fn has_zero_ref(&self) -> bool {
        self.ref_count() == 0
    }

    /// Shared access to the row data
    pub fn read(&self) -> RwLockReadGuard<'_, Box<dyn Row>> {
        self.row.read()
    }

    /// Exclusive access to the row data
    pub fn write(&self) -> RwLockWriteGuard<'_, Box<dyn Row>> {
        self.row.write()
    }
}

/// Pins a `ClientRow` in the cache while alive
///
/// Created by `ProcessStorage::find` and `insert_with_accessor`; dropping it
/// releases the reference.
#[derive(Debug)]
pub struct RowAccessor {
    row: Arc<ClientRow>,
}

impl RowAccessor {
    pub(crate) fn new(row: Arc<ClientRow>) -> Self {
        row.ref_count.fetch_add(1, Ordering::AcqRel);
        Self { row }
    }

    /// Shared handle to the underlying entry
    pub fn client_row(&self) -> &Arc<ClientRow> {
        &self.row
    }
}

impl Deref for RowAccessor {
    type Target = ClientRow;

    fn deref(&self) -> &ClientRow {
        &self.row
    }
}

impl Clone for RowAccessor {
    fn clone(&self) -> Self {
        RowAccessor::new(Arc::clone(&self.row))
    }
}

impl Drop for RowAccessor {
    fn drop(&mut self) {
        self.row.ref_count.fetch_sub(1, Ordering::AcqRel);
    }
}

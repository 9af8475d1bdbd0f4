//! One bg worker's share of a table's oplog
//!
//! # Design
//!
//! - DashMap from row id to `RowOpLog`; each shard is independently locked
//! - An *oplog index* records rows touched since the owning bg worker last
//!   collected it, so the worker never scans the whole map
//!
//! # Thread Safety
//!
//! Application threads call `inc` concurrently. An `OpLogAccessor` holds its
//! shard's write lock: do not call other methods of the same partition while
//! one is alive on the same thread.

use crate::row_oplog::{RowOpLog, RowOpLogMeta};
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::{FxHashSet, FxHasher};
use sspps_core::{Clock, ColumnId, Row, RowId, TableInfo};
use std::hash::BuildHasherDefault;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

type OpLogMap = DashMap<RowId, RowOpLog, BuildHasherDefault<FxHasher>>;

/// Locked handle to a row oplog; the shard unlocks on drop
pub struct OpLogAccessor<'a> {
    guard: RefMut<'a, RowId, RowOpLog, BuildHasherDefault<FxHasher>>,
}

impl<'a> OpLogAccessor<'a> {
    /// Row the oplog belongs to
    pub fn row_id(&self) -> RowId {
        *self.guard.key()
    }
}

impl Deref for OpLogAccessor<'_> {
    type Target = RowOpLog;

    fn deref(&self) -> &RowOpLog {
        self.guard.value()
    }
}

impl DerefMut for OpLogAccessor<'_> {
    fn deref_mut(&mut self) -> &mut RowOpLog {
        self.guard.value_mut()
    }
}

/// Row oplogs of the rows a single bg worker owns
pub struct OpLogPartition {
    oplogs: OpLogMap,
    index: Mutex<FxHashSet<RowId>>,
    template: TableInfo,
    sample: Arc<dyn Row>,
}

impl OpLogPartition {
    /// Empty partition laid out per `info`
    pub fn new(info: &TableInfo, sample: Arc<dyn Row>, capacity_hint: usize) -> Self {
        Self {
            oplogs: DashMap::with_capacity_and_hasher(capacity_hint, BuildHasherDefault::default()),
            index: Mutex::new(FxHashSet::default()),
            template: info.clone(),
            sample,
        }
    }

    fn create(&self) -> RowOpLog {
        RowOpLog::for_table(&self.template, self.sample.as_ref())
    }

    fn mark(&self, row_id: RowId) {
        self.index.lock().insert(row_id);
    }

    /// Merge one delta into `row_id`'s oplog, creating it on first touch
    pub fn inc(&self, row_id: RowId, column_id: ColumnId, delta: &[u8], clock: Clock) {
        self.oplogs
            .entry(row_id)
            .or_insert_with(|| self.create())
            .inc(self.sample.as_ref(), column_id, delta, clock);
        self.mark(row_id);
    }

    /// Merge a sparse batch of deltas
    pub fn batch_inc(&self, row_id: RowId, column_ids: &[ColumnId], deltas: &[u8], clock: Clock) {
        self.oplogs
            .entry(row_id)
            .or_insert_with(|| self.create())
            .batch_inc(self.sample.as_ref(), column_ids, deltas, clock);
        self.mark(row_id);
    }

    /// Merge deltas for consecutive columns starting at `index_st`
    pub fn dense_batch_inc(
        &self,
        row_id: RowId,
        deltas: &[u8],
        index_st: usize,
        num_updates: usize,
        clock: Clock,
    ) {
        self.oplogs
            .entry(row_id)
            .or_insert_with(|| self.create())
            .dense_batch_inc(self.sample.as_ref(), deltas, index_st, num_updates, clock);
        self.mark(row_id);
    }

    /// Lock and return `row_id`'s oplog if it exists
    pub fn find_and_lock(&self, row_id: RowId) -> Option<OpLogAccessor<'_>> {
        self.oplogs
            .get_mut(&row_id)
            .map(|guard| OpLogAccessor { guard })
    }

    /// Lock `row_id`'s oplog, creating it if needed; true if created
    pub fn find_insert_and_lock(&self, row_id: RowId) -> (OpLogAccessor<'_>, bool) {
        let mut created = false;
        let guard = self.oplogs.entry(row_id).or_insert_with(|| {
            created = true;
            self.create()
        });
        (OpLogAccessor { guard }, created)
    }

    /// Remove and return `row_id`'s pending oplog
    pub fn get_erase_oplog(&self, row_id: RowId) -> Option<RowOpLog> {
        self.oplogs.remove(&row_id).map(|(_, oplog)| oplog)
    }

    /// Read and reset `row_id`'s scheduling metadata
    pub fn get_invalidate_meta(&self, row_id: RowId) -> Option<RowOpLogMeta> {
        self.oplogs
            .get_mut(&row_id)
            .map(|mut oplog| oplog.get_invalidate_meta())
    }

    /// Rows touched since the previous call
    pub fn take_oplog_index(&self) -> Vec<RowId> {
        let touched = std::mem::take(&mut *self.index.lock());
        let mut rows: Vec<_> = touched.into_iter().collect();
        rows.sort_unstable();
        rows
    }

    /// Number of rows with a pending oplog
    pub fn len(&self) -> usize {
        self.oplogs.len()
    }

    /// Whether no row has a pending oplog
    pub fn is_empty(&self) -> bool {
        self.oplogs.is_empty()
    }

    /// Row ids with a pending oplog, ascending
    pub fn row_ids(&self) -> Vec<RowId> {
        let mut rows: Vec<_> = self.oplogs.iter().map(|e| *e.key()).collect();
        rows.sort_unstable();
        rows
    }

    /// Row used for update arithmetic
    pub fn sample_row(&self) -> &dyn Row {
        self.sample.as_ref()
    }
}

impl std::fmt::Debug for OpLogPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpLogPartition")
            .field("rows", &self.oplogs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sspps_core::{encode_updates, Element, SparseRow, SPARSE_F32};
    use std::sync::Barrier;
    use std::thread;

    fn partition() -> OpLogPartition {
        let info = TableInfo::sparse(SPARSE_F32, 16, 1);
        OpLogPartition::new(&info, Arc::new(SparseRow::<f32>::new(SPARSE_F32)), 16)
    }

    #[test]
    fn test_inc_creates_and_indexes() {
        let p = partition();
        assert!(p.find_and_lock(4).is_none());
        p.inc(4, 1, &encode_updates(&[2.0f32]), 0);
        p.inc(8, 1, &encode_updates(&[1.0f32]), 0);

        assert_eq!(p.take_oplog_index(), vec![4, 8]);
        assert!(p.take_oplog_index().is_empty());

        let accessor = p.find_and_lock(4).unwrap();
        assert_eq!(accessor.row_id(), 4);
        assert_eq!(f32::read_le(accessor.find(1).unwrap()), 2.0);
    }

    #[test]
    fn test_get_erase_removes_until_next_inc() {
        let p = partition();
        p.inc(1, 0, &encode_updates(&[1.0f32]), 2);
        let oplog = p.get_erase_oplog(1).unwrap();
        assert_eq!(oplog.meta().clock, 2);
        assert!(p.get_erase_oplog(1).is_none());
        assert!(p.is_empty());

        p.inc(1, 0, &encode_updates(&[1.0f32]), 3);
        assert_eq!(p.get_invalidate_meta(1).unwrap().clock, 3);
        assert!(p.get_invalidate_meta(1).unwrap().is_invalid());
    }

    #[test]
    fn test_find_insert_reports_creation() {
        let p = partition();
        let (_, created) = p.find_insert_and_lock(2);
        assert!(created);
        let (_, created) = p.find_insert_and_lock(2);
        assert!(!created);
    }

    #[test]
    fn test_concurrent_incs_coalesce() {
        const THREADS: usize = 8;
        const ITERS: usize = 500;
        let p = Arc::new(partition());
        let barrier = Arc::new(Barrier::new(THREADS));
        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let p = Arc::clone(&p);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for i in 0..ITERS {
                        p.inc((i % 4) as RowId, 0, &encode_updates(&[1.0f32]), 0);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for row in 0..4 {
            let oplog = p.get_erase_oplog(row).unwrap();
            let expected = (THREADS * ITERS / 4) as f32;
            assert_eq!(f32::read_le(oplog.find(0).unwrap()), expected);
        }
    }
}

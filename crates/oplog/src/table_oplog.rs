//! A table's oplog, sharded across bg worker partitions

use crate::partition::{OpLogAccessor, OpLogPartition};
use crate::row_oplog::{RowOpLog, RowOpLogMeta};
use sspps_core::{Clock, ColumnId, Row, RowId, TableInfo};
use std::sync::Arc;

/// Row oplogs of one table, split by `row_id mod num_partitions`
///
/// # Thread Safety
///
/// Partitions lock independently; writers to rows of different partitions
/// never contend.
#[derive(Debug)]
pub struct TableOpLog {
    partitions: Vec<OpLogPartition>,
    sample: Arc<dyn Row>,
}

impl TableOpLog {
    /// Oplog with `num_partitions` shards sized for `capacity` rows in total
    pub fn new(
        info: &TableInfo,
        sample: Arc<dyn Row>,
        num_partitions: usize,
        capacity: usize,
    ) -> Self {
        let num_partitions = num_partitions.max(1);
        let per_partition = capacity / num_partitions + 1;
        let partitions = (0..num_partitions)
            .map(|_| OpLogPartition::new(info, Arc::clone(&sample), per_partition))
            .collect();
        Self { partitions, sample }
    }

    /// Partition index owning `row_id`
    #[inline]
    pub fn partition_of(&self, row_id: RowId) -> usize {
        row_id.rem_euclid(self.partitions.len() as RowId) as usize
    }

    fn route(&self, row_id: RowId) -> &OpLogPartition {
        &self.partitions[self.partition_of(row_id)]
    }

    /// Partition `idx`
    pub fn partition(&self, idx: usize) -> &OpLogPartition {
        &self.partitions[idx]
    }

    /// Number of partitions
    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    /// Row used for update arithmetic
    pub fn sample_row(&self) -> &dyn Row {
        self.sample.as_ref()
    }

    /// Merge one delta
    pub fn inc(&self, row_id: RowId, column_id: ColumnId, delta: &[u8], clock: Clock) {
        self.route(row_id).inc(row_id, column_id, delta, clock);
    }

    /// Merge a sparse batch
    pub fn batch_inc(&self, row_id: RowId, column_ids: &[ColumnId], deltas: &[u8], clock: Clock) {
        self.route(row_id)
            .batch_inc(row_id, column_ids, deltas, clock);
    }

    /// Merge deltas for consecutive columns
    pub fn dense_batch_inc(
        &self,
        row_id: RowId,
        deltas: &[u8],
        index_st: usize,
        num_updates: usize,
        clock: Clock,
    ) {
        self.route(row_id)
            .dense_batch_inc(row_id, deltas, index_st, num_updates, clock);
    }

    /// Lock `row_id`'s oplog if present
    pub fn find_and_lock(&self, row_id: RowId) -> Option<OpLogAccessor<'_>> {
        self.route(row_id).find_and_lock(row_id)
    }

    /// Remove and return `row_id`'s pending oplog
    pub fn get_erase_oplog(&self, row_id: RowId) -> Option<RowOpLog> {
        self.route(row_id).get_erase_oplog(row_id)
    }

    /// Read and reset `row_id`'s metadata
    pub fn get_invalidate_meta(&self, row_id: RowId) -> Option<RowOpLogMeta> {
        self.route(row_id).get_invalidate_meta(row_id)
    }

    /// Whether any partition holds a pending oplog
    pub fn has_pending(&self) -> bool {
        self.partitions.iter().any(|p| !p.is_empty())
    }
}

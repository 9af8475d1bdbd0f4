//! Client table: cached rows plus buffered local updates
//!
//! # Design
//!
//! - `ProcessStorage` caches rows fetched or pushed from the servers
//! - `TableOpLog` buffers local increments, one partition per bg worker
//! - Increments land in both: the cached row (read-my-writes) and the oplog
//!   (to be shipped)
//!
//! When a server refreshes a cached row, the updates still sitting in the
//! oplog are replayed on top, so a refresh never hides local writes the
//! server has not seen yet.
//!
//! # Thread Safety
//!
//! Shared by all application threads and every bg worker of the process.
//! Writers hold a row's write lock before its oplog shard, on both the
//! increment and the refresh path.

use crate::error::{ClientError, Result};
use sspps_core::{
    Clock, ClientTableConfig, ColumnId, PsConfig, Row, RowId, RowRegistry, TableId, TableInfo,
};
use sspps_oplog::TableOpLog;
use sspps_storage::{ClientRow, ProcessStorage, RowAccessor};
use std::sync::Arc;
use tracing::debug;

/// One table as seen by a client process
pub struct ClientTable {
    table_id: TableId,
    config: ClientTableConfig,
    rows: Arc<RowRegistry>,
    sample: Arc<dyn Row>,
    storage: ProcessStorage,
    oplog: TableOpLog,
}

impl std::fmt::Debug for ClientTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientTable")
            .field("table_id", &self.table_id)
            .field("cached_rows", &self.storage.num_rows())
            .field("partitions", &self.oplog.num_partitions())
            .finish_non_exhaustive()
    }
}

impl ClientTable {
    /// Table `table_id` with one oplog partition per comm channel
    pub fn new(
        table_id: TableId,
        config: ClientTableConfig,
        ps: &PsConfig,
        rows: Arc<RowRegistry>,
    ) -> Result<Self> {
        let info = &config.table_info;
        info.validate()?;
        let sample: Arc<dyn Row> = Arc::from(rows.create_initialized(info.row_type, info.row_capacity)?);
        let storage = ProcessStorage::new(config.process_cache_capacity, ps.lock_pool_size);
        let oplog = TableOpLog::new(
            info,
            Arc::clone(&sample),
            ps.num_comm_channels_per_client as usize,
            config.oplog_capacity,
        );
        Ok(Self {
            table_id,
            config,
            rows,
            sample,
            storage,
            oplog,
        })
    }

    /// Table id
    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Schema shared with the servers
    pub fn info(&self) -> &TableInfo {
        &self.config.table_info
    }

    /// Client-side configuration
    pub fn config(&self) -> &ClientTableConfig {
        &self.config
    }

    /// Row used for update arithmetic
    pub fn sample_row(&self) -> &dyn Row {
        self.sample.as_ref()
    }

    /// Row cache
    pub fn storage(&self) -> &ProcessStorage {
        &self.storage
    }

    /// Buffered updates
    pub fn oplog(&self) -> &TableOpLog {
        &self.oplog
    }

    /// Pin a cached row; `None` means it must be fetched from its server
    pub fn get(&self, row_id: RowId) -> Option<RowAccessor> {
        self.storage.find(row_id)
    }

    /// Read one value of a cached row
    pub fn get_value(&self, row_id: RowId, column_id: ColumnId) -> Option<f64> {
        let accessor = self.storage.find(row_id)?;
        let value = accessor.read().value_f64(column_id);
        Some(value)
    }

    /// Reject elements whose width differs from this table's updates
    pub fn check_element_size(&self, size: usize) -> Result<()> {
        let expected = self.sample.update_size();
        if size != expected {
            return Err(ClientError::ElementSize {
                table_id: self.table_id,
                expected,
                got: size,
            });
        }
        Ok(())
    }

    fn check_update_len(&self, num_updates: usize, deltas: &[u8]) -> Result<()> {
        let expected = num_updates * self.sample.update_size();
        if deltas.len() != expected {
            return Err(ClientError::UpdateLength {
                table_id: self.table_id,
                expected,
                got: deltas.len(),
            });
        }
        Ok(())
    }

    /// Buffer one delta, applying it to the cached row if present
    pub fn inc(&self, row_id: RowId, column_id: ColumnId, delta: &[u8], clock: Clock) -> Result<()> {
        self.sample.check_column(column_id, self.info().row_capacity)?;
        self.check_update_len(1, delta)?;
        match self.storage.find(row_id) {
            Some(accessor) => {
                let mut row = accessor.write();
                self.oplog.inc(row_id, column_id, delta, clock);
                row.apply_inc(column_id, delta);
            }
            None => self.oplog.inc(row_id, column_id, delta, clock),
        }
        Ok(())
    }

    /// Buffer a sparse batch of deltas
    pub fn batch_inc(
        &self,
        row_id: RowId,
        column_ids: &[ColumnId],
        deltas: &[u8],
        clock: Clock,
    ) -> Result<()> {
        self.sample.check_columns(column_ids, self.info().row_capacity)?;
        self.check_update_len(column_ids.len(), deltas)?;
        match self.storage.find(row_id) {
            Some(accessor) => {
                let mut row = accessor.write();
                self.oplog.batch_inc(row_id, column_ids, deltas, clock);
                row.apply_batch_inc(column_ids, deltas);
            }
            None => self.oplog.batch_inc(row_id, column_ids, deltas, clock),
        }
        Ok(())
    }

    /// Buffer deltas for `num_updates` consecutive columns from `index_st`
    pub fn dense_batch_inc(
        &self,
        row_id: RowId,
        deltas: &[u8],
        index_st: usize,
        num_updates: usize,
        clock: Clock,
    ) -> Result<()> {
        self.sample
            .check_dense_range(index_st, num_updates, self.info().row_capacity)?;
        self.check_update_len(num_updates, deltas)?;
        match self.storage.find(row_id) {
            Some(accessor) => {
                let mut row = accessor.write();
                self.oplog
                    .dense_batch_inc(row_id, deltas, index_st, num_updates, clock);
                row.apply_dense_batch_inc(deltas, index_st, num_updates);
            }
            None => self
                .oplog
                .dense_batch_inc(row_id, deltas, index_st, num_updates, clock),
        }
        Ok(())
    }

    /// Install server data for `row_id` as of server clock `clock`
    ///
    /// Used for both pushed rows and row request replies. A cached row is
    /// reset in place; otherwise the row is inserted, which may evict
    /// another. Pending local updates are replayed on top either way.
    pub fn apply_server_push(&self, row_id: RowId, data: &[u8], clock: Clock) -> Result<()> {
        if let Some(accessor) = self.storage.find(row_id) {
            return self.refresh(&accessor, row_id, data, clock);
        }

        let mut row = self.rows.create_initialized(self.info().row_type, self.info().row_capacity)?;
        row.deserialize(data)?;
        self.replay_pending(row_id, row.as_mut());
        let outcome = self
            .storage
            .insert_with_accessor(row_id, ClientRow::new(clock, row))?;
        if let Some(evicted) = outcome.evicted {
            debug!(table_id = self.table_id, row_id, evicted, "row evicted for insert");
        }
        if !outcome.inserted {
            // another thread cached the row first; bring it up to date
            self.refresh(&outcome.accessor, row_id, data, clock)?;
        }
        Ok(())
    }

    fn refresh(&self, accessor: &RowAccessor, row_id: RowId, data: &[u8], clock: Clock) -> Result<()> {
        let mut row = accessor.write();
        if clock < accessor.clock() {
            return Ok(());
        }
        row.reset_row_data(data)?;
        self.replay_pending(row_id, &mut **row);
        accessor.set_clock(clock);
        Ok(())
    }

    fn replay_pending(&self, row_id: RowId, row: &mut dyn Row) {
        let partition = self.oplog.partition(self.oplog.partition_of(row_id));
        if let Some(oplog) = partition.find_and_lock(row_id) {
            for (column_id, update) in oplog.iter() {
                row.apply_inc(column_id, update);
            }
        }
    }

    /// Whether bg worker `channel` has updates to ship
    pub fn has_pending_oplog(&self, channel: usize) -> bool {
        !self.oplog.partition(channel).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sspps_core::{encode_updates, DENSE_F32, DENSE_I32, SPARSE_F32};

    fn table(info: TableInfo, capacity: usize, channels: i32) -> ClientTable {
        let ps = PsConfig {
            num_comm_channels_per_client: channels,
            lock_pool_size: 8,
            ..PsConfig::default()
        };
        let config = ClientTableConfig {
            table_info: info,
            process_cache_capacity: capacity,
            ..ClientTableConfig::default()
        };
        ClientTable::new(0, config, &ps, Arc::new(RowRegistry::with_builtin())).unwrap()
    }

    #[test]
    fn test_inc_uncached_only_buffers() {
        let t = table(TableInfo::dense(DENSE_F32, 3, 1), 4, 2);
        t.inc(5, 1, &encode_updates(&[2.0f32]), 0).unwrap();
        t.inc(5, 1, &encode_updates(&[0.5f32]), 0).unwrap();

        assert!(t.get(5).is_none());
        assert!(t.has_pending_oplog(1));
        assert!(!t.has_pending_oplog(0));
        let partition = t.oplog().partition(1);
        let oplog = partition.find_and_lock(5).unwrap();
        assert_eq!(oplog.find(1).unwrap(), encode_updates(&[2.5f32]).as_slice());
    }

    #[test]
    fn test_push_inserts_and_replays_pending() {
        let t = table(TableInfo::dense(DENSE_F32, 2, 1), 4, 1);
        t.inc(3, 0, &encode_updates(&[1.0f32]), 0).unwrap();

        t.apply_server_push(3, &encode_updates(&[10.0f32, 20.0]), 1).unwrap();
        assert_eq!(t.get_value(3, 0), Some(11.0));
        assert_eq!(t.get_value(3, 1), Some(20.0));
        assert_eq!(t.get(3).unwrap().clock(), 1);
    }

    #[test]
    fn test_inc_on_cached_row_is_visible() {
        let t = table(TableInfo::dense(DENSE_F32, 2, 1), 4, 1);
        t.apply_server_push(7, &encode_updates(&[1.0f32, 1.0]), 0).unwrap();
        t.batch_inc(7, &[0, 1], &encode_updates(&[1.0f32, -1.0]), 0)
            .unwrap();
        assert_eq!(t.get_value(7, 0), Some(2.0));
        assert_eq!(t.get_value(7, 1), Some(0.0));

        // a refresh that predates the local update still shows it
        t.apply_server_push(7, &encode_updates(&[5.0f32, 5.0]), 1).unwrap();
        assert_eq!(t.get_value(7, 0), Some(6.0));
        assert_eq!(t.get_value(7, 1), Some(4.0));
    }

    #[test]
    fn test_stale_refresh_ignored() {
        let t = table(TableInfo::dense(DENSE_F32, 1, 1), 4, 1);
        t.apply_server_push(1, &encode_updates(&[3.0f32]), 4).unwrap();
        t.apply_server_push(1, &encode_updates(&[9.0f32]), 2).unwrap();
        assert_eq!(t.get_value(1, 0), Some(3.0));
        assert_eq!(t.get(1).unwrap().clock(), 4);
    }

    #[test]
    fn test_insert_evicts_when_full() {
        let t = table(TableInfo::dense(DENSE_F32, 1, 1), 2, 1);
        for row_id in 0..3 {
            t.apply_server_push(row_id, &encode_updates(&[row_id as f32]), 0)
                .unwrap();
        }
        assert_eq!(t.storage().num_rows(), 2);
        assert!(t.get(2).is_some());
    }

    #[test]
    fn test_wrong_element_width_is_rejected() {
        let t = table(TableInfo::dense(DENSE_F32, 4, 1), 4, 1);
        assert!(t.check_element_size(4).is_ok());
        let err = t.check_element_size(8).unwrap_err();
        assert!(matches!(
            err,
            ClientError::ElementSize {
                expected: 4,
                got: 8,
                ..
            }
        ));

        let err = t.inc(3, 1, &encode_updates(&[1.0f64]), 0).unwrap_err();
        assert!(err.is_invalid_update());
        let err = t
            .batch_inc(3, &[0, 1], &encode_updates(&[1.0f32]), 0)
            .unwrap_err();
        assert!(matches!(err, ClientError::UpdateLength { expected: 8, got: 4, .. }));
        assert!(!t.has_pending_oplog(0));
    }

    #[test]
    fn test_column_outside_dense_row_is_rejected() {
        let t = table(TableInfo::dense(DENSE_F32, 4, 1), 4, 1);
        t.apply_server_push(2, &encode_updates(&[1.0f32; 4]), 0).unwrap();

        let err = t.inc(2, 4, &encode_updates(&[1.0f32]), 0).unwrap_err();
        assert!(err.is_invalid_update());
        assert!(t.inc(2, -1, &encode_updates(&[1.0f32]), 0).is_err());
        assert!(t
            .batch_inc(2, &[0, 7], &encode_updates(&[1.0f32, 1.0]), 0)
            .is_err());
        assert!(t
            .dense_batch_inc(2, &encode_updates(&[1.0f32, 1.0]), 3, 2, 0)
            .is_err());

        assert!(!t.has_pending_oplog(0));
        assert_eq!(t.get_value(2, 3), Some(1.0));

        // sparse rows take any column
        let sparse = table(TableInfo::sparse(SPARSE_F32, 8, 1), 4, 1);
        sparse.inc(0, 100, &encode_updates(&[1.0f32]), 0).unwrap();
    }

    #[test]
    fn test_sparse_dense_batch_inc() {
        let t = table(TableInfo::sparse(SPARSE_F32, 8, 1), 4, 1);
        t.dense_batch_inc(2, &encode_updates(&[1.0f32, 2.0]), 3, 2, 0)
            .unwrap();
        let partition = t.oplog().partition(0);
        let oplog = partition.find_and_lock(2).unwrap();
        assert_eq!(oplog.find(4).unwrap(), encode_updates(&[2.0f32]).as_slice());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_push_replays_every_pending_inc(
                incs in prop::collection::vec((0..4i32, -100..100i32), 1..40),
                base in prop::collection::vec(-1000..1000i32, 4),
            ) {
                let t = table(TableInfo::dense(DENSE_I32, 4, 0), 8, 1);
                let mut expected: Vec<f64> = base.iter().map(|v| f64::from(*v)).collect();
                for (column_id, delta) in &incs {
                    t.inc(0, *column_id, &encode_updates(&[*delta]), 0).unwrap();
                    expected[*column_id as usize] += f64::from(*delta);
                }
                t.apply_server_push(0, &encode_updates(&base), 1).unwrap();
                for (column_id, value) in expected.iter().enumerate() {
                    prop_assert_eq!(t.get_value(0, column_id as i32), Some(*value));
                }
            }
        }
    }
}

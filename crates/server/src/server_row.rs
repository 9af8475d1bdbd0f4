//! Authoritative row state held by a server table

use rustc_hash::FxHashMap;
use sspps_core::{ClientId, ColumnId, Row, RowId};
use sspps_wire::{RecordBuff, RECORD_HEADER_SIZE};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

/// Version carried by a versioned dense oplog
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowVersion {
    /// Version of the update stream
    pub version: u64,
    /// The sender finished this version
    pub end_of_version: bool,
}

/// Result of appending one row to the per-client push buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendRow {
    /// Every remaining subscriber received the row
    Done {
        /// Clients appended during this call
        num_clients: usize,
    },
    /// `client_id`'s buffer is full; resume from that client
    Full {
        /// Client whose buffer could not take the row
        client_id: ClientId,
        /// Clients appended before the failure
        num_clients: usize,
    },
}

/// One row on the server: data, subscribers, and push bookkeeping
///
/// A row is dirty once an update lands and clean again after it is pushed.
/// Only subscribed clients receive pushes.
#[derive(Debug)]
pub struct ServerRow {
    row: Box<dyn Row>,
    subscribers: BTreeSet<ClientId>,
    dirty: bool,
    importance: f64,
    version: Option<RowVersion>,
}

impl ServerRow {
    /// Wrap `row`; `versioned` rows remember the last applied oplog version
    pub fn new(row: Box<dyn Row>, versioned: bool) -> Self {
        Self {
            row,
            subscribers: BTreeSet::new(),
            dirty: false,
            importance: 0.0,
            version: versioned.then(RowVersion::default),
        }
    }

    /// Row data
    pub fn row(&self) -> &dyn Row {
        self.row.as_ref()
    }

    /// Mutable row data; marks the row dirty
    pub fn row_mut(&mut self) -> &mut dyn Row {
        self.dirty = true;
        self.row.as_mut()
    }

    /// Subscribe `client_id` to pushes; returns whether it was new
    pub fn subscribe(&mut self, client_id: ClientId) -> bool {
        self.subscribers.insert(client_id)
    }

    /// Stop pushing to `client_id`
    pub fn unsubscribe(&mut self, client_id: ClientId) -> bool {
        self.subscribers.remove(&client_id)
    }

    /// Whether `client_id` receives pushes
    pub fn is_subscribed(&self, client_id: ClientId) -> bool {
        self.subscribers.contains(&client_id)
    }

    /// Whether nobody receives pushes of this row
    pub fn no_client_subscribed(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Subscribed clients in ascending order
    pub fn subscribers(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.subscribers.iter().copied()
    }

    /// Whether updates arrived since the last push
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Mark as pushed
    pub fn reset_dirty(&mut self) {
        self.dirty = false;
    }

    /// Accumulated update magnitude since the last push
    pub fn importance(&self) -> f64 {
        self.importance
    }

    /// Clear accumulated importance
    pub fn reset_importance(&mut self) {
        self.importance = 0.0;
    }

    /// Last applied version (versioned rows only)
    pub fn version(&self) -> Option<RowVersion> {
        self.version
    }

    /// Record the version of an applied oplog
    pub fn record_version(&mut self, version: RowVersion) {
        if let Some(current) = self.version.as_mut() {
            *current = version;
        }
    }

    /// Apply a sparse batch
    pub fn apply_batch_inc(&mut self, column_ids: &[ColumnId], updates: &[u8]) {
        self.row.apply_batch_inc(column_ids, updates);
        self.dirty = true;
    }

    /// Apply a sparse batch and add its magnitude to the row's importance
    pub fn apply_batch_inc_accum_importance(&mut self, column_ids: &[ColumnId], updates: &[u8]) {
        self.importance += self.row.apply_batch_inc_get_importance(column_ids, updates);
        self.dirty = true;
    }

    /// Apply updates for columns `0..num_updates`
    pub fn apply_dense_batch_inc(&mut self, updates: &[u8], num_updates: usize) {
        self.row.apply_dense_batch_inc(updates, 0, num_updates);
        self.dirty = true;
    }

    /// Dense apply that accumulates importance
    pub fn apply_dense_batch_inc_accum_importance(&mut self, updates: &[u8], num_updates: usize) {
        self.importance += self
            .row
            .apply_dense_batch_inc_get_importance(updates, 0, num_updates);
        self.dirty = true;
    }

    /// Bytes `serialize` appends
    pub fn serialized_size(&self) -> usize {
        self.row.serialized_size()
    }

    /// Append the serialized row to `out`
    pub fn serialize(&self, out: &mut Vec<u8>) {
        self.row.serialize(out);
    }

    /// Add this row's record size to every subscriber's total
    pub fn accum_serialized_size_per_client(&self, sizes: &mut FxHashMap<ClientId, usize>) {
        let record = RECORD_HEADER_SIZE + self.serialized_size();
        for client_id in &self.subscribers {
            *sizes.entry(*client_id).or_insert(0) += record;
        }
    }

    /// Append `data` to the buffers of subscribers `>= start_client`
    ///
    /// Stops at the first full buffer so the caller can flush it and resume.
    /// Subscribers without a buffer are skipped.
    pub fn append_row_to_buffs(
        &self,
        start_client: ClientId,
        buffs: &mut BTreeMap<ClientId, RecordBuff>,
        data: &[u8],
        row_id: RowId,
    ) -> AppendRow {
        let mut num_clients = 0;
        for client_id in self.subscribers.range(start_client..) {
            let Some(buff) = buffs.get_mut(client_id) else {
                warn!(client_id, row_id, "subscriber has no push buffer");
                continue;
            };
            if !buff.append_record(row_id, data) {
                return AppendRow::Full {
                    client_id: *client_id,
                    num_clients,
                };
            }
            num_clients += 1;
        }
        AppendRow::Done { num_clients }
    }

    /// Append `data` to buffers sized by `accum_serialized_size_per_client`
    ///
    /// # Panics
    ///
    /// If a subscriber's buffer cannot hold the row, which means the buffers
    /// were not sized from this row's subscribers.
    pub fn append_row_to_buffs_partial(
        &self,
        buffs: &mut BTreeMap<ClientId, RecordBuff>,
        data: &[u8],
        row_id: RowId,
    ) -> usize {
        let mut num_clients = 0;
        for client_id in &self.subscribers {
            let fits = buffs
                .get_mut(client_id)
                .map_or(false, |buff| buff.append_record(row_id, data));
            if !fits {
                panic!(
                    "push buffer of client {} too small for row {} ({} bytes)",
                    client_id,
                    row_id,
                    data.len()
                );
            }
            num_clients += 1;
        }
        num_clients
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sspps_core::{encode_updates, DenseRow, DENSE_F32};

    fn dense_row() -> ServerRow {
        ServerRow::new(Box::new(DenseRow::<f32>::with_capacity(DENSE_F32, 4)), false)
    }

    #[test]
    fn test_apply_marks_dirty_and_accumulates_importance() {
        let mut row = dense_row();
        assert!(!row.is_dirty());
        row.apply_dense_batch_inc(&encode_updates(&[1.0f32, 2.0]), 2);
        assert!(row.is_dirty());
        assert_eq!(row.importance(), 0.0);

        row.apply_batch_inc_accum_importance(&[3], &encode_updates(&[-4.0f32]));
        assert_eq!(row.importance(), 4.0);
        assert_eq!(row.row().value_f64(0), 1.0);
        assert_eq!(row.row().value_f64(3), -4.0);

        row.reset_dirty();
        row.reset_importance();
        assert!(!row.is_dirty());
        assert_eq!(row.importance(), 0.0);
    }

    #[test]
    fn test_version_only_tracked_when_enabled() {
        let mut plain = dense_row();
        plain.record_version(RowVersion {
            version: 3,
            end_of_version: true,
        });
        assert!(plain.version().is_none());

        let mut versioned =
            ServerRow::new(Box::new(DenseRow::<f32>::with_capacity(DENSE_F32, 4)), true);
        assert_eq!(versioned.version(), Some(RowVersion::default()));
        versioned.record_version(RowVersion {
            version: 3,
            end_of_version: true,
        });
        assert_eq!(versioned.version().unwrap().version, 3);
    }

    #[test]
    fn test_size_accounting_per_subscriber() {
        let mut row = dense_row();
        row.subscribe(0);
        row.subscribe(2);
        assert!(!row.subscribe(2));
        let mut sizes = FxHashMap::default();
        row.accum_serialized_size_per_client(&mut sizes);
        row.accum_serialized_size_per_client(&mut sizes);
        let record = RECORD_HEADER_SIZE + row.serialized_size();
        assert_eq!(sizes[&0], 2 * record);
        assert_eq!(sizes[&2], 2 * record);
        assert!(!sizes.contains_key(&1));
    }

    #[test]
    fn test_append_stops_at_full_buffer_and_resumes() {
        let mut row = dense_row();
        for c in 0..3 {
            row.subscribe(c);
        }
        let mut data = Vec::new();
        row.serialize(&mut data);
        let record = RECORD_HEADER_SIZE + data.len();

        let mut buffs = BTreeMap::new();
        buffs.insert(0, RecordBuff::new(record));
        buffs.insert(1, RecordBuff::new(record - 1));
        buffs.insert(2, RecordBuff::new(record));

        assert_eq!(
            row.append_row_to_buffs(0, &mut buffs, &data, 7),
            AppendRow::Full {
                client_id: 1,
                num_clients: 1
            }
        );
        buffs.insert(1, RecordBuff::new(record));
        assert_eq!(
            row.append_row_to_buffs(1, &mut buffs, &data, 7),
            AppendRow::Done { num_clients: 2 }
        );
        assert!(buffs.values().all(|b| b.remaining() == 0));
    }

    #[test]
    #[should_panic(expected = "too small")]
    fn test_partial_append_requires_sized_buffers() {
        let mut row = dense_row();
        row.subscribe(0);
        let mut buffs = BTreeMap::new();
        buffs.insert(0, RecordBuff::new(4));
        row.append_row_to_buffs_partial(&mut buffs, &[0; 16], 1);
    }
}

//! Server state of one server thread
//!
//! # Design
//!
//! `Server` owns every table hosted by a server thread plus the protocol
//! state shared across tables:
//!
//! - a `VectorClock` over the bg workers it serves; the minimum is the
//!   server clock
//! - the last oplog message version applied from each bg worker
//! - row requests waiting for the server clock to catch up
//!
//! It never touches the message bus. Push messages are handed to a caller
//! supplied `send` callback as `PushRowBatch`es, so the thread loop decides
//! how they are framed and tracked.

use crate::error::{Result, ServerError};
use crate::server_row::ServerRow;
use crate::table::{AppendOutcome, ServerTable, TableContext};
use crate::vector_clock::VectorClock;
use rustc_hash::FxHashMap;
use sspps_core::{
    ClientId, Clock, PsConfig, RowId, TableId, TableInfo, ThreadId, SERIALIZED_TABLE_END,
    SERIALIZED_TABLE_SEPARATOR,
};
use sspps_oplog::SerializedOpLogReader;
use sspps_wire::RecordBuff;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Initial capacity of a full-push message buffer
pub const PUSH_ROW_MSG_SIZE_INIT: usize = 4096;

/// Wire value of "no oplog applied yet"; the next expected version wraps to 0
pub const NO_VERSION: u32 = u32::MAX;

const TABLE_ID_SIZE: usize = 4;

/// A row request waiting for the server clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerRowRequest {
    /// Requesting bg worker
    pub bg_id: ThreadId,
    /// Table id
    pub table_id: TableId,
    /// Row id
    pub row_id: RowId,
    /// Clock the reply must reflect
    pub clock: Clock,
}

/// Data for a `ServerRowRequestReply`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowReply {
    /// Server clock at reply time
    pub clock: Clock,
    /// Last oplog version applied from the requester
    pub version: u32,
    /// Serialized row
    pub row_data: Vec<u8>,
}

/// One `ServerPushRow` message ready to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushRowBatch {
    /// Destination bg worker
    pub bg_id: ThreadId,
    /// Server clock the rows reflect
    pub clock: Clock,
    /// Last oplog version applied from `bg_id`
    pub version: u32,
    /// Last message of a clock-boundary push
    pub is_clock: bool,
    /// Push payload
    pub payload: Vec<u8>,
}

/// What an oplog message did to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpLogApply {
    /// The message was new; `rows` row oplogs were applied
    Applied {
        /// Row oplogs applied
        rows: usize,
    },
    /// The message was already applied and was skipped
    Duplicate,
}

/// Tables and protocol state of one server thread
#[derive(Debug)]
pub struct Server {
    server_id: ThreadId,
    config: Arc<PsConfig>,
    ctx: TableContext,
    tables: BTreeMap<TableId, ServerTable>,
    bg_ids: Vec<ThreadId>,
    bg_clock: VectorClock,
    bg_version: FxHashMap<ThreadId, Option<u32>>,
    row_requests: BTreeMap<Clock, Vec<ServerRowRequest>>,
    accum_oplog_count: usize,
    push_msg_size: usize,
}

impl Server {
    /// Server for thread `server_id` serving `bg_ids`
    pub fn new(
        server_id: ThreadId,
        bg_ids: &[ThreadId],
        config: Arc<PsConfig>,
        ctx: TableContext,
    ) -> Self {
        let mut bg_ids = bg_ids.to_vec();
        bg_ids.sort_unstable();
        bg_ids.dedup();
        Self {
            server_id,
            config,
            ctx,
            tables: BTreeMap::new(),
            bg_clock: VectorClock::with_ids(bg_ids.iter().copied()),
            bg_version: bg_ids.iter().map(|id| (*id, None)).collect(),
            bg_ids,
            row_requests: BTreeMap::new(),
            accum_oplog_count: 0,
            push_msg_size: PUSH_ROW_MSG_SIZE_INIT,
        }
    }

    /// Owning server thread id
    pub fn server_id(&self) -> ThreadId {
        self.server_id
    }

    /// Bg workers served, ascending
    pub fn bg_ids(&self) -> &[ThreadId] {
        &self.bg_ids
    }

    /// Look up a table
    pub fn table(&self, table_id: TableId) -> Option<&ServerTable> {
        self.tables.get(&table_id)
    }

    /// Look up a table for modification
    pub fn table_mut(&mut self, table_id: TableId) -> Option<&mut ServerTable> {
        self.tables.get_mut(&table_id)
    }

    /// Number of tables
    pub fn num_tables(&self) -> usize {
        self.tables.len()
    }

    /// Create a table, restoring it from the resume snapshot when configured
    pub fn create_table(&mut self, table_id: TableId, info: TableInfo) -> Result<()> {
        let Entry::Vacant(entry) = self.tables.entry(table_id) else {
            return Err(ServerError::TableExists(table_id));
        };
        let table = entry.insert(ServerTable::new(table_id, info, &self.ctx)?);
        if self.config.resume_clock > 0 {
            let restored = table.read_snapshot(
                &self.config.resume_dir,
                self.server_id,
                self.config.resume_clock,
            )?;
            info!(
                server_id = self.server_id,
                table_id,
                restored,
                resume_clock = self.config.resume_clock,
                "table resumed"
            );
        }
        Ok(())
    }

    /// Find a row, creating it if absent
    pub fn find_create_row(&mut self, table_id: TableId, row_id: RowId) -> Result<&mut ServerRow> {
        let table = self
            .tables
            .get_mut(&table_id)
            .ok_or(ServerError::UnknownTable(table_id))?;
        Ok(table.create_row(row_id))
    }

    /// Raise `bg_id`'s clock; returns whether the server clock advanced
    ///
    /// Every `snapshot_clock` server clocks all tables are snapshotted. A
    /// failed snapshot is logged and does not stop the server.
    pub fn clock_until(&mut self, bg_id: ThreadId, clock: Clock) -> bool {
        let Some(new_clock) = self.bg_clock.tick_until(bg_id, clock) else {
            return false;
        };
        let every = self.config.snapshot_clock;
        if every > 0 && new_clock % every == 0 {
            for (table_id, table) in &self.tables {
                if let Err(e) = table.take_snapshot(&self.config.snapshot_dir, self.server_id, new_clock)
                {
                    error!(
                        server_id = self.server_id,
                        table_id,
                        clock = new_clock,
                        error = %e,
                        "snapshot failed"
                    );
                }
            }
        }
        true
    }

    /// Server clock: the slowest bg worker's clock
    pub fn min_clock(&self) -> Clock {
        self.bg_clock.min_clock()
    }

    /// Last oplog version applied from `bg_id`
    pub fn bg_version(&self, bg_id: ThreadId) -> Option<u32> {
        self.bg_version.get(&bg_id).copied().flatten()
    }

    /// `bg_version` as carried on the wire
    pub fn wire_version(&self, bg_id: ThreadId) -> u32 {
        self.bg_version(bg_id).unwrap_or(NO_VERSION)
    }

    /// Queue a row request until the server clock reaches `clock`
    pub fn add_row_request(&mut self, bg_id: ThreadId, table_id: TableId, row_id: RowId, clock: Clock) {
        self.row_requests
            .entry(clock)
            .or_default()
            .push(ServerRowRequest {
                bg_id,
                table_id,
                row_id,
                clock,
            });
    }

    /// Take every queued request the server clock now satisfies
    pub fn get_fulfilled_row_requests(&mut self) -> Vec<ServerRowRequest> {
        let min = self.min_clock();
        let pending = self.row_requests.split_off(&(min + 1));
        let ready = std::mem::replace(&mut self.row_requests, pending);
        ready.into_values().flatten().collect()
    }

    /// Number of queued row requests
    pub fn pending_row_requests(&self) -> usize {
        self.row_requests.values().map(Vec::len).sum()
    }

    /// Subscribe `bg_id`'s client to a row and serialize it for a reply
    pub fn serve_row_request(
        &mut self,
        bg_id: ThreadId,
        table_id: TableId,
        row_id: RowId,
    ) -> Result<RowReply> {
        let clock = self.min_clock();
        let version = self.wire_version(bg_id);
        let client_id = self.config.client_of_bg(bg_id);
        let table = self
            .tables
            .get_mut(&table_id)
            .ok_or(ServerError::UnknownTable(table_id))?;
        let row = table.create_row(row_id);
        row.subscribe(client_id);
        let mut row_data = Vec::with_capacity(row.serialized_size());
        row.serialize(&mut row_data);
        table.row_sent(row_id, 1);
        Ok(RowReply {
            clock,
            version,
            row_data,
        })
    }

    /// Apply one oplog message from `bg_id`
    ///
    /// Versions must arrive consecutively from 0. A version at or below the
    /// last applied one is a retransmission and is skipped; a jump ahead is
    /// `ServerError::VersionGap`. Rows missing on this server are created.
    pub fn apply_oplog_update_version(
        &mut self,
        payload: &[u8],
        bg_id: ThreadId,
        version: u32,
    ) -> Result<OpLogApply> {
        let Some(last) = self.bg_version.get(&bg_id).copied() else {
            return Err(ServerError::UnknownBg(bg_id));
        };
        let expected = last.map_or(0, |v| v.wrapping_add(1));
        if version != expected {
            if last.is_some_and(|v| version <= v) {
                warn!(bg_id, version, expected, "duplicate oplog message skipped");
                return Ok(OpLogApply::Duplicate);
            }
            return Err(ServerError::VersionGap {
                bg_id,
                expected,
                got: version,
            });
        }

        // the whole payload is decoded and checked before any row changes
        let tables = &self.tables;
        let mut reader = SerializedOpLogReader::new(payload)?;
        let mut updates = Vec::new();
        while let Some(update) =
            reader.next_row(|table_id| tables.get(&table_id).map(ServerTable::oplog_layout))?
        {
            let table = tables
                .get(&update.table_id)
                .ok_or(ServerError::UnknownTable(update.table_id))?;
            table.check_row_oplog(&update.updates)?;
            updates.push(update);
        }

        for update in &updates {
            let table = self
                .tables
                .get_mut(&update.table_id)
                .ok_or(ServerError::UnknownTable(update.table_id))?;
            if !table.apply_row_oplog(update.row_id, &update.updates)? {
                table.create_row(update.row_id);
                table.apply_row_oplog(update.row_id, &update.updates)?;
            }
        }
        let rows = updates.len();
        self.accum_oplog_count += rows;
        self.bg_version.insert(bg_id, Some(version));
        debug!(bg_id, version, rows, "oplog applied");
        Ok(OpLogApply::Applied { rows })
    }

    /// Whether any oplog was applied since the last push
    pub fn accumed_oplog_since_last_push(&self) -> bool {
        self.accum_oplog_count > 0
    }

    /// Report a row sent outside the push paths
    pub fn row_sent(&mut self, table_id: TableId, row_id: RowId, num_clients: usize) {
        if let Some(table) = self.tables.get_mut(&table_id) {
            table.row_sent(row_id, num_clients);
        }
    }

    fn push_targets(&self) -> Vec<(ClientId, ThreadId)> {
        self.bg_ids
            .iter()
            .map(|bg_id| (self.config.client_of_bg(*bg_id), *bg_id))
            .collect()
    }

    fn batch(&self, bg_id: ThreadId, is_clock: bool, payload: Vec<u8>) -> PushRowBatch {
        PushRowBatch {
            bg_id,
            clock: self.min_clock(),
            version: self.wire_version(bg_id),
            is_clock,
            payload,
        }
    }

    /// Push every dirty subscribed row to its subscribers
    ///
    /// Each client gets one or more messages; the last one is marked
    /// `is_clock` when `clock_changed`. Returns the bytes sent.
    pub fn create_send_server_push_row_msgs<F>(
        &mut self,
        clock_changed: bool,
        mut send: F,
    ) -> Result<usize>
    where
        F: FnMut(PushRowBatch) -> Result<usize>,
    {
        self.accum_oplog_count = 0;
        let targets = self.push_targets();
        let bg_of: FxHashMap<ClientId, ThreadId> = targets.iter().copied().collect();
        let mut buffs: BTreeMap<ClientId, RecordBuff> = targets
            .iter()
            .map(|(client_id, _)| (*client_id, RecordBuff::new(self.push_msg_size)))
            .collect();
        let mut sent = 0;

        let table_ids: Vec<TableId> = self.tables.keys().copied().collect();
        let num_tables = table_ids.len();
        for (idx, table_id) in table_ids.into_iter().enumerate() {
            for (client_id, bg_id) in &targets {
                let needs_flush = buffs
                    .get_mut(client_id)
                    .map_or(false, |buff| !buff.append_i32(table_id));
                if needs_flush {
                    sent += self.flush_push_buff(&mut buffs, *client_id, *bg_id, Some(table_id), &mut send)?;
                }
            }

            let Some(table) = self.tables.get_mut(&table_id) else {
                continue;
            };
            table.init_append_table_to_buffs();
            loop {
                let outcome = match self.tables.get_mut(&table_id) {
                    Some(table) => table.append_table_to_buffs(&mut buffs),
                    None => AppendOutcome::Done,
                };
                let AppendOutcome::Full { client_id, needed } = outcome else {
                    break;
                };
                let Some(bg_id) = bg_of.get(&client_id).copied() else {
                    panic!("push buffer for unknown client {}", client_id);
                };
                let only_header = buffs
                    .get(&client_id)
                    .map_or(true, |buff| buff.len() <= TABLE_ID_SIZE);
                if only_header {
                    // A single row is larger than a whole message.
                    self.push_msg_size = self
                        .push_msg_size
                        .saturating_mul(2)
                        .max(TABLE_ID_SIZE + needed + TABLE_ID_SIZE);
                    let mut grown = RecordBuff::new(self.push_msg_size);
                    grown.append_i32(table_id);
                    buffs.insert(client_id, grown);
                    debug!(
                        server_id = self.server_id,
                        size = self.push_msg_size,
                        "push buffer grown"
                    );
                } else {
                    if let Some(buff) = buffs.get_mut(&client_id) {
                        buff.append_i32(SERIALIZED_TABLE_END);
                    }
                    sent += self.flush_push_buff(&mut buffs, client_id, bg_id, Some(table_id), &mut send)?;
                }
            }

            if idx + 1 < num_tables {
                for (client_id, bg_id) in &targets {
                    let needs_flush = buffs
                        .get_mut(client_id)
                        .map_or(false, |buff| !buff.append_i32(SERIALIZED_TABLE_SEPARATOR));
                    if needs_flush {
                        sent += self.flush_push_buff(&mut buffs, *client_id, *bg_id, None, &mut send)?;
                    }
                }
            }
        }

        for (client_id, bg_id) in &targets {
            let Some(mut buff) = buffs.remove(client_id) else {
                continue;
            };
            buff.append_i32(SERIALIZED_TABLE_END);
            let batch = self.batch(*bg_id, clock_changed, buff.into_bytes());
            sent += send(batch)?;
        }
        Ok(sent)
    }

    /// Send `client_id`'s buffer as a non-final message and replace it with
    /// an empty one that starts with `table_id`
    fn flush_push_buff<F>(
        &self,
        buffs: &mut BTreeMap<ClientId, RecordBuff>,
        client_id: ClientId,
        bg_id: ThreadId,
        table_id: Option<TableId>,
        send: &mut F,
    ) -> Result<usize>
    where
        F: FnMut(PushRowBatch) -> Result<usize>,
    {
        let mut fresh = RecordBuff::new(self.push_msg_size);
        if let Some(table_id) = table_id {
            fresh.append_i32(table_id);
        }
        let full = buffs.insert(client_id, fresh).unwrap_or_else(|| RecordBuff::new(0));
        send(self.batch(bg_id, false, full.into_bytes()))
    }

    /// Idle-time push of a bounded selection of rows per table
    ///
    /// Only clients with selected rows receive a message. Returns the bytes
    /// sent, 0 when nothing was eligible.
    pub fn create_send_server_push_row_msgs_partial<F>(&mut self, mut send: F) -> Result<usize>
    where
        F: FnMut(PushRowBatch) -> Result<usize>,
    {
        self.accum_oplog_count = 0;
        let mut client_sizes: FxHashMap<ClientId, usize> = FxHashMap::default();
        let mut selected: Vec<(TableId, Vec<RowId>)> = Vec::with_capacity(self.tables.len());
        for (table_id, table) in self.tables.iter_mut() {
            let rows = table.get_partial_table_to_send(&mut client_sizes);
            selected.push((*table_id, rows));
        }
        if selected.iter().all(|(_, rows)| rows.is_empty()) {
            return Ok(0);
        }

        let markers = 2 * TABLE_ID_SIZE * self.tables.len();
        let targets = self.push_targets();
        let mut buffs: BTreeMap<ClientId, RecordBuff> = targets
            .iter()
            .filter_map(|(client_id, _)| {
                let size = client_sizes.get(client_id).copied().unwrap_or(0);
                (size > 0).then(|| (*client_id, RecordBuff::new(size + markers)))
            })
            .collect();

        let num_tables = selected.len();
        for (idx, (table_id, rows)) in selected.iter().enumerate() {
            for buff in buffs.values_mut() {
                buff.append_i32(*table_id);
            }
            if let Some(table) = self.tables.get_mut(table_id) {
                table.append_rows_to_buffs_partial(&mut buffs, rows);
            }
            let marker = if idx + 1 == num_tables {
                SERIALIZED_TABLE_END
            } else {
                SERIALIZED_TABLE_SEPARATOR
            };
            for buff in buffs.values_mut() {
                buff.append_i32(marker);
            }
        }

        let mut sent = 0;
        for (client_id, bg_id) in &targets {
            if let Some(buff) = buffs.remove(client_id) {
                let batch = self.batch(*bg_id, false, buff.into_bytes());
                sent += send(batch)?;
            }
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::ServerTableLogicRegistry;
    use sspps_core::{encode_updates, Element, RowRegistry, UpdateSortPolicy, DENSE_F32, SPARSE_I32};
    use sspps_oplog::{OpLogSerializer, RowOpLog};
    use sspps_wire::PushRowReader;
    use tempfile::TempDir;

    const BG0: ThreadId = 100;
    const BG1: ThreadId = 1100;

    fn config() -> PsConfig {
        PsConfig {
            num_clients: 2,
            ..PsConfig::default()
        }
    }

    fn server_with(config: PsConfig) -> Server {
        let config = Arc::new(config);
        let ctx = TableContext {
            seed: Some(1),
            ..TableContext::from_config(
                &config,
                Arc::new(RowRegistry::with_builtin()),
                Arc::new(ServerTableLogicRegistry::new()),
            )
        };
        let mut server = Server::new(1, &[BG0, BG1], config, ctx);
        server
            .create_table(0, TableInfo::dense(DENSE_F32, 2, 0))
            .unwrap();
        server
            .create_table(1, TableInfo::sparse(SPARSE_I32, 0, 0))
            .unwrap();
        server
    }

    fn server() -> Server {
        server_with(config())
    }

    fn dense_payload(rows: &[(RowId, [f32; 2])]) -> Vec<u8> {
        let registry = RowRegistry::with_builtin();
        let sample = registry.create_initialized(DENSE_F32, 2).unwrap();
        let mut ser = OpLogSerializer::new();
        for (row_id, values) in rows {
            let mut oplog = RowOpLog::dense(sample.as_ref(), 2);
            for (col, v) in values.iter().enumerate() {
                oplog.inc(sample.as_ref(), col as i32, &encode_updates(&[*v]), 0);
            }
            ser.append_row_oplog(0, 0, true, *row_id, &mut oplog, sample.as_ref());
        }
        ser.finish().remove(&0).unwrap()
    }

    fn read_push(payload: &[u8]) -> Vec<(TableId, RowId, Vec<u8>)> {
        let mut reader = PushRowReader::new(payload);
        let mut rows = Vec::new();
        while let Some(row) = reader.next_row().unwrap() {
            rows.push((row.table_id, row.row_id, row.data.to_vec()));
        }
        rows
    }

    #[test]
    fn test_duplicate_table_rejected() {
        let mut server = server();
        let err = server
            .create_table(0, TableInfo::dense(DENSE_F32, 2, 0))
            .unwrap_err();
        assert!(matches!(err, ServerError::TableExists(0)));
    }

    #[test]
    fn test_apply_creates_rows_and_tracks_versions() {
        let mut server = server();
        let payload = dense_payload(&[(3, [1.0, 2.0]), (4, [0.5, 0.0])]);
        assert_eq!(
            server.apply_oplog_update_version(&payload, BG0, 0).unwrap(),
            OpLogApply::Applied { rows: 2 }
        );
        assert_eq!(server.bg_version(BG0), Some(0));
        assert_eq!(server.wire_version(BG1), NO_VERSION);
        assert!(server.accumed_oplog_since_last_push());

        let row = server.table(0).unwrap().find_row(3).unwrap();
        assert_eq!(row.row().value_f64(1), 2.0);
        assert!(row.is_dirty());

        assert_eq!(
            server.apply_oplog_update_version(&payload, BG0, 0).unwrap(),
            OpLogApply::Duplicate
        );
        let row = server.table(0).unwrap().find_row(3).unwrap();
        assert_eq!(row.row().value_f64(1), 2.0);

        let err = server
            .apply_oplog_update_version(&payload, BG0, 5)
            .unwrap_err();
        assert!(matches!(
            err,
            ServerError::VersionGap {
                expected: 1,
                got: 5,
                ..
            }
        ));
        assert!(server.apply_oplog_update_version(&[], BG0, 1).is_ok());
        assert!(matches!(
            server.apply_oplog_update_version(&[], 7, 0),
            Err(ServerError::UnknownBg(7))
        ));
    }

    #[test]
    fn test_truncated_payload_applies_nothing() {
        let mut server = server();
        let payload = dense_payload(&[(3, [1.0, 2.0]), (4, [0.5, 0.0])]);
        let truncated = &payload[..payload.len() - 3];
        let err = server
            .apply_oplog_update_version(truncated, BG0, 0)
            .unwrap_err();
        assert!(err.is_protocol());
        assert!(server.table(0).unwrap().find_row(3).is_none());
        assert_eq!(server.bg_version(BG0), None);
        assert!(!server.accumed_oplog_since_last_push());

        // the resend applies every row exactly once
        assert_eq!(
            server.apply_oplog_update_version(&payload, BG0, 0).unwrap(),
            OpLogApply::Applied { rows: 2 }
        );
        let row = server.table(0).unwrap().find_row(3).unwrap();
        assert_eq!(row.row().value_f64(1), 2.0);
    }

    #[test]
    fn test_out_of_range_column_rejects_whole_payload() {
        let mut server = server();
        server
            .create_table(2, TableInfo::sparse(DENSE_F32, 2, 0))
            .unwrap();
        let sample = RowRegistry::with_builtin()
            .create_initialized(DENSE_F32, 2)
            .unwrap();
        let mut ser = OpLogSerializer::new();
        for (row_id, column_id) in [(1, 0), (2, 9)] {
            let mut oplog = RowOpLog::sparse(f32::SIZE);
            oplog.inc(sample.as_ref(), column_id, &encode_updates(&[1.0f32]), 0);
            ser.append_row_oplog(0, 2, false, row_id, &mut oplog, sample.as_ref());
        }
        let payload = ser.finish().remove(&0).unwrap();

        let err = server
            .apply_oplog_update_version(&payload, BG0, 0)
            .unwrap_err();
        assert!(err.is_protocol());
        assert!(server.table(2).unwrap().find_row(1).is_none());
        assert_eq!(server.bg_version(BG0), None);
    }

    #[test]
    fn test_row_requests_wait_for_min_clock() {
        let mut server = server();
        server.add_row_request(BG0, 0, 1, 1);
        server.add_row_request(BG1, 0, 2, 2);
        assert!(server.get_fulfilled_row_requests().is_empty());

        assert!(!server.clock_until(BG0, 1));
        assert!(server.clock_until(BG1, 1));
        let ready = server.get_fulfilled_row_requests();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].row_id, 1);
        assert_eq!(server.pending_row_requests(), 1);

        assert!(!server.clock_until(BG0, 3));
        assert!(server.clock_until(BG1, 3));
        assert_eq!(server.min_clock(), 3);
        assert_eq!(server.get_fulfilled_row_requests()[0].row_id, 2);
    }

    #[test]
    fn test_serve_row_request_subscribes_client() {
        let mut server = server();
        let reply = server.serve_row_request(BG1, 0, 9).unwrap();
        assert_eq!(reply.clock, 0);
        assert_eq!(reply.version, NO_VERSION);
        assert_eq!(reply.row_data.len(), 2 * 4);
        assert!(server.table(0).unwrap().find_row(9).unwrap().is_subscribed(1));
        assert!(matches!(
            server.serve_row_request(BG0, 5, 0),
            Err(ServerError::UnknownTable(5))
        ));
    }

    #[test]
    fn test_full_push_reaches_only_subscribers() {
        let mut server = server();
        server.serve_row_request(BG0, 0, 3).unwrap();
        server.serve_row_request(BG1, 0, 4).unwrap();
        server.serve_row_request(BG1, 1, 4).unwrap();
        let payload = dense_payload(&[(3, [1.0, 2.0]), (4, [3.0, 4.0])]);
        server.apply_oplog_update_version(&payload, BG0, 0).unwrap();

        let mut batches = Vec::new();
        let sent = server
            .create_send_server_push_row_msgs(true, |batch| {
                let len = batch.payload.len();
                batches.push(batch);
                Ok(len)
            })
            .unwrap();
        assert!(sent > 0);
        assert!(!server.accumed_oplog_since_last_push());
        assert_eq!(batches.len(), 2);
        assert!(batches.iter().all(|b| b.is_clock));

        let to_bg0 = &batches[0];
        assert_eq!(to_bg0.bg_id, BG0);
        assert_eq!(to_bg0.version, 0);
        let rows = read_push(&to_bg0.payload);
        assert_eq!(rows.len(), 1);
        assert_eq!((rows[0].0, rows[0].1), (0, 3));
        assert_eq!(f32::read_le(&rows[0].2[4..]), 2.0);

        // the sparse row 4 is clean, so client 1 only sees dense row 4
        let rows = read_push(&batches[1].payload);
        assert_eq!(rows.iter().map(|r| (r.0, r.1)).collect::<Vec<_>>(), vec![(0, 4)]);

        let mut again = Vec::new();
        server
            .create_send_server_push_row_msgs(false, |batch| {
                again.push(batch);
                Ok(0)
            })
            .unwrap();
        assert!(again.iter().all(|b| read_push(&b.payload).is_empty() && !b.is_clock));
    }

    #[test]
    fn test_full_push_splits_and_grows_buffers() {
        let mut server = server();
        let mut rows = Vec::new();
        for row_id in 0..400 {
            server.serve_row_request(BG0, 0, row_id).unwrap();
            rows.push((row_id, [row_id as f32, 1.0]));
        }
        server
            .apply_oplog_update_version(&dense_payload(&rows), BG0, 0)
            .unwrap();

        let mut batches = Vec::new();
        server
            .create_send_server_push_row_msgs(true, |batch| {
                batches.push(batch);
                Ok(0)
            })
            .unwrap();
        let to_bg0: Vec<_> = batches.iter().filter(|b| b.bg_id == BG0).collect();
        assert!(to_bg0.len() > 1);
        assert!(to_bg0[..to_bg0.len() - 1].iter().all(|b| !b.is_clock));
        assert!(to_bg0.last().unwrap().is_clock);
        let received: usize = to_bg0.iter().map(|b| read_push(&b.payload).len()).sum();
        assert_eq!(received, 400);
        assert!(batches.iter().all(|b| b.payload.len() <= PUSH_ROW_MSG_SIZE_INIT));
    }

    #[test]
    fn test_partial_push_is_bounded() {
        let mut config = config();
        config.update_sort_policy = UpdateSortPolicy::FixedOrder;
        let mut server = server_with(config);
        let mut rows = Vec::new();
        for row_id in 0..250 {
            server.serve_row_request(BG1, 0, row_id).unwrap();
            rows.push((row_id, [1.0, 1.0]));
        }
        server
            .apply_oplog_update_version(&dense_payload(&rows), BG1, 0)
            .unwrap();

        let bound = server.table(0).unwrap().info().server_push_row_upper_bound;
        let mut batches = Vec::new();
        let sent = server
            .create_send_server_push_row_msgs_partial(|batch| {
                let len = batch.payload.len();
                batches.push(batch);
                Ok(len)
            })
            .unwrap();
        assert!(sent > 0);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].bg_id, BG1);
        assert!(!batches[0].is_clock);
        let pushed = read_push(&batches[0].payload);
        assert_eq!(pushed.len(), bound);
        assert!(pushed.iter().enumerate().all(|(i, r)| r.1 == i as RowId));
    }

    #[test]
    fn test_partial_push_with_nothing_dirty_sends_nothing() {
        let mut server = server();
        server.serve_row_request(BG0, 0, 1).unwrap();
        let sent = server
            .create_send_server_push_row_msgs_partial(|_| panic!("nothing to send"))
            .unwrap();
        assert_eq!(sent, 0);
    }

    #[test]
    fn test_snapshot_on_clock_and_resume() {
        let dir = TempDir::new().unwrap();
        let mut config = config();
        config.snapshot_clock = 2;
        config.snapshot_dir = dir.path().to_path_buf();
        let mut server = server_with(config.clone());
        server
            .apply_oplog_update_version(&dense_payload(&[(8, [4.0, 5.0])]), BG0, 0)
            .unwrap();
        for clock in 1..=2 {
            server.clock_until(BG0, clock);
            server.clock_until(BG1, clock);
        }
        assert!(dir
            .path()
            .join("server_table.server-1.table-0.clock-2.dat")
            .exists());

        config.resume_clock = 2;
        config.resume_dir = dir.path().to_path_buf();
        let resumed = server_with(config);
        let row = resumed.table(0).unwrap().find_row(8).unwrap();
        assert_eq!(row.row().value_f64(0), 4.0);
        assert!(!row.is_dirty());
    }
}

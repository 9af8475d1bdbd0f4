//! Server table: authoritative rows of one table on one server thread
//!
//! # Design
//!
//! Rows live in a `BTreeMap` so both push paths have a stable order to walk:
//! the full push resumes from a saved row id after a buffer fills, and the
//! fixed-order partial push keeps a round-robin cursor across calls.
//!
//! The apply strategy (`ApplyMode`) and the partial push policy
//! (`PartialPushPolicy`) are fixed when the table is created.
//!
//! # Thread Safety
//!
//! A table is owned by exactly one server thread and is not shared.

use crate::error::Result;
use crate::logic::{ApplyMode, ServerTableLogic, ServerTableLogicRegistry};
use crate::server_row::{AppendRow, RowVersion, ServerRow};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rustc_hash::FxHashMap;
use sspps_core::{ClientId, PsConfig, Row, RowId, RowRegistry, TableId, TableInfo, UpdateSortPolicy};
use sspps_durability::{snapshot_file_name, SnapshotReader, SnapshotStats, SnapshotWriter};
use sspps_oplog::{OpLogLayout, RowUpdates};
use sspps_wire::{RecordBuff, RECORD_HEADER_SIZE};
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Order of sampled candidates in a regular partial push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOrder {
    /// Uniform shuffle
    Random,
    /// Importance descending, ties by row id ascending
    Importance,
}

/// How idle-time partial pushes pick rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartialPushPolicy {
    /// Sample candidates, order them, take the first rows
    Regular(CandidateOrder),
    /// Round-robin over row ids from a persistent cursor
    FixedOrder,
}

impl PartialPushPolicy {
    /// Policy implied by the process sort policy
    pub fn select(policy: UpdateSortPolicy, accumulate_importance: bool) -> Self {
        if policy.is_fixed_order() {
            PartialPushPolicy::FixedOrder
        } else if accumulate_importance {
            PartialPushPolicy::Regular(CandidateOrder::Importance)
        } else {
            PartialPushPolicy::Regular(CandidateOrder::Random)
        }
    }
}

/// Process-wide inputs shared by every table of a server
#[derive(Debug, Clone)]
pub struct TableContext {
    /// Row constructors
    pub rows: Arc<RowRegistry>,
    /// Server table logic constructors
    pub logics: Arc<ServerTableLogicRegistry>,
    /// Accumulate per-row importance on apply
    pub accumulate_importance: bool,
    /// Process sort policy
    pub update_sort_policy: UpdateSortPolicy,
    /// Candidate over-sampling factor for regular partial pushes
    pub row_candidate_factor: usize,
    /// Seed for candidate sampling; entropy when `None`
    pub seed: Option<u64>,
}

impl TableContext {
    /// Context derived from `config`
    pub fn from_config(
        config: &PsConfig,
        rows: Arc<RowRegistry>,
        logics: Arc<ServerTableLogicRegistry>,
    ) -> Self {
        Self {
            rows,
            logics,
            accumulate_importance: config.server_accumulates_importance(),
            update_sort_policy: config.update_sort_policy,
            row_candidate_factor: config.row_candidate_factor,
            seed: None,
        }
    }
}

/// Outcome of `ServerTable::append_table_to_buffs`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// Every dirty subscribed row was appended
    Done,
    /// `client_id`'s buffer is full; flush it and call again to resume
    Full {
        /// Client whose buffer filled up
        client_id: ClientId,
        /// Record size that did not fit
        needed: usize,
    },
}

#[derive(Debug)]
struct PendingRow {
    row_id: RowId,
    data: Vec<u8>,
    next_client: ClientId,
    num_clients: usize,
}

/// Where a full push stopped
#[derive(Debug, Default)]
struct AppendCursor {
    last_row: Option<RowId>,
    pending: Option<PendingRow>,
}

/// Rows of one table held by one server thread
#[derive(Debug)]
pub struct ServerTable {
    table_id: TableId,
    info: TableInfo,
    storage: BTreeMap<RowId, ServerRow>,
    sample: Box<dyn Row>,
    apply_mode: ApplyMode,
    push_policy: PartialPushPolicy,
    push_cursor: Option<RowId>,
    row_candidate_factor: usize,
    rng: StdRng,
    logic: Option<Box<dyn ServerTableLogic>>,
    append: Option<AppendCursor>,
    scratch: Vec<u8>,
}

impl ServerTable {
    /// Create an empty table
    ///
    /// Fails if the row type or the server table logic is not registered.
    pub fn new(table_id: TableId, info: TableInfo, ctx: &TableContext) -> Result<Self> {
        let sample = ctx.rows.create_initialized(info.row_type, info.row_capacity)?;
        let apply_mode = ApplyMode::select(info.oplog_dense_serialized, ctx.accumulate_importance);
        let logic = match info.server_table_logic {
            Some(logic_id) => {
                let mut logic = ctx.logics.create(logic_id)?;
                logic.init(&info, apply_mode);
                Some(logic)
            }
            None => None,
        };
        let rng = match ctx.seed {
            Some(seed) => StdRng::seed_from_u64(seed ^ table_id as u64),
            None => StdRng::from_entropy(),
        };
        debug!(table_id, ?apply_mode, "server table created");
        Ok(Self {
            table_id,
            push_policy: PartialPushPolicy::select(
                ctx.update_sort_policy,
                ctx.accumulate_importance,
            ),
            info,
            storage: BTreeMap::new(),
            sample,
            apply_mode,
            push_cursor: None,
            row_candidate_factor: ctx.row_candidate_factor.max(1),
            rng,
            logic,
            append: None,
            scratch: Vec::new(),
        })
    }

    /// Table id
    pub fn table_id(&self) -> TableId {
        self.table_id
    }

    /// Table configuration
    pub fn info(&self) -> &TableInfo {
        &self.info
    }

    /// Apply strategy
    pub fn apply_mode(&self) -> ApplyMode {
        self.apply_mode
    }

    /// Partial push policy
    pub fn push_policy(&self) -> PartialPushPolicy {
        self.push_policy
    }

    /// Encoding of oplogs addressed to this table
    pub fn oplog_layout(&self) -> OpLogLayout {
        OpLogLayout {
            dense: self.info.oplog_dense_serialized,
            versioned: self.info.version_maintain,
            update_size: self.sample.update_size(),
        }
    }

    /// Number of rows
    pub fn len(&self) -> usize {
        self.storage.len()
    }

    /// Whether the table has no rows
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Row ids in ascending order
    pub fn row_ids(&self) -> Vec<RowId> {
        self.storage.keys().copied().collect()
    }

    /// Look up a row
    pub fn find_row(&self, row_id: RowId) -> Option<&ServerRow> {
        self.storage.get(&row_id)
    }

    /// Look up a row for modification
    pub fn find_row_mut(&mut self, row_id: RowId) -> Option<&mut ServerRow> {
        self.storage.get_mut(&row_id)
    }

    /// Create `row_id` if absent and return it
    pub fn create_row(&mut self, row_id: RowId) -> &mut ServerRow {
        match self.storage.entry(row_id) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let mut data = self.sample.boxed_clone();
                data.init(self.info.row_capacity);
                let mut row = ServerRow::new(data, self.info.version_maintain);
                if let Some(logic) = self.logic.as_mut() {
                    logic.server_row_created(row_id, &mut row);
                }
                entry.insert(row)
            }
        }
    }

    /// Reject updates addressing columns outside the table's rows
    pub fn check_row_oplog(&self, updates: &RowUpdates<'_>) -> Result<()> {
        let capacity = self.info.row_capacity;
        match updates {
            RowUpdates::Sparse { column_ids, .. } => self.sample.check_columns(column_ids, capacity)?,
            RowUpdates::Dense { num_updates, .. } => {
                self.sample.check_dense_range(0, *num_updates, capacity)?
            }
        }
        Ok(())
    }

    /// Apply one row's oplog; `false` if the row does not exist
    ///
    /// Nothing is applied when a column is out of range.
    pub fn apply_row_oplog(&mut self, row_id: RowId, updates: &RowUpdates<'_>) -> Result<bool> {
        self.check_row_oplog(updates)?;
        let Some(row) = self.storage.get_mut(&row_id) else {
            return Ok(false);
        };
        let version = match updates {
            RowUpdates::Dense {
                version: Some((version, end_of_version)),
                ..
            } if self.info.version_maintain => RowVersion {
                version: *version,
                end_of_version: *end_of_version,
            },
            _ => RowVersion::default(),
        };
        match self.logic.as_mut() {
            Some(logic) => logic.apply_row_oplog(row_id, updates, row, version),
            None => self.apply_mode.apply(updates, row),
        }
        row.record_version(version);
        Ok(true)
    }

    /// Report a row sent outside the push paths (a row request reply)
    pub fn row_sent(&mut self, row_id: RowId, num_clients: usize) {
        if let (Some(logic), Some(row)) = (self.logic.as_mut(), self.storage.get(&row_id)) {
            logic.server_row_sent(row_id, row.version(), num_clients);
        }
    }

    /// Mark a row as pushed and serialize it into `scratch`
    fn take_for_send(
        row: &mut ServerRow,
        apply_mode: ApplyMode,
        scratch: &mut Vec<u8>,
    ) {
        row.reset_dirty();
        if apply_mode.accumulates_importance() {
            row.reset_importance();
        }
        scratch.clear();
        row.serialize(scratch);
    }

    /// Start a full push from the first row
    pub fn init_append_table_to_buffs(&mut self) {
        self.append = Some(AppendCursor::default());
    }

    /// Append every dirty subscribed row to its subscribers' buffers
    ///
    /// On `Full`, the caller flushes (or grows) that client's buffer and calls
    /// again; the table resumes with the same row at that client.
    pub fn append_table_to_buffs(
        &mut self,
        buffs: &mut BTreeMap<ClientId, RecordBuff>,
    ) -> AppendOutcome {
        let mut cursor = self.append.take().unwrap_or_default();

        if let Some(pending) = cursor.pending.take() {
            let Some(row) = self.storage.get(&pending.row_id) else {
                panic!("row {} vanished during a push", pending.row_id);
            };
            match row.append_row_to_buffs(pending.next_client, buffs, &pending.data, pending.row_id)
            {
                AppendRow::Done { num_clients } => {
                    if let Some(logic) = self.logic.as_mut() {
                        logic.server_row_sent(
                            pending.row_id,
                            row.version(),
                            pending.num_clients + num_clients,
                        );
                    }
                }
                AppendRow::Full {
                    client_id,
                    num_clients,
                } => {
                    let needed = RECORD_HEADER_SIZE + pending.data.len();
                    cursor.pending = Some(PendingRow {
                        next_client: client_id,
                        num_clients: pending.num_clients + num_clients,
                        ..pending
                    });
                    self.append = Some(cursor);
                    return AppendOutcome::Full { client_id, needed };
                }
            }
        }

        let start = cursor
            .last_row
            .map_or(Bound::Unbounded, Bound::Excluded);
        for (row_id, row) in self.storage.range_mut((start, Bound::Unbounded)) {
            cursor.last_row = Some(*row_id);
            if row.no_client_subscribed() || !row.is_dirty() {
                continue;
            }
            Self::take_for_send(row, self.apply_mode, &mut self.scratch);
            match row.append_row_to_buffs(ClientId::MIN, buffs, &self.scratch, *row_id) {
                AppendRow::Done { num_clients } => {
                    if let Some(logic) = self.logic.as_mut() {
                        logic.server_row_sent(*row_id, row.version(), num_clients);
                    }
                }
                AppendRow::Full {
                    client_id,
                    num_clients,
                } => {
                    let needed = RECORD_HEADER_SIZE + self.scratch.len();
                    cursor.pending = Some(PendingRow {
                        row_id: *row_id,
                        data: self.scratch.clone(),
                        next_client: client_id,
                        num_clients,
                    });
                    self.append = Some(cursor);
                    return AppendOutcome::Full { client_id, needed };
                }
            }
        }
        AppendOutcome::Done
    }

    /// Pick at most `server_push_row_upper_bound` dirty subscribed rows for
    /// an idle-time push, adding their sizes to `client_sizes`
    pub fn get_partial_table_to_send(
        &mut self,
        client_sizes: &mut FxHashMap<ClientId, usize>,
    ) -> Vec<RowId> {
        if let Some(logic) = self.logic.as_ref() {
            if !logic.allow_send() {
                return Vec::new();
            }
        }
        let threshold = self.info.server_push_row_upper_bound;
        if threshold == 0 || self.storage.is_empty() {
            return Vec::new();
        }
        let rows = match self.push_policy {
            PartialPushPolicy::Regular(order) => self.partial_regular(threshold, order),
            PartialPushPolicy::FixedOrder => self.partial_fixed_order(threshold),
        };
        for row_id in &rows {
            if let Some(row) = self.storage.get(row_id) {
                row.accum_serialized_size_per_client(client_sizes);
            }
        }
        rows
    }

    fn partial_regular(&mut self, threshold: usize, order: CandidateOrder) -> Vec<RowId> {
        let num_candidates = threshold
            .saturating_mul(self.row_candidate_factor)
            .min(self.storage.len());
        let select_prob = num_candidates as f64 / self.storage.len() as f64;

        let mut candidates: Vec<(RowId, f64)> = Vec::with_capacity(num_candidates);
        for (row_id, row) in &self.storage {
            if row.no_client_subscribed() || !row.is_dirty() {
                continue;
            }
            if self.rng.gen::<f64>() <= select_prob {
                candidates.push((*row_id, row.importance()));
            }
            if candidates.len() == num_candidates {
                break;
            }
        }

        match order {
            CandidateOrder::Random => candidates.shuffle(&mut self.rng),
            CandidateOrder::Importance => {
                candidates.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)))
            }
        }
        candidates.truncate(threshold);
        candidates.into_iter().map(|(row_id, _)| row_id).collect()
    }

    fn partial_fixed_order(&mut self, threshold: usize) -> Vec<RowId> {
        let start = self.push_cursor.unwrap_or(RowId::MIN);
        let mut rows = Vec::new();
        let mut last = None;
        let wrapped = self
            .storage
            .range(start..)
            .chain(self.storage.range(..start));
        for (row_id, row) in wrapped {
            last = Some(*row_id);
            if row.no_client_subscribed() || !row.is_dirty() {
                continue;
            }
            rows.push(*row_id);
            if rows.len() >= threshold {
                break;
            }
        }
        if rows.len() >= threshold {
            self.push_cursor = last.and_then(|row_id| {
                self.storage
                    .range((Bound::Excluded(row_id), Bound::Unbounded))
                    .next()
                    .map(|(next, _)| *next)
            });
        }
        rows
    }

    /// Append the rows chosen by `get_partial_table_to_send`
    ///
    /// # Panics
    ///
    /// If a row is missing, clean or unsubscribed, or if a buffer was not
    /// sized for the selection.
    pub fn append_rows_to_buffs_partial(
        &mut self,
        buffs: &mut BTreeMap<ClientId, RecordBuff>,
        rows_to_send: &[RowId],
    ) {
        for row_id in rows_to_send {
            let Some(row) = self.storage.get_mut(row_id) else {
                panic!("row {} selected for push does not exist", row_id);
            };
            if row.no_client_subscribed() || !row.is_dirty() {
                panic!("row {} should not be sent", row_id);
            }
            Self::take_for_send(row, self.apply_mode, &mut self.scratch);
            let num_clients = row.append_row_to_buffs_partial(buffs, &self.scratch, *row_id);
            if let Some(logic) = self.logic.as_mut() {
                logic.server_row_sent(*row_id, row.version(), num_clients);
            }
        }
    }

    /// Write every row to `dir`'s snapshot file for `clock`
    pub fn take_snapshot(
        &self,
        dir: impl AsRef<Path>,
        server_id: i32,
        clock: sspps_core::Clock,
    ) -> Result<SnapshotStats> {
        let path = snapshot_file_name(dir, server_id, self.table_id, clock);
        let mut writer = SnapshotWriter::create(&path)?;
        let mut buf = Vec::new();
        for (row_id, row) in &self.storage {
            buf.clear();
            row.serialize(&mut buf);
            writer.write_row(*row_id, &buf)?;
        }
        let stats = writer.finish()?;
        info!(
            table_id = self.table_id,
            server_id,
            clock,
            rows = stats.rows,
            "snapshot taken"
        );
        Ok(stats)
    }

    /// Recreate rows from the snapshot for `clock`; returns rows restored
    ///
    /// Restored rows are clean and have no subscribers.
    pub fn read_snapshot(
        &mut self,
        dir: impl AsRef<Path>,
        server_id: i32,
        clock: sspps_core::Clock,
    ) -> Result<usize> {
        let path = snapshot_file_name(dir, server_id, self.table_id, clock);
        let mut restored = 0;
        for record in SnapshotReader::open(&path)? {
            let (row_id, data) = record?;
            let mut row = self.sample.boxed_clone();
            row.init(self.info.row_capacity);
            row.deserialize(&data)?;
            self.storage
                .insert(row_id, ServerRow::new(row, self.info.version_maintain));
            restored += 1;
        }
        self.push_cursor = None;
        info!(table_id = self.table_id, server_id, clock, restored, "snapshot restored");
        Ok(restored)
    }
}

//! Pending updates of a single row
//!
//! A `RowOpLog` holds at most one buffered delta per column. Repeated
//! increments to the same column coalesce through the row type's own
//! `add_updates`, so the oplog never interprets update bytes itself.
//!
//! # Layouts
//!
//! - Sparse: ordered map of touched columns
//! - Dense: one slot per column up to the table's dense oplog capacity
//! - Versioned: dense, plus a version tag the server uses to drop duplicates
//!
//! # Encodings
//!
//! - Sparse: `[num:i32][column_ids:i32 x num][updates]`
//! - Dense: `[num:i32][updates]`, followed by `[version:u64][end:u8]` when
//!   versioned

use byteorder::{LittleEndian, WriteBytesExt};
use smallvec::SmallVec;
use sspps_core::{Clock, ColumnId, Row, RowOpLogType, TableInfo, INVALID_CLOCK};
use std::collections::BTreeMap;

/// Bytes appended after a versioned dense oplog
pub const VERSION_TRAILER_SIZE: usize = 8 + 1;

type UpdateBytes = SmallVec<[u8; 8]>;

/// Scheduling metadata kept alongside each row oplog
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RowOpLogMeta {
    /// Clock of the first update since the bg worker last read the meta
    pub clock: Clock,
    /// Accumulated magnitude of those updates
    pub importance: f64,
}

impl Default for RowOpLogMeta {
    fn default() -> Self {
        Self {
            clock: INVALID_CLOCK,
            importance: 0.0,
        }
    }
}

impl RowOpLogMeta {
    /// Whether the meta has been read out since the last update
    pub fn is_invalid(&self) -> bool {
        self.clock == INVALID_CLOCK
    }
}

/// Whether an oplog carries a version tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpLogKind {
    /// No version tracking
    Plain,
    /// Dense oplog tagged for exactly-once apply
    Versioned {
        /// Version of the message that carries this oplog
        version: u64,
        /// Whether this is the last piece of that version
        end_of_version: bool,
    },
}

#[derive(Debug, Clone)]
enum Payload {
    Sparse(BTreeMap<ColumnId, UpdateBytes>),
    Dense { updates: Vec<u8>, capacity: usize },
}

/// Buffered deltas of one row
#[derive(Debug, Clone)]
pub struct RowOpLog {
    update_size: usize,
    payload: Payload,
    kind: OpLogKind,
    meta: RowOpLogMeta,
}

impl RowOpLog {
    /// Empty sparse oplog
    pub fn sparse(update_size: usize) -> Self {
        Self {
            update_size,
            payload: Payload::Sparse(BTreeMap::new()),
            kind: OpLogKind::Plain,
            meta: RowOpLogMeta::default(),
        }
    }

    /// Zeroed dense oplog of `capacity` columns
    pub fn dense(sample: &dyn Row, capacity: usize) -> Self {
        let update_size = sample.update_size();
        let mut updates = vec![0u8; capacity * update_size];
        for (col, chunk) in updates.chunks_exact_mut(update_size).enumerate() {
            sample.init_update(col as ColumnId, chunk);
        }
        Self {
            update_size,
            payload: Payload::Dense { updates, capacity },
            kind: OpLogKind::Plain,
            meta: RowOpLogMeta::default(),
        }
    }

    /// Zeroed dense oplog with a version tag
    pub fn versioned_dense(sample: &dyn Row, capacity: usize) -> Self {
        Self {
            kind: OpLogKind::Versioned {
                version: 0,
                end_of_version: false,
            },
            ..Self::dense(sample, capacity)
        }
    }

    /// Oplog laid out as the table's configuration asks
    pub fn for_table(info: &TableInfo, sample: &dyn Row) -> Self {
        match (info.row_oplog_type, info.version_maintain) {
            (RowOpLogType::Sparse, _) => Self::sparse(sample.update_size()),
            (RowOpLogType::Dense, false) => Self::dense(sample, info.dense_row_oplog_capacity),
            (RowOpLogType::Dense, true) => {
                Self::versioned_dense(sample, info.dense_row_oplog_capacity)
            }
        }
    }

    /// Width of one column's update
    pub fn update_size(&self) -> usize {
        self.update_size
    }

    /// Version tagging of this oplog
    pub fn kind(&self) -> OpLogKind {
        self.kind
    }

    /// Whether the payload is dense
    pub fn is_dense(&self) -> bool {
        matches!(self.payload, Payload::Dense { .. })
    }

    /// Current version, if versioned
    pub fn version(&self) -> Option<u64> {
        match self.kind {
            OpLogKind::Versioned { version, .. } => Some(version),
            OpLogKind::Plain => None,
        }
    }

    /// Whether this oplog closes its version
    pub fn end_of_version(&self) -> bool {
        matches!(
            self.kind,
            OpLogKind::Versioned {
                end_of_version: true,
                ..
            }
        )
    }

    /// Tag a versioned oplog before it is serialized; no-op when plain
    pub fn set_version(&mut self, version: u64, end_of_version: bool) {
        if let OpLogKind::Versioned { .. } = self.kind {
            self.kind = OpLogKind::Versioned {
                version,
                end_of_version,
            };
        }
    }

    /// Scheduling metadata
    pub fn meta(&self) -> RowOpLogMeta {
        self.meta
    }

    /// Read the metadata and reset it so later updates start a new epoch
    pub fn get_invalidate_meta(&mut self) -> RowOpLogMeta {
        std::mem::take(&mut self.meta)
    }

    fn touch(&mut self, clock: Clock, importance: f64) {
        if self.meta.is_invalid() {
            self.meta.clock = clock;
        }
        self.meta.importance += importance;
    }

    /// Buffered delta of `column_id`, if any
    pub fn find(&self, column_id: ColumnId) -> Option<&[u8]> {
        match &self.payload {
            Payload::Sparse(map) => map.get(&column_id).map(|u| u.as_slice()),
            Payload::Dense { updates, capacity } => {
                let col = usize::try_from(column_id).ok().filter(|c| c < capacity)?;
                let start = col * self.update_size;
                Some(&updates[start..start + self.update_size])
            }
        }
    }

    /// Buffered delta of `column_id`, created as the zero update if absent
    ///
    /// # Panics
    ///
    /// Panics if a dense oplog is addressed outside its capacity.
    pub fn find_create(&mut self, sample: &dyn Row, column_id: ColumnId) -> &mut [u8] {
        let update_size = self.update_size;
        match &mut self.payload {
            Payload::Sparse(map) => map
                .entry(column_id)
                .or_insert_with(|| {
                    let mut zero = UpdateBytes::from_elem(0, update_size);
                    sample.init_update(column_id, &mut zero);
                    zero
                })
                .as_mut_slice(),
            Payload::Dense { updates, capacity } => {
                let col = match usize::try_from(column_id) {
                    Ok(col) if col < *capacity => col,
                    _ => panic!(
                        "column {column_id} outside dense oplog capacity {}",
                        capacity
                    ),
                };
                let start = col * update_size;
                &mut updates[start..start + update_size]
            }
        }
    }

    /// Merge one column delta
    pub fn inc(&mut self, sample: &dyn Row, column_id: ColumnId, delta: &[u8], clock: Clock) {
        let slot = self.find_create(sample, column_id);
        sample.add_updates(column_id, slot, delta);
        let importance = sample.accum_update_importance(column_id, delta);
        self.touch(clock, importance);
    }

    /// Merge `column_ids.len()` deltas laid out back to back in `deltas`
    pub fn batch_inc(
        &mut self,
        sample: &dyn Row,
        column_ids: &[ColumnId],
        deltas: &[u8],
        clock: Clock,
    ) {
        let mut importance = 0.0;
        for (col, delta) in column_ids.iter().zip(deltas.chunks_exact(self.update_size)) {
            let slot = self.find_create(sample, *col);
            sample.add_updates(*col, slot, delta);
            importance += sample.accum_update_importance(*col, delta);
        }
        self.touch(clock, importance);
    }

    /// Merge `num_updates` deltas for consecutive columns from `index_st`
    pub fn dense_batch_inc(
        &mut self,
        sample: &dyn Row,
        deltas: &[u8],
        index_st: usize,
        num_updates: usize,
        clock: Clock,
    ) {
        let mut importance = 0.0;
        for (i, delta) in deltas
            .chunks_exact(self.update_size)
            .take(num_updates)
            .enumerate()
        {
            let col = (index_st + i) as ColumnId;
            let slot = self.find_create(sample, col);
            sample.add_updates(col, slot, delta);
            importance += sample.accum_update_importance(col, delta);
        }
        self.touch(clock, importance);
    }

    /// `(column, delta)` pairs in ascending column order
    pub fn iter(&self) -> Box<dyn Iterator<Item = (ColumnId, &[u8])> + '_> {
        match &self.payload {
            Payload::Sparse(map) => Box::new(map.iter().map(|(c, u)| (*c, u.as_slice()))),
            Payload::Dense { updates, .. } => Box::new(
                updates
                    .chunks_exact(self.update_size)
                    .enumerate()
                    .map(|(c, u)| (c as ColumnId, u)),
            ),
        }
    }

    /// Number of stored column slots
    pub fn len(&self) -> usize {
        match &self.payload {
            Payload::Sparse(map) => map.len(),
            Payload::Dense { capacity, .. } => *capacity,
        }
    }

    /// Whether no slot holds a nonzero delta
    pub fn is_empty(&self, sample: &dyn Row) -> bool {
        self.nonzero_len(sample) == 0
    }

    fn nonzero_len(&self, sample: &dyn Row) -> usize {
        self.iter()
            .filter(|(_, u)| !sample.check_zero_update(u))
            .count()
    }

    /// Drop zero deltas from a sparse payload and count what is left
    pub fn clear_zeros_and_get_nonzero_size(&mut self, sample: &dyn Row) -> usize {
        if let Payload::Sparse(map) = &mut self.payload {
            map.retain(|_, u| !sample.check_zero_update(u));
            return map.len();
        }
        self.nonzero_len(sample)
    }

    /// Zero every delta and drop the metadata
    pub fn reset(&mut self, sample: &dyn Row) {
        match &mut self.payload {
            Payload::Sparse(map) => map.clear(),
            Payload::Dense { updates, .. } => {
                for (col, chunk) in updates.chunks_exact_mut(self.update_size).enumerate() {
                    sample.init_update(col as ColumnId, chunk);
                }
            }
        }
        self.meta = RowOpLogMeta::default();
    }

    /// Bytes `serialize_sparse` appends
    pub fn sparse_serialized_size(&self, sample: &dyn Row) -> usize {
        4 + self.nonzero_len(sample) * (4 + self.update_size)
    }

    /// Append the sparse encoding of the nonzero deltas
    pub fn serialize_sparse(&self, sample: &dyn Row, out: &mut Vec<u8>) -> usize {
        let start = out.len();
        let nonzero: Vec<_> = self
            .iter()
            .filter(|(_, u)| !sample.check_zero_update(u))
            .collect();
        write_i32(out, nonzero.len() as i32);
        for (col, _) in &nonzero {
            write_i32(out, *col);
        }
        for (_, update) in &nonzero {
            out.extend_from_slice(update);
        }
        out.len() - start
    }

    /// Bytes `serialize_dense` appends
    pub fn dense_serialized_size(&self) -> usize {
        let trailer = match self.kind {
            OpLogKind::Versioned { .. } => VERSION_TRAILER_SIZE,
            OpLogKind::Plain => 0,
        };
        4 + self.len() * self.update_size + trailer
    }

    /// Append the dense encoding
    ///
    /// # Panics
    ///
    /// Panics on a sparse payload; table validation rejects that pairing.
    pub fn serialize_dense(&self, out: &mut Vec<u8>) -> usize {
        let start = out.len();
        let (updates, capacity) = match &self.payload {
            Payload::Dense { updates, capacity } => (updates, *capacity),
            Payload::Sparse(_) => panic!("dense serialization of a sparse row oplog"),
        };
        write_i32(out, capacity as i32);
        out.extend_from_slice(updates);
        if let OpLogKind::Versioned {
            version,
            end_of_version,
        } = self.kind
        {
            // Vec<u8> writes are infallible.
            let _ = out.write_u64::<LittleEndian>(version);
            out.push(u8::from(end_of_version));
        }
        out.len() - start
    }
}

fn write_i32(out: &mut Vec<u8>, value: i32) {
    let _ = out.write_i32::<LittleEndian>(value);
}

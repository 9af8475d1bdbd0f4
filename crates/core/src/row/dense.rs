//! Fixed-capacity dense row

use super::{add_update_bytes, init_update_bytes, subtract_update_bytes, Element, Row};
use crate::error::{CoreError, Result};
use crate::types::{ColumnId, RowTypeId};

/// Dense row: one element per column, serialized as a raw little-endian array
///
/// Column ids index directly into the value array. Callers validate ids with
/// `check_column`; an update that still misses the array is dropped.
#[derive(Debug, Clone)]
pub struct DenseRow<E: Element> {
    row_type: RowTypeId,
    data: Vec<E>,
}

impl<E: Element> DenseRow<E> {
    /// Empty row tagged with `row_type`
    pub fn new(row_type: RowTypeId) -> Self {
        Self {
            row_type,
            data: Vec::new(),
        }
    }

    /// Row of `capacity` zeros
    pub fn with_capacity(row_type: RowTypeId, capacity: usize) -> Self {
        Self {
            row_type,
            data: vec![E::default(); capacity],
        }
    }

    /// Typed read access
    pub fn get(&self, column_id: ColumnId) -> Option<E> {
        let index = usize::try_from(column_id).ok()?;
        self.data.get(index).copied()
    }

    fn slot(&mut self, column_id: ColumnId) -> Option<&mut E> {
        let index = usize::try_from(column_id).ok()?;
        self.data.get_mut(index)
    }

    /// Typed view of every column
    pub fn values(&self) -> &[E] {
        &self.data
    }
}

impl<E: Element> Row for DenseRow<E> {
    fn row_type(&self) -> RowTypeId {
        self.row_type
    }

    fn init(&mut self, capacity: usize) {
        self.data.clear();
        self.data.resize(capacity, E::default());
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }

    fn boxed_clone(&self) -> Box<dyn Row> {
        Box::new(self.clone())
    }

    fn update_size(&self) -> usize {
        E::SIZE
    }

    fn serialized_size(&self) -> usize {
        self.data.len() * E::SIZE
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        let start = out.len();
        out.resize(start + self.serialized_size(), 0);
        for (chunk, v) in out[start..].chunks_exact_mut(E::SIZE).zip(&self.data) {
            v.write_le(chunk);
        }
    }

    fn deserialize(&mut self, data: &[u8]) -> Result<()> {
        if data.len() % E::SIZE != 0 {
            return Err(CoreError::MalformedRow {
                kind: "dense",
                len: data.len(),
                reason: "length is not a multiple of the element size",
            });
        }
        self.data = data.chunks_exact(E::SIZE).map(E::read_le).collect();
        Ok(())
    }

    fn check_column(&self, column_id: ColumnId, capacity: usize) -> Result<()> {
        match usize::try_from(column_id) {
            Ok(index) if index < capacity => Ok(()),
            _ => Err(CoreError::ColumnOutOfRange {
                column_id: i64::from(column_id),
                capacity,
            }),
        }
    }

    fn apply_inc(&mut self, column_id: ColumnId, update: &[u8]) {
        if let Some(slot) = self.slot(column_id) {
            *slot = slot.plus(E::read_le(update));
        }
    }

    fn apply_batch_inc_get_importance(&mut self, column_ids: &[ColumnId], updates: &[u8]) -> f64 {
        let mut importance = 0.0;
        for (col, update) in column_ids.iter().zip(updates.chunks_exact(E::SIZE)) {
            let delta = E::read_le(update);
            if let Some(slot) = self.slot(*col) {
                *slot = slot.plus(delta);
                importance += delta.magnitude();
            }
        }
        importance
    }

    fn apply_dense_batch_inc_get_importance(
        &mut self,
        updates: &[u8],
        index_st: usize,
        num_updates: usize,
    ) -> f64 {
        let mut importance = 0.0;
        let end = index_st.saturating_add(num_updates).min(self.data.len());
        let Some(targets) = self.data.get_mut(index_st..end) else {
            return 0.0;
        };
        for (slot, update) in targets.iter_mut().zip(updates.chunks_exact(E::SIZE)) {
            let delta = E::read_le(update);
            *slot = slot.plus(delta);
            importance += delta.magnitude();
        }
        importance
    }

    fn add_updates(&self, _column_id: ColumnId, update1: &mut [u8], update2: &[u8]) {
        add_update_bytes::<E>(update1, update2);
    }

    fn subtract_updates(&self, _column_id: ColumnId, update1: &mut [u8], update2: &[u8]) {
        subtract_update_bytes::<E>(update1, update2);
    }

    fn init_update(&self, _column_id: ColumnId, zero: &mut [u8]) {
        init_update_bytes::<E>(zero);
    }

    fn check_zero_update(&self, update: &[u8]) -> bool {
        E::read_le(update).is_zero()
    }

    fn accum_update_importance(&self, _column_id: ColumnId, update: &[u8]) -> f64 {
        E::read_le(update).magnitude()
    }

    fn value_f64(&self, column_id: ColumnId) -> f64 {
        self.data
            .get(column_id as usize)
            .map(|v| v.to_f64())
            .unwrap_or(0.0)
    }

    fn num_entries(&self) -> usize {
        self.data.len()
    }
}

//! Sparse row stored as a sorted vector of entries

use super::sparse::{pair_size, read_pairs, write_pairs};
use super::{add_update_bytes, init_update_bytes, subtract_update_bytes, Element, Row};
use crate::error::Result;
use crate::types::{ColumnId, RowTypeId};

/// Sparse row with contiguous `(column, value)` storage
///
/// Cheaper to serialize and scan than a tree map for small rows; inserts are
/// O(n). Same wire layout as `SparseRow`.
#[derive(Debug, Clone)]
pub struct SortedVectorMapRow<E: Element> {
    row_type: RowTypeId,
    capacity: usize,
    entries: Vec<(ColumnId, E)>,
}

impl<E: Element> SortedVectorMapRow<E> {
    /// Empty row tagged with `row_type`
    pub fn new(row_type: RowTypeId) -> Self {
        Self {
            row_type,
            capacity: 0,
            entries: Vec::new(),
        }
    }

    /// Typed read, zero when absent
    pub fn get(&self, column_id: ColumnId) -> E {
        match self.entries.binary_search_by_key(&column_id, |(c, _)| *c) {
            Ok(idx) => self.entries[idx].1,
            Err(_) => E::default(),
        }
    }

    /// Stored entries in column order
    pub fn entries(&self) -> &[(ColumnId, E)] {
        &self.entries
    }

    fn add_delta(&mut self, column_id: ColumnId, delta: E) {
        match self.entries.binary_search_by_key(&column_id, |(c, _)| *c) {
            Ok(idx) => {
                let sum = self.entries[idx].1.plus(delta);
                if sum.is_zero() {
                    self.entries.remove(idx);
                } else {
                    self.entries[idx].1 = sum;
                }
            }
            Err(idx) => {
                if !delta.is_zero() {
                    self.entries.insert(idx, (column_id, delta));
                }
            }
        }
    }
}

impl<E: Element> Row for SortedVectorMapRow<E> {
    fn row_type(&self) -> RowTypeId {
        self.row_type
    }

    fn init(&mut self, capacity: usize) {
        self.capacity = capacity;
        self.entries.clear();
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn boxed_clone(&self) -> Box<dyn Row> {
        Box::new(self.clone())
    }

    fn update_size(&self) -> usize {
        E::SIZE
    }

    fn serialized_size(&self) -> usize {
        self.entries.len() * pair_size::<E>()
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        write_pairs(out, self.entries.iter().copied());
    }

    fn deserialize(&mut self, data: &[u8]) -> Result<()> {
        let mut entries: Vec<(ColumnId, E)> = read_pairs::<E>("sorted-vector-map", data)?
            .filter(|(_, v)| !v.is_zero())
            .collect();
        entries.sort_by_key(|(c, _)| *c);
        entries.dedup_by_key(|(c, _)| *c);
        self.entries = entries;
        Ok(())
    }

    fn apply_inc(&mut self, column_id: ColumnId, update: &[u8]) {
        self.add_delta(column_id, E::read_le(update));
    }

    fn apply_batch_inc_get_importance(&mut self, column_ids: &[ColumnId], updates: &[u8]) -> f64 {
        let mut importance = 0.0;
        for (col, update) in column_ids.iter().zip(updates.chunks_exact(E::SIZE)) {
            let delta = E::read_le(update);
            self.add_delta(*col, delta);
            importance += delta.magnitude();
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
        for (i, update) in updates.chunks_exact(E::SIZE).take(num_updates).enumerate() {
            let delta = E::read_le(update);
            self.add_delta((index_st + i) as ColumnId, delta);
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
        self.get(column_id).to_f64()
    }

    fn num_entries(&self) -> usize {
        self.entries.len()
    }
}

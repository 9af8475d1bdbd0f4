//! Ordered sparse row

use super::{add_update_bytes, init_update_bytes, subtract_update_bytes, Element, Row};
use crate::error::{CoreError, Result};
use crate::types::{ColumnId, RowTypeId};
use byteorder::{ByteOrder, LittleEndian};
use std::collections::BTreeMap;

/// Sparse row backed by an ordered map; zero-valued columns are dropped
///
/// Serialized as `(col:i32, value)` pairs in ascending column order.
#[derive(Debug, Clone)]
pub struct SparseRow<E: Element> {
    row_type: RowTypeId,
    capacity: usize,
    entries: BTreeMap<ColumnId, E>,
}

impl<E: Element> SparseRow<E> {
    /// Empty row tagged with `row_type`
    pub fn new(row_type: RowTypeId) -> Self {
        Self {
            row_type,
            capacity: 0,
            entries: BTreeMap::new(),
        }
    }

    /// Typed read, zero when absent
    pub fn get(&self, column_id: ColumnId) -> E {
        self.entries.get(&column_id).copied().unwrap_or_default()
    }

    /// Stored entries in column order
    pub fn iter(&self) -> impl Iterator<Item = (ColumnId, E)> + '_ {
        self.entries.iter().map(|(c, v)| (*c, *v))
    }

    fn add_delta(&mut self, column_id: ColumnId, delta: E) {
        let sum = self.get(column_id).plus(delta);
        if sum.is_zero() {
            self.entries.remove(&column_id);
        } else {
            self.entries.insert(column_id, sum);
        }
    }
}

pub(super) fn pair_size<E: Element>() -> usize {
    std::mem::size_of::<ColumnId>() + E::SIZE
}

pub(super) fn write_pairs<E: Element>(
    out: &mut Vec<u8>,
    pairs: impl ExactSizeIterator<Item = (ColumnId, E)>,
) {
    let start = out.len();
    out.resize(start + pairs.len() * pair_size::<E>(), 0);
    for (chunk, (col, v)) in out[start..].chunks_exact_mut(pair_size::<E>()).zip(pairs) {
        LittleEndian::write_i32(&mut chunk[..4], col);
        v.write_le(&mut chunk[4..]);
    }
}

pub(super) fn read_pairs<'a, E: Element>(
    kind: &'static str,
    data: &'a [u8],
) -> Result<impl Iterator<Item = (ColumnId, E)> + 'a> {
    if data.len() % pair_size::<E>() != 0 {
        return Err(CoreError::MalformedRow {
            kind,
            len: data.len(),
            reason: "length is not a multiple of the entry size",
        });
    }
    Ok(data
        .chunks_exact(pair_size::<E>())
        .map(|chunk| (LittleEndian::read_i32(&chunk[..4]), E::read_le(&chunk[4..]))))
}

impl<E: Element> Row for SparseRow<E> {
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
        write_pairs(out, self.entries.iter().map(|(c, v)| (*c, *v)));
    }

    fn deserialize(&mut self, data: &[u8]) -> Result<()> {
        let entries = read_pairs::<E>("sparse", data)?
            .filter(|(_, v)| !v.is_zero())
            .collect();
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
            if delta.is_zero() {
                continue;
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{encode_updates, SPARSE_F32, SPARSE_I32};

    #[test]
    fn test_sparse_drops_zeroed_columns() {
        let mut row = SparseRow::<i32>::new(SPARSE_I32);
        row.apply_inc(10, &encode_updates(&[3i32]));
        row.apply_inc(2, &encode_updates(&[1i32]));
        assert_eq!(row.num_entries(), 2);
        row.apply_inc(10, &encode_updates(&[-3i32]));
        assert_eq!(row.num_entries(), 1);
        assert_eq!(row.get(10), 0);
    }

    #[test]
    fn test_sparse_serialize_sorted_pairs() {
        let mut row = SparseRow::<f32>::new(SPARSE_F32);
        row.apply_batch_inc(&[9, 1], &encode_updates(&[2.0f32, 1.0]));
        let mut buf = Vec::new();
        row.serialize(&mut buf);
        assert_eq!(buf.len(), 16);
        assert_eq!(LittleEndian::read_i32(&buf[0..4]), 1);
        assert_eq!(LittleEndian::read_i32(&buf[8..12]), 9);

        let mut restored = SparseRow::<f32>::new(SPARSE_F32);
        restored.deserialize(&buf).unwrap();
        assert_eq!(restored.iter().collect::<Vec<_>>(), vec![(1, 1.0), (9, 2.0)]);
    }

    #[test]
    fn test_sparse_dense_batch_skips_zero_updates() {
        let mut row = SparseRow::<f32>::new(SPARSE_F32);
        let imp = row.apply_dense_batch_inc_get_importance(
            &encode_updates(&[0.0f32, -1.5, 0.0]),
            4,
            3,
        );
        assert_eq!(imp, 1.5);
        assert_eq!(row.iter().collect::<Vec<_>>(), vec![(5, -1.5)]);
    }
}

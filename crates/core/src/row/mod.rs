//! Polymorphic numeric rows
//!
//! A row is a vector of numeric parameters addressed by column id. Every row
//! type also owns the arithmetic on its *updates*: the oplog and the server
//! never add raw bytes themselves, they call `add_updates`, `init_update`,
//! `subtract_updates` on a sample row. This keeps the oplog agnostic of the
//! element type.
//!
//! # Update encoding
//!
//! An update is `update_size()` little-endian bytes per column. Batches are
//! concatenated updates, one per column id, in column-id order of the batch.
//!
//! # Importance
//!
//! The importance of an update batch is the sum of the absolute values of its
//! deltas. Servers and bg workers use it to rank rows under a push budget.

mod dense;
mod registry;
mod sorted_vector_map;
mod sparse;

pub use dense::DenseRow;
pub use registry::{
    RowFactory, RowRegistry, DENSE_F32, DENSE_F64, DENSE_I32, ROW_TYPE_NONE, SORTED_VECTOR_MAP_F32,
    SORTED_VECTOR_MAP_I32, SPARSE_F32, SPARSE_I32,
};
pub use sorted_vector_map::SortedVectorMapRow;
pub use sparse::SparseRow;

use crate::error::{CoreError, Result};
use crate::types::{ColumnId, RowTypeId};
use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

/// Numeric element stored in a row
pub trait Element:
    Copy + Default + PartialEq + PartialOrd + fmt::Debug + Send + Sync + 'static
{
    /// Encoded width in bytes
    const SIZE: usize;

    /// Decode from exactly `SIZE` little-endian bytes
    fn read_le(bytes: &[u8]) -> Self;

    /// Encode into exactly `SIZE` bytes
    fn write_le(self, out: &mut [u8]);

    /// Accumulate `other` into `self`
    fn plus(self, other: Self) -> Self;

    /// Remove `other` from `self`
    fn minus(self, other: Self) -> Self;

    /// Absolute value, as used for importance
    fn magnitude(self) -> f64;

    /// Lossy view as `f64`
    fn to_f64(self) -> f64;

    /// Lossy conversion from `f64`
    fn from_f64(value: f64) -> Self;

    /// Whether this is the additive identity
    fn is_zero(self) -> bool {
        self == Self::default()
    }
}

macro_rules! float_element {
    ($t:ty, $read:ident, $write:ident) => {
        impl Element for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            #[inline]
            fn read_le(bytes: &[u8]) -> Self {
                LittleEndian::$read(bytes)
            }

            #[inline]
            fn write_le(self, out: &mut [u8]) {
                LittleEndian::$write(out, self)
            }

            #[inline]
            fn plus(self, other: Self) -> Self {
                self + other
            }

            #[inline]
            fn minus(self, other: Self) -> Self {
                self - other
            }

            #[inline]
            fn magnitude(self) -> f64 {
                (self as f64).abs()
            }

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(value: f64) -> Self {
                value as $t
            }
        }
    };
}

macro_rules! int_element {
    ($t:ty, $read:ident, $write:ident) => {
        impl Element for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            #[inline]
            fn read_le(bytes: &[u8]) -> Self {
                LittleEndian::$read(bytes)
            }

            #[inline]
            fn write_le(self, out: &mut [u8]) {
                LittleEndian::$write(out, self)
            }

            #[inline]
            fn plus(self, other: Self) -> Self {
                self.wrapping_add(other)
            }

            #[inline]
            fn minus(self, other: Self) -> Self {
                self.wrapping_sub(other)
            }

            #[inline]
            fn magnitude(self) -> f64 {
                (self as f64).abs()
            }

            #[inline]
            fn to_f64(self) -> f64 {
                self as f64
            }

            #[inline]
            fn from_f64(value: f64) -> Self {
                value as $t
            }
        }
    };
}

float_element!(f32, read_f32, write_f32);
float_element!(f64, read_f64, write_f64);
int_element!(i32, read_i32, write_i32);
int_element!(i64, read_i64, write_i64);

/// Encode a slice of elements into update bytes
pub fn encode_updates<E: Element>(values: &[E]) -> Vec<u8> {
    let mut out = vec![0u8; values.len() * E::SIZE];
    for (chunk, v) in out.chunks_exact_mut(E::SIZE).zip(values) {
        v.write_le(chunk);
    }
    out
}

/// A numeric row of any layout
///
/// Object safe so tables can hold `Box<dyn Row>` chosen by a wire type id.
/// Mutating methods take `&mut self`; callers synchronize through the row
/// lock owned by the cache entry or the server table.
pub trait Row: Send + Sync + fmt::Debug {
    /// Wire type id of this row family
    fn row_type(&self) -> RowTypeId;

    /// Reset to an empty row sized for `capacity` columns
    fn init(&mut self, capacity: usize);

    /// Column capacity
    fn capacity(&self) -> usize;

    /// Deep copy behind a fresh box
    fn boxed_clone(&self) -> Box<dyn Row>;

    /// Byte width of one column's update
    fn update_size(&self) -> usize;

    /// Exact number of bytes `serialize` appends
    fn serialized_size(&self) -> usize;

    /// Append the serialized row to `out`
    fn serialize(&self, out: &mut Vec<u8>);

    /// Replace contents with a serialized row
    fn deserialize(&mut self, data: &[u8]) -> Result<()>;

    /// Replace contents with fresher data pushed by a server
    fn reset_row_data(&mut self, data: &[u8]) -> Result<()> {
        self.deserialize(data)
    }

    /// Check that `column_id` fits a row of `capacity` columns
    ///
    /// Sparse layouts accept any id; dense layouts index by it.
    fn check_column(&self, _column_id: ColumnId, _capacity: usize) -> Result<()> {
        Ok(())
    }

    /// `check_column` for every id of a sparse batch
    fn check_columns(&self, column_ids: &[ColumnId], capacity: usize) -> Result<()> {
        column_ids
            .iter()
            .try_for_each(|column_id| self.check_column(*column_id, capacity))
    }

    /// `check_column` for columns `index_st..index_st + num_updates`
    fn check_dense_range(&self, index_st: usize, num_updates: usize, capacity: usize) -> Result<()> {
        if num_updates == 0 {
            return Ok(());
        }
        let last = (index_st as i64).saturating_add(num_updates as i64 - 1);
        let column_id = ColumnId::try_from(last).map_err(|_| CoreError::ColumnOutOfRange {
            column_id: last,
            capacity,
        })?;
        self.check_column(column_id, capacity)
    }

    /// Apply one column update
    fn apply_inc(&mut self, column_id: ColumnId, update: &[u8]);

    /// Apply a batch of `(column, update)` pairs and report its importance
    fn apply_batch_inc_get_importance(&mut self, column_ids: &[ColumnId], updates: &[u8]) -> f64;

    /// Apply `num_updates` consecutive column updates starting at `index_st`
    /// and report their importance
    fn apply_dense_batch_inc_get_importance(
        &mut self,
        updates: &[u8],
        index_st: usize,
        num_updates: usize,
    ) -> f64;

    /// Apply a sparse batch
    fn apply_batch_inc(&mut self, column_ids: &[ColumnId], updates: &[u8]) {
        self.apply_batch_inc_get_importance(column_ids, updates);
    }

    /// Apply a dense batch
    fn apply_dense_batch_inc(&mut self, updates: &[u8], index_st: usize, num_updates: usize) {
        self.apply_dense_batch_inc_get_importance(updates, index_st, num_updates);
    }

    /// `update1 += update2`
    fn add_updates(&self, column_id: ColumnId, update1: &mut [u8], update2: &[u8]);

    /// `update1 -= update2`
    fn subtract_updates(&self, column_id: ColumnId, update1: &mut [u8], update2: &[u8]);

    /// Write the additive identity into `zero`
    fn init_update(&self, column_id: ColumnId, zero: &mut [u8]);

    /// Whether `update` is the additive identity
    fn check_zero_update(&self, update: &[u8]) -> bool;

    /// Importance contributed by a single update
    fn accum_update_importance(&self, column_id: ColumnId, update: &[u8]) -> f64;

    /// Read a column as `f64` (missing sparse columns read as zero)
    fn value_f64(&self, column_id: ColumnId) -> f64;

    /// Number of stored entries
    fn num_entries(&self) -> usize;
}

impl Clone for Box<dyn Row> {
    fn clone(&self) -> Self {
        self.boxed_clone()
    }
}

/// Shared update arithmetic for rows generic over `E`
pub(crate) fn add_update_bytes<E: Element>(update1: &mut [u8], update2: &[u8]) {
    let sum = E::read_le(update1).plus(E::read_le(update2));
    sum.write_le(&mut update1[..E::SIZE]);
}

pub(crate) fn subtract_update_bytes<E: Element>(update1: &mut [u8], update2: &[u8]) {
    let diff = E::read_le(update1).minus(E::read_le(update2));
    diff.write_le(&mut update1[..E::SIZE]);
}

pub(crate) fn init_update_bytes<E: Element>(zero: &mut [u8]) {
    E::default().write_le(&mut zero[..E::SIZE]);
}

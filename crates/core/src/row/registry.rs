//! Injectable row factory keyed by wire type id

use super::{DenseRow, Row, SortedVectorMapRow, SparseRow};
use crate::error::{CoreError, Result};
use crate::types::RowTypeId;
use rustc_hash::FxHashMap;
use tracing::debug;

/// Placeholder for "no row type configured"
pub const ROW_TYPE_NONE: RowTypeId = -1;
/// Dense `f32` row
pub const DENSE_F32: RowTypeId = 0;
/// Dense `i32` row
pub const DENSE_I32: RowTypeId = 1;
/// Dense `f64` row
pub const DENSE_F64: RowTypeId = 2;
/// Sparse `f32` row
pub const SPARSE_F32: RowTypeId = 3;
/// Sparse `i32` row
pub const SPARSE_I32: RowTypeId = 4;
/// Sorted-vector-map `f32` row
pub const SORTED_VECTOR_MAP_F32: RowTypeId = 5;
/// Sorted-vector-map `i32` row
pub const SORTED_VECTOR_MAP_I32: RowTypeId = 6;

/// Constructor for an empty, uninitialized row
pub type RowFactory = fn() -> Box<dyn Row>;

/// Maps row type ids to constructors
///
/// Built once at startup and shared (usually behind an `Arc`) by every table.
/// There is no global registry: custom row types are added with `register`.
#[derive(Clone)]
pub struct RowRegistry {
    factories: FxHashMap<RowTypeId, RowFactory>,
}

impl RowRegistry {
    /// Registry with no row types
    pub fn empty() -> Self {
        Self {
            factories: FxHashMap::default(),
        }
    }

    /// Registry pre-populated with the built-in row types
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(DENSE_F32, || Box::new(DenseRow::<f32>::new(DENSE_F32)));
        registry.register(DENSE_I32, || Box::new(DenseRow::<i32>::new(DENSE_I32)));
        registry.register(DENSE_F64, || Box::new(DenseRow::<f64>::new(DENSE_F64)));
        registry.register(SPARSE_F32, || Box::new(SparseRow::<f32>::new(SPARSE_F32)));
        registry.register(SPARSE_I32, || Box::new(SparseRow::<i32>::new(SPARSE_I32)));
        registry.register(SORTED_VECTOR_MAP_F32, || {
            Box::new(SortedVectorMapRow::<f32>::new(SORTED_VECTOR_MAP_F32))
        });
        registry.register(SORTED_VECTOR_MAP_I32, || {
            Box::new(SortedVectorMapRow::<i32>::new(SORTED_VECTOR_MAP_I32))
        });
        registry
    }

    /// Add or replace a row type, returning the previous constructor
    pub fn register(&mut self, row_type: RowTypeId, factory: RowFactory) -> Option<RowFactory> {
        let previous = self.factories.insert(row_type, factory);
        if previous.is_some() {
            debug!(row_type, "row type replaced");
        }
        previous
    }

    /// Whether `row_type` is known
    pub fn contains(&self, row_type: RowTypeId) -> bool {
        self.factories.contains_key(&row_type)
    }

    /// Construct an uninitialized row
    pub fn create(&self, row_type: RowTypeId) -> Result<Box<dyn Row>> {
        self.factories
            .get(&row_type)
            .map(|factory| factory())
            .ok_or(CoreError::UnknownRowType(row_type))
    }

    /// Construct a row initialized to `capacity` columns
    pub fn create_initialized(&self, row_type: RowTypeId, capacity: usize) -> Result<Box<dyn Row>> {
        let mut row = self.create(row_type)?;
        row.init(capacity);
        Ok(row)
    }
}

impl Default for RowRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl std::fmt::Debug for RowRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.factories.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("RowRegistry").field("row_types", &ids).finish()
    }
}

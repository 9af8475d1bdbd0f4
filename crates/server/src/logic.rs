//! Apply strategies and pluggable server table logic
//!
//! `ApplyMode` is chosen once per table from its oplog layout and the
//! process-wide push policy. A table may also name a `ServerTableLogic` by
//! id; the logic then owns how oplogs land in rows (an optimizer state
//! update, for example) and is told about row creation and pushes.

use crate::error::{Result, ServerError};
use crate::server_row::{RowVersion, ServerRow};
use rustc_hash::FxHashMap;
use sspps_core::{RowId, TableInfo};
use sspps_oplog::RowUpdates;
use std::fmt;

/// How a table applies incoming row oplogs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Sparse `(column, update)` batches
    SparseBatch,
    /// Sparse batches, accumulating row importance
    SparseBatchImportance,
    /// Dense updates for columns `0..n`
    DenseBatch,
    /// Dense updates, accumulating row importance
    DenseBatchImportance,
}

impl ApplyMode {
    /// Mode for a table with the given oplog encoding
    pub fn select(dense_serialized: bool, accumulate_importance: bool) -> Self {
        match (dense_serialized, accumulate_importance) {
            (false, false) => ApplyMode::SparseBatch,
            (false, true) => ApplyMode::SparseBatchImportance,
            (true, false) => ApplyMode::DenseBatch,
            (true, true) => ApplyMode::DenseBatchImportance,
        }
    }

    /// Whether pushes must reset row importance
    pub fn accumulates_importance(&self) -> bool {
        matches!(
            self,
            ApplyMode::SparseBatchImportance | ApplyMode::DenseBatchImportance
        )
    }

    /// Apply `updates` to `row`
    ///
    /// # Panics
    ///
    /// If the update encoding does not match the mode, which means the table
    /// was built for a different oplog layout.
    pub fn apply(&self, updates: &RowUpdates<'_>, row: &mut ServerRow) {
        match (self, updates) {
            (ApplyMode::SparseBatch, RowUpdates::Sparse { column_ids, updates }) => {
                row.apply_batch_inc(column_ids, updates)
            }
            (ApplyMode::SparseBatchImportance, RowUpdates::Sparse { column_ids, updates }) => {
                row.apply_batch_inc_accum_importance(column_ids, updates)
            }
            (
                ApplyMode::DenseBatch,
                RowUpdates::Dense {
                    updates,
                    num_updates,
                    ..
                },
            ) => row.apply_dense_batch_inc(updates, *num_updates),
            (
                ApplyMode::DenseBatchImportance,
                RowUpdates::Dense {
                    updates,
                    num_updates,
                    ..
                },
            ) => row.apply_dense_batch_inc_accum_importance(updates, *num_updates),
            (mode, _) => panic!("{:?} table received a mismatched oplog encoding", mode),
        }
    }
}

/// Custom server-side behavior for a table
pub trait ServerTableLogic: Send + fmt::Debug {
    /// Called once when the table is created
    fn init(&mut self, info: &TableInfo, apply: ApplyMode);

    /// A row was created by a row request or an oplog (not by a snapshot
    /// restore)
    fn server_row_created(&mut self, row_id: RowId, row: &mut ServerRow);

    /// Apply an oplog in place of the table's `ApplyMode`
    fn apply_row_oplog(
        &mut self,
        row_id: RowId,
        updates: &RowUpdates<'_>,
        row: &mut ServerRow,
        version: RowVersion,
    );

    /// A row was pushed to `num_clients` clients
    fn server_row_sent(&mut self, row_id: RowId, version: Option<RowVersion>, num_clients: usize);

    /// Whether idle-time partial pushes may run
    fn allow_send(&self) -> bool {
        true
    }
}

/// Constructor for a server table logic
pub type LogicFactory = fn() -> Box<dyn ServerTableLogic>;

/// Maps `TableInfo::server_table_logic` ids to constructors
#[derive(Clone, Default)]
pub struct ServerTableLogicRegistry {
    factories: FxHashMap<i32, LogicFactory>,
}

impl ServerTableLogicRegistry {
    /// Registry with no logic types
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a logic type
    pub fn register(&mut self, logic_id: i32, factory: LogicFactory) -> Option<LogicFactory> {
        self.factories.insert(logic_id, factory)
    }

    /// Whether `logic_id` is known
    pub fn contains(&self, logic_id: i32) -> bool {
        self.factories.contains_key(&logic_id)
    }

    /// Construct the logic registered under `logic_id`
    pub fn create(&self, logic_id: i32) -> Result<Box<dyn ServerTableLogic>> {
        self.factories
            .get(&logic_id)
            .map(|factory| factory())
            .ok_or(ServerError::UnknownLogic(logic_id))
    }
}

impl fmt::Debug for ServerTableLogicRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<_> = self.factories.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("ServerTableLogicRegistry")
            .field("logic_ids", &ids)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sspps_core::{encode_updates, DenseRow, DENSE_I32};

    #[derive(Debug, Default)]
    struct Noop;

    impl ServerTableLogic for Noop {
        fn init(&mut self, _info: &TableInfo, _apply: ApplyMode) {}
        fn server_row_created(&mut self, _row_id: RowId, _row: &mut ServerRow) {}
        fn apply_row_oplog(
            &mut self,
            _row_id: RowId,
            _updates: &RowUpdates<'_>,
            _row: &mut ServerRow,
            _version: RowVersion,
        ) {
        }
        fn server_row_sent(&mut self, _row_id: RowId, _v: Option<RowVersion>, _n: usize) {}
    }

    #[test]
    fn test_mode_selection() {
        assert_eq!(ApplyMode::select(false, false), ApplyMode::SparseBatch);
        assert_eq!(ApplyMode::select(true, true), ApplyMode::DenseBatchImportance);
        assert!(ApplyMode::select(false, true).accumulates_importance());
        assert!(!ApplyMode::select(true, false).accumulates_importance());
    }

    #[test]
    fn test_dense_apply() {
        let mut row = ServerRow::new(Box::new(DenseRow::<i32>::with_capacity(DENSE_I32, 3)), false);
        let bytes = encode_updates(&[1i32, -2, 3]);
        let updates = RowUpdates::Dense {
            updates: &bytes,
            num_updates: 3,
            version: None,
        };
        ApplyMode::DenseBatchImportance.apply(&updates, &mut row);
        assert_eq!(row.importance(), 6.0);
        assert_eq!(row.row().value_f64(1), -2.0);
    }

    #[test]
    #[should_panic(expected = "mismatched oplog encoding")]
    fn test_mismatched_encoding_panics() {
        let mut row = ServerRow::new(Box::new(DenseRow::<i32>::with_capacity(DENSE_I32, 3)), false);
        let bytes = encode_updates(&[1i32]);
        let updates = RowUpdates::Sparse {
            column_ids: vec![0],
            updates: &bytes,
        };
        ApplyMode::DenseBatch.apply(&updates, &mut row);
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = ServerTableLogicRegistry::new();
        assert!(matches!(registry.create(3), Err(ServerError::UnknownLogic(3))));
        registry.register(3, || Box::new(Noop));
        assert!(registry.contains(3));
        assert!(registry.create(3).is_ok());
    }
}

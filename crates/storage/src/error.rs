//! Error types for the process storage

use sspps_core::RowId;
use thiserror::Error;

/// Errors returned by `ProcessStorage`
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Every eviction attempt hit a row that is still referenced
    #[error("could not evict a row to make room for {row_id} after {attempts} attempts (capacity {capacity})")]
    EvictionExhausted {
        /// Row that was being inserted
        row_id: RowId,
        /// Eviction attempts made
        attempts: usize,
        /// Cache capacity
        capacity: usize,
    },
}

/// Result alias for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

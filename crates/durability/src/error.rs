//! Snapshot errors

use sspps_core::RowId;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while writing or reading a snapshot
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// Underlying file operation failed
    #[error("snapshot I/O on {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Cause
        #[source]
        source: io::Error,
    },

    /// Row id collides with the block terminator
    #[error("row id {0} is reserved in snapshot files")]
    ReservedRowId(RowId),

    /// The file ended inside a record
    #[error("snapshot {path} truncated inside row {row_id}")]
    Truncated {
        /// File involved
        path: PathBuf,
        /// Row being read
        row_id: RowId,
    },

    /// A restored row could not be decoded
    #[error("snapshot row {row_id} is malformed: {reason}")]
    MalformedRow {
        /// Row id
        row_id: RowId,
        /// Decoder message
        reason: String,
    },
}

impl SnapshotError {
    /// Wrap an I/O error with its file
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SnapshotError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the file is missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, SnapshotError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

/// Result alias for snapshot operations
pub type Result<T> = std::result::Result<T, SnapshotError>;

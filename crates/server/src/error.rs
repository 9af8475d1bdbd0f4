//! Server error types

use sspps_core::{CoreError, TableId, ThreadId};
use sspps_durability::SnapshotError;
use sspps_oplog::OpLogError;
use sspps_wire::WireError;
use thiserror::Error;

/// Errors surfaced by server tables and server threads
#[derive(Debug, Error)]
pub enum ServerError {
    /// Message names a table this server never created
    #[error("unknown table {0}")]
    UnknownTable(TableId),

    /// `CreateTable` for an existing table
    #[error("table {0} already exists")]
    TableExists(TableId),

    /// No server table logic registered under this id
    #[error("unknown server table logic {0}")]
    UnknownLogic(i32),

    /// Oplog message version skipped ahead
    #[error("oplog version gap from bg {bg_id}: expected {expected}, got {got}")]
    VersionGap {
        /// Sending bg worker
        bg_id: ThreadId,
        /// Next version the server expected
        expected: u32,
        /// Version received
        got: u32,
    },

    /// Message from a thread that never connected
    #[error("message from unknown bg worker {0}")]
    UnknownBg(ThreadId),

    /// Row or configuration error
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Malformed oplog payload
    #[error(transparent)]
    OpLog(#[from] OpLogError),

    /// Transport or framing error
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Snapshot I/O error
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

impl ServerError {
    /// Whether the peer sent something this server cannot accept
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            ServerError::UnknownTable(_)
                | ServerError::VersionGap { .. }
                | ServerError::UnknownBg(_)
                | ServerError::OpLog(_)
        ) || matches!(self, ServerError::Wire(e) if e.is_malformed())
            || matches!(self, ServerError::Core(e) if e.is_column_out_of_range() || e.is_malformed_row())
    }

    /// Whether the error came from the transport
    pub fn is_transport(&self) -> bool {
        matches!(self, ServerError::Wire(e) if e.is_transport())
    }
}

/// Result alias for server operations
pub type Result<T> = std::result::Result<T, ServerError>;

//! Client error types

use sspps_core::{Clock, CoreError, TableId, ThreadId};
use sspps_oplog::OpLogError;
use sspps_storage::StorageError;
use sspps_wire::WireError;
use thiserror::Error;

/// Errors surfaced by client tables and bg workers
#[derive(Debug, Error)]
pub enum ClientError {
    /// Message names a table this client never created
    #[error("unknown table {0}")]
    UnknownTable(TableId),

    /// A server answered the handshake with something else
    #[error("unexpected {msg} from {sender} during handshake")]
    Handshake {
        /// Thread that sent the message
        sender: ThreadId,
        /// Message type received
        msg: String,
    },

    /// Element type width differs from the table's update size
    #[error("table {table_id} takes {expected}-byte elements, got {got} bytes")]
    ElementSize {
        /// Table updated
        table_id: TableId,
        /// Update size of the table's rows
        expected: usize,
        /// Width of the element supplied
        got: usize,
    },

    /// Update bytes do not match the number of columns updated
    #[error("table {table_id} expected {expected} update bytes, got {got}")]
    UpdateLength {
        /// Table updated
        table_id: TableId,
        /// Bytes the columns require
        expected: usize,
        /// Bytes supplied
        got: usize,
    },

    /// A bg worker flushed a clock it had already flushed
    #[error("bg {bg_id} already flushed clock {clock_has_pushed} (client clock {client_clock})")]
    ClockReplayed {
        /// Bg worker
        bg_id: ThreadId,
        /// Last flushed clock
        clock_has_pushed: Clock,
        /// Clock being flushed
        client_clock: Clock,
    },

    /// Row cache could not make room
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Row or configuration error
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Malformed oplog payload
    #[error(transparent)]
    OpLog(#[from] OpLogError),

    /// Transport or framing error
    #[error(transparent)]
    Wire(#[from] WireError),
}

impl ClientError {
    /// Whether a peer sent something this client cannot accept
    pub fn is_protocol(&self) -> bool {
        match self {
            ClientError::UnknownTable(_) | ClientError::Handshake { .. } => true,
            ClientError::OpLog(_) => true,
            ClientError::Wire(e) => e.is_malformed(),
            _ => false,
        }
    }

    /// Whether an application update was rejected before buffering
    pub fn is_invalid_update(&self) -> bool {
        match self {
            ClientError::ElementSize { .. } | ClientError::UpdateLength { .. } => true,
            ClientError::Core(e) => e.is_column_out_of_range(),
            _ => false,
        }
    }

    /// Whether the transport failed
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Wire(e) if e.is_transport())
    }

    /// Whether the row cache is full of pinned rows
    pub fn is_cache_exhausted(&self) -> bool {
        matches!(self, ClientError::Storage(StorageError::EvictionExhausted { .. }))
    }
}

/// Result alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(ClientError::UnknownTable(3).is_protocol());
        let full = ClientError::from(StorageError::EvictionExhausted {
            row_id: 1,
            attempts: 4,
            capacity: 2,
        });
        assert!(full.is_cache_exhausted());
        assert!(!full.is_protocol());
        assert!(!full.is_transport());
        assert_eq!(
            ClientError::UnknownTable(3).to_string(),
            "unknown table 3"
        );
        let wide = ClientError::ElementSize {
            table_id: 0,
            expected: 4,
            got: 8,
        };
        assert!(wide.is_invalid_update());
        assert!(!wide.is_protocol());
    }
}

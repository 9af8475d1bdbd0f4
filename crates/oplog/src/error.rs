//! Oplog decoding errors

use sspps_core::TableId;
use thiserror::Error;

/// Errors raised while parsing a serialized oplog payload
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OpLogError {
    /// The payload ended before a field could be read
    #[error("oplog payload truncated reading {field}: need {need} bytes, have {have}")]
    Truncated {
        /// Field being read
        field: &'static str,
        /// Bytes required
        need: usize,
        /// Bytes remaining
        have: usize,
    },

    /// A count field was negative
    #[error("negative {field} in oplog payload: {value}")]
    NegativeCount {
        /// Field being read
        field: &'static str,
        /// Decoded value
        value: i32,
    },

    /// The payload references a table the receiver does not host
    #[error("oplog payload references unknown table {0}")]
    UnknownTable(TableId),

    /// The encoded update width disagrees with the table's row type
    #[error("table {table_id} update size mismatch: payload {payload}, table {table}")]
    UpdateSizeMismatch {
        /// Table id
        table_id: TableId,
        /// Width in the payload
        payload: usize,
        /// Width of the table's rows
        table: usize,
    },
}

impl OpLogError {
    /// Whether the payload was cut short
    pub fn is_truncated(&self) -> bool {
        matches!(self, OpLogError::Truncated { .. })
    }
}

/// Result alias for oplog decoding
pub type Result<T> = std::result::Result<T, OpLogError>;

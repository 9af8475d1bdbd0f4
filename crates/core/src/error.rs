//! Error types for configuration and row decoding

use crate::types::RowTypeId;
use thiserror::Error;

/// Errors raised by the core crate
#[derive(Debug, Error)]
pub enum CoreError {
    /// No factory is registered for the requested row type
    #[error("unknown row type: {0}")]
    UnknownRowType(RowTypeId),

    /// Serialized row bytes do not match the row layout
    #[error("malformed {kind} row: {reason} ({len} bytes)")]
    MalformedRow {
        /// Row family that failed to decode
        kind: &'static str,
        /// Length of the rejected buffer
        len: usize,
        /// What was wrong with it
        reason: &'static str,
    },

    /// Column id outside a dense row
    #[error("column {column_id} out of range for {capacity} columns")]
    ColumnOutOfRange {
        /// Rejected column id
        column_id: i64,
        /// Columns the row holds
        capacity: usize,
    },

    /// Configuration value out of range
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// TOML parse error
    #[error("config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Binary encoding error for configuration blobs
    #[error("encoding error: {0}")]
    Encoding(#[from] bincode::Error),

    /// I/O error while loading configuration
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    /// Whether the error comes from decoding a row buffer
    pub fn is_malformed_row(&self) -> bool {
        matches!(self, CoreError::MalformedRow { .. })
    }

    /// Whether an update addressed a column the row cannot hold
    pub fn is_column_out_of_range(&self) -> bool {
        matches!(self, CoreError::ColumnOutOfRange { .. })
    }

    /// Whether the error comes from configuration loading or validation
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidConfig(_) | CoreError::Toml(_) | CoreError::Io(_)
        )
    }
}

/// Result alias for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

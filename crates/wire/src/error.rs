//! Wire errors

use sspps_core::{CoreError, ThreadId};
use std::io;
use thiserror::Error;

/// Errors raised while framing, parsing or transporting messages
#[derive(Debug, Error)]
pub enum WireError {
    /// A field could not be read
    #[error("failed to decode {0}: {1}")]
    Decode(&'static str, #[source] io::Error),

    /// A field could not be written
    #[error("failed to encode {0}: {1}")]
    Encode(&'static str, #[source] io::Error),

    /// Unrecognized message tag
    #[error("unknown message type {0}")]
    UnknownMsgType(i32),

    /// Bytes left over after the message was parsed
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),

    /// Embedded table configuration failed to (de)serialize
    #[error("table info blob: {0}")]
    TableInfo(#[from] CoreError),

    /// No endpoint is registered for the destination
    #[error("no endpoint registered for thread {0}")]
    UnknownDestination(ThreadId),

    /// The peer endpoint was dropped
    #[error("endpoint {0} disconnected")]
    Disconnected(ThreadId),
}

impl WireError {
    /// Whether the frame itself was malformed
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            WireError::Decode(..) | WireError::UnknownMsgType(_) | WireError::TrailingBytes(_)
        )
    }

    /// Whether the transport could not deliver
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            WireError::UnknownDestination(_) | WireError::Disconnected(_)
        )
    }
}

/// Result alias for wire operations
pub type Result<T> = std::result::Result<T, WireError>;

//! Unified error type for sspps
//!
//! Wraps the error of every member crate so code driving a whole cluster
//! can use a single `Result`.

use sspps_client::ClientError;
use sspps_core::{CoreError, TableId};
use sspps_durability::SnapshotError;
use sspps_oplog::OpLogError;
use sspps_server::ServerError;
use sspps_storage::StorageError;
use sspps_wire::WireError;
use thiserror::Error;

/// All sspps errors
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration or row error
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Row cache error
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Malformed oplog payload
    #[error(transparent)]
    OpLog(#[from] OpLogError),

    /// Transport or framing error
    #[error(transparent)]
    Wire(#[from] WireError),

    /// Snapshot I/O error
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// Server thread error
    #[error(transparent)]
    Server(#[from] ServerError),

    /// Bg worker or client table error
    #[error(transparent)]
    Client(#[from] ClientError),

    /// Table was never configured on this cluster
    #[error("unknown table {0}")]
    UnknownTable(TableId),

    /// Client id outside the configured range
    #[error("unknown client {0}")]
    UnknownClient(i32),

    /// Spawning a thread failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A cluster thread panicked
    #[error("thread {0} panicked")]
    ThreadPanicked(String),

    /// A cluster thread exited before startup completed
    #[error("thread {0} exited during startup")]
    StartupFailed(String),
}

/// Result type for sspps operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a peer sent something that breaks the protocol
    pub fn is_protocol(&self) -> bool {
        match self {
            Error::Server(e) => e.is_protocol(),
            Error::Client(e) => e.is_protocol(),
            Error::OpLog(_) => true,
            Error::Wire(e) => e.is_malformed(),
            _ => false,
        }
    }

    /// Whether the transport failed
    pub fn is_transport(&self) -> bool {
        match self {
            Error::Server(e) => e.is_transport(),
            Error::Client(e) => e.is_transport(),
            Error::Wire(e) => e.is_transport(),
            _ => false,
        }
    }

    /// Whether a configuration was rejected
    pub fn is_config(&self) -> bool {
        match self {
            Error::Core(e) => e.is_config(),
            Error::Client(ClientError::Core(e)) => e.is_config(),
            Error::UnknownTable(_) | Error::UnknownClient(_) => true,
            _ => false,
        }
    }

    /// Whether an application update was rejected before buffering
    pub fn is_invalid_update(&self) -> bool {
        matches!(self, Error::Client(e) if e.is_invalid_update())
    }

    /// Whether a row cache is full of pinned rows
    pub fn is_cache_exhausted(&self) -> bool {
        match self {
            Error::Storage(StorageError::EvictionExhausted { .. }) => true,
            Error::Client(e) => e.is_cache_exhausted(),
            _ => false,
        }
    }

    /// Whether this is an unrecoverable failure of the cluster
    pub fn is_serious(&self) -> bool {
        matches!(self, Error::ThreadPanicked(_) | Error::StartupFailed(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let err = Error::from(ClientError::UnknownTable(3));
        assert!(err.is_protocol());
        assert!(!err.is_config());

        let err = Error::from(CoreError::InvalidConfig("num_servers".into()));
        assert!(err.is_config());
        assert!(!err.is_protocol());

        let err = Error::from(StorageError::EvictionExhausted {
            row_id: 1,
            attempts: 4096,
            capacity: 2,
        });
        assert!(err.is_cache_exhausted());

        assert!(Error::ThreadPanicked("bg-0-0".into()).is_serious());
        assert!(Error::StartupFailed("server-1".into()).is_serious());
        let err = Error::from(ClientError::Core(CoreError::ColumnOutOfRange {
            column_id: 9,
            capacity: 4,
        }));
        assert!(err.is_invalid_update());
        assert!(!err.is_config());
        assert!(Error::UnknownTable(9).to_string().contains('9'));
    }
}

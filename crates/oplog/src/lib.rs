//! Operation logs for sspps clients
//!
//! Local updates are buffered per row until a bg worker ships them:
//! - `RowOpLog`: coalesced deltas of one row (sparse, dense or versioned)
//! - `OpLogPartition` / `TableOpLog`: row oplogs sharded by `row_id mod N`
//! - `TableOpLogMeta`: per-partition ranking of which rows to send first
//! - `OpLogSerializer` / `SerializedOpLogReader`: the `ClientSendOpLog`
//!   payload format

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod meta;
pub mod partition;
pub mod row_oplog;
pub mod serializer;
pub mod table_oplog;

pub use error::{OpLogError, Result};
pub use meta::TableOpLogMeta;
pub use partition::{OpLogAccessor, OpLogPartition};
pub use row_oplog::{OpLogKind, RowOpLog, RowOpLogMeta};
pub use serializer::{
    OpLogLayout, OpLogSerializer, RowUpdate, RowUpdates, SerializedOpLogReader,
};
pub use table_oplog::TableOpLog;

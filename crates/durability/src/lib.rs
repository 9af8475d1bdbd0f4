//! Durability for sspps server tables
//!
//! Server tables are checkpointed as snapshot files: a stream of
//! `[row_id:i32][size:u64][row bytes]` records packed into 64 KiB blocks.
//! Restoring a table recreates every row from its bytes; there is no oplog
//! replay.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod snapshot;

pub use error::{Result, SnapshotError};
pub use snapshot::{
    snapshot_file_name, SnapshotReader, SnapshotStats, SnapshotWriter, END_OF_BLOCK,
    SNAPSHOT_BLOCK_SIZE,
};

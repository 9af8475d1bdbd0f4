//! Identifier aliases and protocol constants
//!
//! Ids stay plain `i32` because they travel over the wire verbatim. Internal
//! sentinels (-1) are converted to `Option` at API boundaries.

/// Row identifier within a table
pub type RowId = i32;

/// Table identifier
pub type TableId = i32;

/// Column identifier within a row
pub type ColumnId = i32;

/// Client process identifier
pub type ClientId = i32;

/// Logical clock (SSP iteration counter)
pub type Clock = i32;

/// Thread-level identity of a bg worker or server thread
pub type ThreadId = i32;

/// Wire-stable row type identifier, resolved by a `RowRegistry`
pub type RowTypeId = i32;

/// Sentinel used by rings and serialized streams for "no row"
pub const INVALID_ROW_ID: RowId = -1;

/// Sentinel clock carried by oplog metadata that has been read out
pub const INVALID_CLOCK: Clock = -1;

/// Marker written between tables in a serialized push buffer
pub const SERIALIZED_TABLE_SEPARATOR: i32 = -1;

/// Marker written after the last table in a serialized push buffer
pub const SERIALIZED_TABLE_END: i32 = -2;

/// Thread-id space reserved per client process
pub const MAX_THREADS_PER_CLIENT: ThreadId = 1000;

/// Offset of the first server thread inside a client's id space
pub const SERVER_THREAD_ID_START_OFFSET: ThreadId = 1;

/// Offset of the first bg worker inside a client's id space
pub const BG_THREAD_ID_START_OFFSET: ThreadId = 100;

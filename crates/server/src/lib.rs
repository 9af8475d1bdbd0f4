//! Server side of sspps
//!
//! A server thread hosts the rows of every table whose row ids hash to its
//! server, for one comm channel. This crate provides:
//!
//! - `ServerRow`: row data, subscribers, dirty flag, importance, version
//! - `ServerTable`: row storage, oplog apply, partial push selection,
//!   resumable full push, snapshots
//! - `ServerTableLogic`: pluggable per-table behavior, looked up by id
//! - `Server`: tables plus bg clocks, oplog versions and row requests
//! - `ServerThread`: the message loop with push pacing and backpressure
//!
//! # Thread Safety
//!
//! Nothing here is shared between threads. Each `ServerThread` owns its
//! `Server` and talks to the outside only through a `CommBus`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod logic;
pub mod server;
pub mod server_row;
pub mod server_thread;
pub mod table;
pub mod vector_clock;

pub use error::{Result, ServerError};
pub use logic::{ApplyMode, LogicFactory, ServerTableLogic, ServerTableLogicRegistry};
pub use server::{
    OpLogApply, PushRowBatch, RowReply, Server, ServerRowRequest, NO_VERSION,
    PUSH_ROW_MSG_SIZE_INIT,
};
pub use server_row::{AppendRow, RowVersion, ServerRow};
pub use server_thread::{server_channel, Flow, ServerThread, PUSH_ROW_WINDOW};
pub use table::{AppendOutcome, CandidateOrder, PartialPushPolicy, ServerTable, TableContext};
pub use vector_clock::VectorClock;

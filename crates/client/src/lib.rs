//! Client side of sspps
//!
//! - `ClientTable`: the process row cache plus buffered local updates
//! - `BgWorker`: one per comm channel; ships updates to the servers and
//!   installs the rows they push back
//!
//! # Thread Safety
//!
//! `ClientTable` is shared by application threads and bg workers behind an
//! `Arc`. Each `BgWorker` runs on its own thread.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bg_worker;
pub mod error;
pub mod table;

pub use bg_worker::{BgWorker, ClientTables, Flow, OPLOG_WINDOW};
pub use error::{ClientError, Result};
pub use table::ClientTable;

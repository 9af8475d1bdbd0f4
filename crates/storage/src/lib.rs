//! Client-side row storage
//!
//! This crate implements the per-process row cache shared by all application
//! threads of a client:
//! - `ClientRow`: a cached row with its clock and live-accessor count
//! - `RowAccessor`: RAII handle that pins a row against eviction
//! - `ProcessStorage`: capacity-bounded concurrent map with CLOCK eviction

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client_row;
pub mod error;
pub mod process_storage;

pub use client_row::{ClientRow, RowAccessor};
pub use error::{Result, StorageError};
pub use process_storage::{InsertOutcome, ProcessStorage};

//! # sspps
//!
//! Stale synchronous parallel (SSP) parameter server.
//!
//! Application threads read rows that may lag their own clock by at most a
//! table's staleness, and write additive updates that a background worker
//! ships to the servers. Servers apply the updates and push fresh rows back.
//!
//! ## Quick Start
//!
//! ```ignore
//! use sspps::prelude::*;
//!
//! let cluster = LocalCluster::builder()
//!     .config(PsConfig::default())
//!     .table(0, ClientTableConfig {
//!         table_info: TableInfo::dense(DENSE_F32, 8, 1),
//!         ..ClientTableConfig::default()
//!     })
//!     .start()?;
//!
//! let mut app = cluster.app(0)?;
//! app.inc(0, 5, 2, 1.5f32)?;
//! app.clock()?;
//! let value = app.get_value(0, 5, 2)?;
//!
//! app.deregister()?;
//! cluster.join()?;
//! ```
//!
//! ## Crates
//!
//! - `sspps_core`: ids, configuration, row types and the row registry
//! - [`concurrency`]: striped locks and the CLOCK eviction ring
//! - [`storage`]: the client process row cache
//! - [`oplog`]: buffered updates, selection and serialization
//! - [`wire`]: messages, the comm bus and send bookkeeping
//! - [`durability`]: server table snapshots
//! - [`server`]: server tables and server threads
//! - [`client`]: client tables and bg workers

#![warn(missing_docs)]

mod cluster;
mod error;

pub mod prelude;

pub use cluster::{AppThread, LocalCluster, LocalClusterBuilder, APP_THREAD_ID_START_OFFSET};
pub use error::{Error, Result};

pub use sspps_client as client;
pub use sspps_concurrency as concurrency;
pub use sspps_core;
pub use sspps_durability as durability;
pub use sspps_oplog as oplog;
pub use sspps_server as server;
pub use sspps_storage as storage;
pub use sspps_wire as wire;

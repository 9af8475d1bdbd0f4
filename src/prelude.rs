//! Convenient imports for sspps
//!
//! ```ignore
//! use sspps::prelude::*;
//! ```

// Entry points
pub use crate::cluster::{AppThread, LocalCluster, LocalClusterBuilder};

// Error handling
pub use crate::error::{Error, Result};

// Configuration
pub use sspps_core::{
    ClientTableConfig, ConsistencyModel, PsConfig, RowOpLogType, TableInfo, UpdateSortPolicy,
};

// Ids and rows
pub use sspps_core::{
    ClientId, Clock, ColumnId, Element, Row, RowId, RowRegistry, TableId, ThreadId, DENSE_F32,
    DENSE_F64, DENSE_I32, SORTED_VECTOR_MAP_F32, SORTED_VECTOR_MAP_I32, SPARSE_F32, SPARSE_I32,
};

// Server plugins
pub use sspps_server::{ServerTableLogic, ServerTableLogicRegistry};

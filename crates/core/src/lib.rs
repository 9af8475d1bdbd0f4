//! Core types for the sspps parameter server
//!
//! This crate defines the vocabulary shared by the client cache, the oplog,
//! the wire layer and the server tables:
//! - Identifier aliases (`RowId`, `TableId`, `Clock`, ...)
//! - Configuration: `TableInfo`, `ClientTableConfig`, `PsConfig`
//! - The object-safe `Row` trait and its dense / sparse / sorted-vector rows
//! - `RowRegistry`, the injectable factory that maps wire row-type ids to rows

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod row;
pub mod types;

pub use config::{
    ClientTableConfig, ConsistencyModel, PsConfig, RowOpLogType, TableInfo, UpdateSortPolicy,
};
pub use error::{CoreError, Result};
pub use row::{
    encode_updates, DenseRow, Element, Row, RowFactory, RowRegistry, SortedVectorMapRow,
    SparseRow, DENSE_F32, DENSE_F64, DENSE_I32, ROW_TYPE_NONE, SORTED_VECTOR_MAP_F32,
    SORTED_VECTOR_MAP_I32, SPARSE_F32, SPARSE_I32,
};
pub use types::*;

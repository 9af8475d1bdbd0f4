//! Table and process configuration
//!
//! `PsConfig` is the explicit replacement for process-wide mutable context:
//! it is built once at startup, validated, and handed to every component that
//! needs routing or pacing parameters. `TableInfo` is the per-table schema
//! shared by clients and servers (it travels inside `CreateTable` messages).

use crate::error::{CoreError, Result};
use crate::row::{DENSE_F32, ROW_TYPE_NONE};
use crate::types::*;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Order in which buffered row updates are shipped when the budget is limited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UpdateSortPolicy {
    /// Oldest clock first, ties by row id
    #[default]
    Fifo,
    /// Uniformly random order, reshuffled every round
    Random,
    /// Largest accumulated update magnitude first
    RelativeMagnitude,
    /// Flush completed clocks first, then by magnitude
    FifoNReMag,
    /// Round-robin over rows with a persistent cursor
    FixedOrder,
}

impl UpdateSortPolicy {
    /// Whether per-row importance must be accumulated on merge
    pub fn accumulates_importance(&self) -> bool {
        matches!(
            self,
            UpdateSortPolicy::RelativeMagnitude | UpdateSortPolicy::FifoNReMag
        )
    }

    /// Whether selection walks rows in a fixed cyclic order
    pub fn is_fixed_order(&self) -> bool {
        matches!(self, UpdateSortPolicy::FixedOrder)
    }
}

/// In-memory layout of a row's pending update buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RowOpLogType {
    /// Ordered column -> delta map
    #[default]
    Sparse,
    /// Fixed-capacity delta array
    Dense,
}

/// Consistency protocol run by the bg workers and servers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConsistencyModel {
    /// Plain SSP, rows fetched on demand
    Ssp,
    /// SSP with server-initiated row pushes
    SspPush,
    /// SSP push with aggressive, paced oplog propagation
    #[default]
    SspAggr,
}

/// Per-table schema, identical on every client and server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Maximum number of clocks a read may lag behind
    pub table_staleness: i32,
    /// Row type id resolved through the row registry
    pub row_type: RowTypeId,
    /// Number of columns per row (dense) or capacity hint (sparse)
    pub row_capacity: usize,
    /// Serialize oplogs densely instead of as (column, delta) pairs
    pub oplog_dense_serialized: bool,
    /// Layout of the pending-update buffer
    pub row_oplog_type: RowOpLogType,
    /// Capacity of dense row oplogs
    pub dense_row_oplog_capacity: usize,
    /// Maximum rows a server pushes per table per partial round
    pub server_push_row_upper_bound: usize,
    /// Optional server-side logic plugin id
    pub server_table_logic: Option<i32>,
    /// Track per-row update versions for exactly-once apply
    pub version_maintain: bool,
}

impl Default for TableInfo {
    fn default() -> Self {
        Self {
            table_staleness: 0,
            row_type: DENSE_F32,
            row_capacity: 0,
            oplog_dense_serialized: false,
            row_oplog_type: RowOpLogType::Sparse,
            dense_row_oplog_capacity: 0,
            server_push_row_upper_bound: 100,
            server_table_logic: None,
            version_maintain: false,
        }
    }
}

impl TableInfo {
    /// Dense table of `capacity` columns with the given staleness
    pub fn dense(row_type: RowTypeId, capacity: usize, staleness: i32) -> Self {
        Self {
            table_staleness: staleness,
            row_type,
            row_capacity: capacity,
            oplog_dense_serialized: true,
            row_oplog_type: RowOpLogType::Dense,
            dense_row_oplog_capacity: capacity,
            ..Self::default()
        }
    }

    /// Sparse table with the given staleness
    pub fn sparse(row_type: RowTypeId, capacity: usize, staleness: i32) -> Self {
        Self {
            table_staleness: staleness,
            row_type,
            row_capacity: capacity,
            ..Self::default()
        }
    }

    /// Encode for the `CreateTable` message trailer
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode from a `CreateTable` message trailer
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Reject schemas no component can serve
    pub fn validate(&self) -> Result<()> {
        if self.row_type == ROW_TYPE_NONE {
            return Err(CoreError::InvalidConfig("row_type is unset".into()));
        }
        if self.table_staleness < 0 {
            return Err(CoreError::InvalidConfig(format!(
                "table_staleness must be >= 0, got {}",
                self.table_staleness
            )));
        }
        if self.row_oplog_type == RowOpLogType::Dense && self.dense_row_oplog_capacity == 0 {
            return Err(CoreError::InvalidConfig(
                "dense row oplogs need dense_row_oplog_capacity > 0".into(),
            ));
        }
        if self.oplog_dense_serialized && self.row_oplog_type != RowOpLogType::Dense {
            return Err(CoreError::InvalidConfig(
                "dense oplog serialization requires dense row oplogs".into(),
            ));
        }
        if self.version_maintain && self.row_oplog_type != RowOpLogType::Dense {
            return Err(CoreError::InvalidConfig(
                "version_maintain requires dense row oplogs".into(),
            ));
        }
        if self.version_maintain && !self.oplog_dense_serialized {
            return Err(CoreError::InvalidConfig(
                "version_maintain requires dense oplog serialization".into(),
            ));
        }
        Ok(())
    }
}

/// Client-side table configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientTableConfig {
    /// Schema shared with the servers
    pub table_info: TableInfo,
    /// Maximum rows held by the process cache
    pub process_cache_capacity: usize,
    /// Expected number of rows with pending updates
    pub oplog_capacity: usize,
    /// Maximum rows shipped per bg worker per send round
    pub client_send_oplog_upper_bound: usize,
}

impl Default for ClientTableConfig {
    fn default() -> Self {
        Self {
            table_info: TableInfo::default(),
            process_cache_capacity: 1024,
            oplog_capacity: 1024,
            client_send_oplog_upper_bound: 100,
        }
    }
}

/// Process-wide parameter server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PsConfig {
    /// Number of client processes
    pub num_clients: i32,
    /// Number of servers
    pub num_servers: i32,
    /// Bg workers per client, also the oplog partition count
    pub num_comm_channels_per_client: i32,
    /// Size of row-keyed striped lock pools
    pub lock_pool_size: usize,
    /// Consistency protocol
    pub consistency_model: ConsistencyModel,
    /// Shipping order for buffered updates and server pushes
    pub update_sort_policy: UpdateSortPolicy,
    /// Candidate over-sampling factor for importance-ranked selection
    pub row_candidate_factor: usize,
    /// Bg worker idle wake-up interval
    pub bg_idle_milli: u64,
    /// Server idle wake-up interval
    pub server_idle_milli: u64,
    /// Client uplink bandwidth used for pacing
    pub client_bandwidth_mbps: f64,
    /// Server uplink bandwidth used for pacing
    pub server_bandwidth_mbps: f64,
    /// Allow the bg worker to skip flushes within the staleness budget
    pub suppression_on: bool,
    /// Snapshot every N server clocks (0 disables)
    pub snapshot_clock: i32,
    /// Directory for server table snapshots
    pub snapshot_dir: PathBuf,
    /// Clock to restore from on table creation (0 disables)
    pub resume_clock: i32,
    /// Directory holding the snapshots to restore
    pub resume_dir: PathBuf,
}

impl Default for PsConfig {
    fn default() -> Self {
        Self {
            num_clients: 1,
            num_servers: 1,
            num_comm_channels_per_client: 1,
            lock_pool_size: default_lock_pool_size(),
            consistency_model: ConsistencyModel::SspAggr,
            update_sort_policy: UpdateSortPolicy::Fifo,
            row_candidate_factor: 5,
            bg_idle_milli: 10,
            server_idle_milli: 10,
            client_bandwidth_mbps: 40.0,
            server_bandwidth_mbps: 40.0,
            suppression_on: false,
            snapshot_clock: 0,
            snapshot_dir: PathBuf::from("."),
            resume_clock: 0,
            resume_dir: PathBuf::from("."),
        }
    }
}

/// `available_parallelism * 20`, the default striping factor
pub fn default_lock_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        * 20
}

impl PsConfig {
    /// Single client, single server, single channel
    pub fn single_process() -> Self {
        Self::default()
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: PsConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Check ranges that other components rely on
    pub fn validate(&self) -> Result<()> {
        if self.num_clients <= 0 || self.num_servers <= 0 {
            return Err(CoreError::InvalidConfig(format!(
                "need at least one client and one server, got {} / {}",
                self.num_clients, self.num_servers
            )));
        }
        if self.num_comm_channels_per_client <= 0 {
            return Err(CoreError::InvalidConfig(
                "num_comm_channels_per_client must be positive".into(),
            ));
        }
        if self.num_comm_channels_per_client >= MAX_THREADS_PER_CLIENT - BG_THREAD_ID_START_OFFSET
        {
            return Err(CoreError::InvalidConfig(format!(
                "too many comm channels: {}",
                self.num_comm_channels_per_client
            )));
        }
        if self.lock_pool_size == 0 {
            return Err(CoreError::InvalidConfig("lock_pool_size must be positive".into()));
        }
        if self.row_candidate_factor == 0 {
            return Err(CoreError::InvalidConfig(
                "row_candidate_factor must be positive".into(),
            ));
        }
        if !(self.client_bandwidth_mbps > 0.0 && self.server_bandwidth_mbps > 0.0) {
            return Err(CoreError::InvalidConfig("bandwidth must be positive".into()));
        }
        Ok(())
    }

    /// Whether server tables accumulate per-row importance on apply
    pub fn server_accumulates_importance(&self) -> bool {
        self.consistency_model == ConsistencyModel::SspAggr
            && self.update_sort_policy.accumulates_importance()
    }

    /// Oplog partition (and bg worker channel) owning `row_id`
    #[inline]
    pub fn bg_partition(&self, row_id: RowId) -> usize {
        row_id.rem_euclid(self.num_comm_channels_per_client) as usize
    }

    /// Server index owning `row_id`
    #[inline]
    pub fn server_for_row(&self, row_id: RowId) -> i32 {
        row_id.rem_euclid(self.num_servers)
    }

    /// Thread id of the bg worker for `(client, channel)`
    pub fn bg_thread_id(&self, client_id: ClientId, channel: i32) -> ThreadId {
        client_id * MAX_THREADS_PER_CLIENT + BG_THREAD_ID_START_OFFSET + channel
    }

    /// Thread id of the server thread for `(server, channel)`
    pub fn server_thread_id(&self, server: i32, channel: i32) -> ThreadId {
        server * MAX_THREADS_PER_CLIENT + SERVER_THREAD_ID_START_OFFSET + channel
    }

    /// Client that owns a bg worker thread id
    pub fn client_of_bg(&self, bg_id: ThreadId) -> ClientId {
        bg_id / MAX_THREADS_PER_CLIENT
    }

    /// All server thread ids a bg worker on `channel` talks to
    pub fn server_thread_ids(&self, channel: i32) -> Vec<ThreadId> {
        (0..self.num_servers)
            .map(|s| self.server_thread_id(s, channel))
            .collect()
    }

    /// All bg worker ids a server thread on `channel` serves
    pub fn bg_thread_ids(&self, channel: i32) -> Vec<ThreadId> {
        (0..self.num_clients)
            .map(|c| self.bg_thread_id(c, channel))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::SPARSE_F32;

    #[test]
    fn test_default_config_is_valid() {
        assert!(PsConfig::default().validate().is_ok());
        assert!(PsConfig::default().lock_pool_size >= 20);
    }

    #[test]
    fn test_from_toml_overrides_and_defaults() {
        let config = PsConfig::from_toml_str(
            r#"
            num_clients = 2
            num_servers = 3
            num_comm_channels_per_client = 4
            update_sort_policy = "RelativeMagnitude"
            suppression_on = true
            "#,
        )
        .unwrap();
        assert_eq!(config.num_clients, 2);
        assert_eq!(config.num_servers, 3);
        assert_eq!(config.update_sort_policy, UpdateSortPolicy::RelativeMagnitude);
        assert!(config.suppression_on);
        assert_eq!(config.row_candidate_factor, 5);
        assert!(config.server_accumulates_importance());
    }

    #[test]
    fn test_invalid_toml_rejected() {
        let err = PsConfig::from_toml_str("num_servers = 0").unwrap_err();
        assert!(err.is_config());
    }

    #[test]
    fn test_routing() {
        let config = PsConfig {
            num_clients: 2,
            num_servers: 2,
            num_comm_channels_per_client: 3,
            ..PsConfig::default()
        };
        assert_eq!(config.bg_partition(7), 1);
        assert_eq!(config.server_for_row(7), 1);
        let bg = config.bg_thread_id(1, 2);
        assert_eq!(bg, 1102);
        assert_eq!(config.client_of_bg(bg), 1);
        assert_eq!(config.server_thread_ids(0), vec![1, 1001]);
        assert_eq!(config.bg_thread_ids(1), vec![101, 1101]);
    }

    #[test]
    fn test_table_info_bytes_round_trip() {
        let info = TableInfo {
            server_table_logic: Some(3),
            ..TableInfo::sparse(SPARSE_F32, 64, 2)
        };
        let decoded = TableInfo::from_bytes(&info.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_table_info_validation() {
        let mut info = TableInfo::dense(DENSE_F32, 8, 1);
        assert!(info.validate().is_ok());
        info.dense_row_oplog_capacity = 0;
        assert!(info.validate().is_err());

        let versioned_sparse = TableInfo {
            version_maintain: true,
            ..TableInfo::sparse(SPARSE_F32, 8, 1)
        };
        assert!(versioned_sparse.validate().is_err());
    }
}

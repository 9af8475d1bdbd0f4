//! In-process cluster: server threads, bg workers and app threads on one bus
//!
//! `LocalCluster` spawns every server thread and bg worker that a
//! `PsConfig` describes, all wired to a single `LocalBus`. Application code
//! talks to it through `AppThread` handles, one per worker thread.
//!
//! # Example
//!
//! ```ignore
//! use sspps::prelude::*;
//!
//! let cluster = LocalCluster::builder()
//!     .config(PsConfig::default())
//!     .table(0, ClientTableConfig {
//!         table_info: TableInfo::dense(DENSE_F32, 4, 1),
//!         ..ClientTableConfig::default()
//!     })
//!     .start()?;
//! let mut app = cluster.app(0)?;
//! app.inc(0, 3, 1, 0.5f32)?;
//! app.clock()?;
//! let value = app.get_value(0, 3, 1)?;
//! app.deregister()?;
//! cluster.join()?;
//! ```

use crate::error::{Error, Result};
use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use sspps_client::{BgWorker, ClientTable, ClientTables};
use sspps_core::{
    encode_updates, ClientId, ClientTableConfig, Clock, ColumnId, Element, PsConfig, RowId,
    RowRegistry, TableId, ThreadId, MAX_THREADS_PER_CLIENT,
};
use sspps_server::{ServerTableLogicRegistry, ServerThread, TableContext};
use sspps_storage::RowAccessor;
use sspps_wire::{CommBus, Endpoint, Envelope, LocalBus, Message};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Offset of application thread ids within a client's id range
pub const APP_THREAD_ID_START_OFFSET: ThreadId = 200;

/// How often `start` checks for threads that died during startup
const STARTUP_POLL: Duration = Duration::from_millis(50);

/// Clocks of the application threads of one client process
///
/// The process clock is the minimum over registered threads; bg workers
/// are told about a tick only when that minimum advances.
#[derive(Debug, Default)]
struct ProcessClock {
    clocks: BTreeMap<ThreadId, Clock>,
    min: Clock,
}

impl ProcessClock {
    fn register(&mut self, app_id: ThreadId) -> Clock {
        self.clocks.insert(app_id, self.min);
        self.min
    }

    /// Record a tick; returns how many process clocks completed
    fn tick(&mut self, app_id: ThreadId) -> i32 {
        if let Some(clock) = self.clocks.get_mut(&app_id) {
            *clock += 1;
        }
        self.advance()
    }

    fn deregister(&mut self, app_id: ThreadId) -> i32 {
        self.clocks.remove(&app_id);
        self.advance()
    }

    fn advance(&mut self) -> i32 {
        let Some(min) = self.clocks.values().min().copied() else {
            return 0;
        };
        let ticks = (min - self.min).max(0);
        self.min = self.min.max(min);
        ticks
    }
}

struct ClientProcess {
    tables: Arc<ClientTables>,
    clock: Arc<Mutex<ProcessClock>>,
    next_app: AtomicI32,
}

/// Running cluster
pub struct LocalCluster {
    config: Arc<PsConfig>,
    bus: Arc<LocalBus>,
    clients: Vec<ClientProcess>,
    handles: Vec<(String, JoinHandle<Result<()>>)>,
}

impl std::fmt::Debug for LocalCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCluster")
            .field("num_clients", &self.clients.len())
            .field("num_threads", &self.handles.len())
            .finish_non_exhaustive()
    }
}

impl LocalCluster {
    /// Builder with default settings
    pub fn builder() -> LocalClusterBuilder {
        LocalClusterBuilder::new()
    }

    /// Cluster configuration
    pub fn config(&self) -> &PsConfig {
        &self.config
    }

    /// Tables of client `client_id`
    pub fn tables(&self, client_id: ClientId) -> Option<&Arc<ClientTables>> {
        self.clients.get(client_id as usize).map(|c| &c.tables)
    }

    /// Register a new application thread with client `client_id`
    pub fn app(&self, client_id: ClientId) -> Result<AppThread> {
        let client = self
            .clients
            .get(usize::try_from(client_id).map_err(|_| Error::UnknownClient(client_id))?)
            .ok_or(Error::UnknownClient(client_id))?;
        let n = client.next_app.fetch_add(1, Ordering::Relaxed);
        let id = client_id * MAX_THREADS_PER_CLIENT + APP_THREAD_ID_START_OFFSET + n;
        let endpoint = self.bus.register(id);
        let clock = client.clock.lock().register(id);

        let app = AppThread {
            id,
            client_id,
            clock,
            config: Arc::clone(&self.config),
            tables: Arc::clone(&client.tables),
            process_clock: Arc::clone(&client.clock),
            bus: Arc::clone(&self.bus),
            endpoint,
        };
        app.send_to_all_bg(Message::AppConnect)?;
        debug!(app_id = id, client_id, clock, "app thread registered");
        Ok(app)
    }

    /// Wait for every thread to exit
    ///
    /// Returns once every app thread has deregistered and the servers have
    /// acknowledged the shutdown. The first thread error is returned.
    pub fn join(self) -> Result<()> {
        let mut first_err = None;
        for (name, handle) in self.handles {
            let outcome = handle
                .join()
                .unwrap_or_else(|_| Err(Error::ThreadPanicked(name.clone())));
            if let Err(e) = outcome {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => {
                info!("cluster shut down");
                Ok(())
            }
        }
    }
}

/// Builder for `LocalCluster`
pub struct LocalClusterBuilder {
    config: PsConfig,
    tables: BTreeMap<TableId, ClientTableConfig>,
    rows: RowRegistry,
    logics: ServerTableLogicRegistry,
}

impl Default for LocalClusterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalClusterBuilder {
    /// Single process defaults and the builtin row types
    pub fn new() -> Self {
        Self {
            config: PsConfig::single_process(),
            tables: BTreeMap::new(),
            rows: RowRegistry::with_builtin(),
            logics: ServerTableLogicRegistry::new(),
        }
    }

    /// Use `config`
    pub fn config(mut self, config: PsConfig) -> Self {
        self.config = config;
        self
    }

    /// Add or replace table `table_id`
    pub fn table(mut self, table_id: TableId, config: ClientTableConfig) -> Self {
        self.tables.insert(table_id, config);
        self
    }

    /// Row types known to clients and servers
    pub fn row_registry(mut self, rows: RowRegistry) -> Self {
        self.rows = rows;
        self
    }

    /// Server table logic plugins
    pub fn logic_registry(mut self, logics: ServerTableLogicRegistry) -> Self {
        self.logics = logics;
        self
    }

    /// Validate, build the client tables and spawn every thread
    ///
    /// Returns once every bg worker has created its tables on every server,
    /// so app threads can be registered right away.
    pub fn start(self) -> Result<LocalCluster> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let rows = Arc::new(self.rows);
        let bus = Arc::new(LocalBus::new());
        let dyn_bus: Arc<dyn CommBus> = bus.clone();
        let channels = config.num_comm_channels_per_client;

        let mut clients = Vec::with_capacity(config.num_clients as usize);
        for _ in 0..config.num_clients {
            let mut tables = ClientTables::new();
            for (table_id, table_config) in &self.tables {
                let table = ClientTable::new(*table_id, table_config.clone(), &config, Arc::clone(&rows))
                    .map_err(Error::from)?;
                tables.insert(*table_id, Arc::new(table));
            }
            clients.push(ClientProcess {
                tables: Arc::new(tables),
                clock: Arc::new(Mutex::new(ProcessClock::default())),
                next_app: AtomicI32::new(0),
            });
        }

        // every endpoint exists before any thread sends
        let ctx = TableContext::from_config(&config, Arc::clone(&rows), Arc::new(self.logics));
        let mut servers = Vec::new();
        for server in 0..config.num_servers {
            for channel in 0..channels {
                let id = config.server_thread_id(server, channel);
                servers.push((id, bus.register(id)));
            }
        }
        let mut bgs = Vec::new();
        for client_id in 0..config.num_clients {
            for channel in 0..channels {
                let id = config.bg_thread_id(client_id, channel);
                bgs.push((client_id, channel, bus.register(id)));
            }
        }

        let num_bgs = bgs.len();
        let (ready_tx, ready_rx) = channel::unbounded();
        let mut handles = Vec::with_capacity(servers.len() + bgs.len());
        for (id, endpoint) in servers {
            let name = format!("server-{id}");
            let thread = ServerThread::new(id, Arc::clone(&config), ctx.clone(), Arc::clone(&dyn_bus), endpoint);
            let handle = spawn(&name, move || thread.run().map_err(Error::from))?;
            handles.push((name, handle));
        }
        for (client_id, channel, endpoint) in bgs {
            let name = format!("bg-{client_id}-{channel}");
            let worker = BgWorker::new(
                client_id,
                channel,
                Arc::clone(&config),
                Arc::clone(&clients[client_id as usize].tables),
                Arc::clone(&dyn_bus),
                endpoint,
            )
            .with_ready(ready_tx.clone());
            let handle = spawn(&name, move || worker.run().map_err(Error::from))?;
            handles.push((name, handle));
        }
        drop(ready_tx);
        wait_ready(&ready_rx, &mut handles, num_bgs)?;
        info!(
            num_clients = config.num_clients,
            num_servers = config.num_servers,
            channels,
            num_tables = self.tables.len(),
            "cluster started"
        );
        Ok(LocalCluster {
            config,
            bus,
            clients,
            handles,
        })
    }
}

/// Wait for `num_bgs` readiness reports
///
/// A thread that exits first fails the start with its error.
fn wait_ready(
    ready: &Receiver<ThreadId>,
    handles: &mut Vec<(String, JoinHandle<Result<()>>)>,
    num_bgs: usize,
) -> Result<()> {
    let mut pending = num_bgs;
    while pending > 0 {
        match ready.recv_timeout(STARTUP_POLL) {
            Ok(bg_id) => {
                pending -= 1;
                debug!(bg_id, pending, "bg worker ready");
            }
            Err(err) => {
                let Some(index) = handles.iter().position(|(_, handle)| handle.is_finished()) else {
                    if matches!(err, RecvTimeoutError::Disconnected) {
                        thread::sleep(STARTUP_POLL);
                    }
                    continue;
                };
                let (name, handle) = handles.swap_remove(index);
                warn!(thread = %name, "thread exited during startup");
                let outcome = handle
                    .join()
                    .unwrap_or_else(|_| Err(Error::ThreadPanicked(name.clone())));
                return Err(outcome.err().unwrap_or(Error::StartupFailed(name)));
            }
        }
    }
    Ok(())
}

fn spawn<F>(name: &str, f: F) -> Result<JoinHandle<Result<()>>>
where
    F: FnOnce() -> Result<()> + Send + 'static,
{
    Ok(thread::Builder::new().name(name.to_string()).spawn(f)?)
}

/// Handle of one application thread
///
/// Reads are served from the client row cache when the cached row is fresh
/// enough for the table staleness; otherwise the row is requested through
/// the bg worker owning its partition.
pub struct AppThread {
    id: ThreadId,
    client_id: ClientId,
    clock: Clock,
    config: Arc<PsConfig>,
    tables: Arc<ClientTables>,
    process_clock: Arc<Mutex<ProcessClock>>,
    bus: Arc<LocalBus>,
    endpoint: Endpoint,
}

impl std::fmt::Debug for AppThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppThread")
            .field("id", &self.id)
            .field("client_id", &self.client_id)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl AppThread {
    /// Thread id
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Clocks this thread has completed
    pub fn current_clock(&self) -> Clock {
        self.clock
    }

    fn table(&self, table_id: TableId) -> Result<&Arc<ClientTable>> {
        self.tables.get(&table_id).ok_or(Error::UnknownTable(table_id))
    }

    /// Row `row_id`, at most `table_staleness` clocks behind this thread
    pub fn get(&self, table_id: TableId, row_id: RowId) -> Result<RowAccessor> {
        let table = self.table(table_id)?;
        let required = self.clock - table.info().table_staleness;
        loop {
            if let Some(accessor) = table.get(row_id) {
                if accessor.clock() >= required {
                    return Ok(accessor);
                }
            }
            self.request_row(table_id, row_id, required)?;
        }
    }

    /// One value of row `row_id`, read as in `get`
    pub fn get_value(&self, table_id: TableId, row_id: RowId, column_id: ColumnId) -> Result<f64> {
        let accessor = self.get(table_id, row_id)?;
        let value = accessor.read().value_f64(column_id);
        Ok(value)
    }

    fn request_row(&self, table_id: TableId, row_id: RowId, clock: Clock) -> Result<()> {
        let bg_id = self
            .config
            .bg_thread_id(self.client_id, self.config.bg_partition(row_id) as i32);
        let request = Message::RowRequest {
            table_id,
            row_id,
            clock,
            forced: false,
        };
        self.bus.send(self.id, bg_id, &Envelope::new(request))?;
        loop {
            let (_, envelope) = self.endpoint.recv()?;
            if envelope.message == Message::RowRequestReply {
                return Ok(());
            }
        }
    }

    /// Add `delta` to one column
    ///
    /// `E` must match the table's element width and `column_id` must fit
    /// a dense row; otherwise nothing is buffered.
    pub fn inc<E: Element>(
        &self,
        table_id: TableId,
        row_id: RowId,
        column_id: ColumnId,
        delta: E,
    ) -> Result<()> {
        let table = self.table(table_id)?;
        table.check_element_size(E::SIZE)?;
        table.inc(row_id, column_id, &encode_updates(&[delta]), self.clock)?;
        Ok(())
    }

    /// Add `deltas[i]` to column `column_ids[i]`
    pub fn batch_inc<E: Element>(
        &self,
        table_id: TableId,
        row_id: RowId,
        column_ids: &[ColumnId],
        deltas: &[E],
    ) -> Result<()> {
        let table = self.table(table_id)?;
        table.check_element_size(E::SIZE)?;
        table.batch_inc(row_id, column_ids, &encode_updates(deltas), self.clock)?;
        Ok(())
    }

    /// Add `deltas` to consecutive columns starting at `index_st`
    pub fn dense_batch_inc<E: Element>(
        &self,
        table_id: TableId,
        row_id: RowId,
        deltas: &[E],
        index_st: usize,
    ) -> Result<()> {
        let table = self.table(table_id)?;
        table.check_element_size(E::SIZE)?;
        table.dense_batch_inc(row_id, &encode_updates(deltas), index_st, deltas.len(), self.clock)?;
        Ok(())
    }

    /// Complete the current clock
    pub fn clock(&mut self) -> Result<()> {
        self.clock += 1;
        let ticks = self.process_clock.lock().tick(self.id);
        for _ in 0..ticks {
            self.send_to_all_bg(Message::BgClock)?;
        }
        Ok(())
    }

    /// Ask every bg worker to ship buffered updates now
    pub fn send_oplog(&self) -> Result<()> {
        self.send_to_all_bg(Message::BgSendOpLog)
    }

    /// Start early communication
    pub fn early_comm_on(&self) -> Result<()> {
        self.send_to_all_bg(Message::EarlyCommOn)
    }

    /// Stop early communication
    pub fn early_comm_off(&self) -> Result<()> {
        self.send_to_all_bg(Message::EarlyCommOff)
    }

    /// Leave the cluster; the last thread out shuts the client down
    pub fn deregister(self) -> Result<()> {
        let ticks = self.process_clock.lock().deregister(self.id);
        for _ in 0..ticks {
            self.send_to_all_bg(Message::BgClock)?;
        }
        self.send_to_all_bg(Message::AppThreadDereg)?;
        self.bus.deregister(self.id);
        debug!(app_id = self.id, clock = self.clock, "app thread deregistered");
        Ok(())
    }

    fn send_to_all_bg(&self, message: Message) -> Result<()> {
        let envelope = Envelope::new(message);
        for channel in 0..self.config.num_comm_channels_per_client {
            let bg_id = self.config.bg_thread_id(self.client_id, channel);
            self.bus.send(self.id, bg_id, &envelope)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_clock_follows_slowest_thread() {
        let mut clock = ProcessClock::default();
        assert_eq!(clock.register(1), 0);
        assert_eq!(clock.register(2), 0);

        assert_eq!(clock.tick(1), 0);
        assert_eq!(clock.tick(1), 0);
        assert_eq!(clock.tick(2), 1);
        assert_eq!(clock.tick(2), 1);
        assert_eq!(clock.tick(2), 0);

        // the slow thread leaving releases the fast one's lead
        assert_eq!(clock.deregister(1), 1);
        assert_eq!(clock.deregister(2), 0);
    }

    #[test]
    fn test_late_registration_starts_at_process_clock() {
        let mut clock = ProcessClock::default();
        clock.register(1);
        clock.tick(1);
        clock.tick(1);
        assert_eq!(clock.register(2), 2);
        assert_eq!(clock.tick(2), 0);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = PsConfig {
            num_servers: 0,
            ..PsConfig::default()
        };
        let err = LocalCluster::builder().config(config).start().unwrap_err();
        assert!(err.is_config());
    }
}

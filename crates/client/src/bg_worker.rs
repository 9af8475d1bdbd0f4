//! Background worker: ships buffered updates and installs server rows
//!
//! # Design
//!
//! Bg worker `channel` of a client owns oplog partition `channel` of every
//! table and talks to server thread `channel` of every server. The loop is
//!
//! 1. send `ClientConnect` to every server thread, wait for `ClientStart`
//! 2. announce every table with `CreateTable` and wait for the replies
//! 3. report readiness, then serve the application messages queued so far
//! 4. receive with a timeout; on timeout run idle work
//! 5. dispatch clocks, row requests, pushed rows, acks and shutdown
//!
//! On a clock tick the worker ships every row whose first buffered update
//! belongs to a completed clock, then tops the round up to the table's
//! `client_send_oplog_upper_bound` with rows ranked by `TableOpLogMeta`.
//! Plain `Ssp` and `SspPush` ship every buffered row at each tick instead.
//!
//! Under `SspAggr` with early communication on, idle time is spent shipping
//! ranked rows, paced by the estimated transmission time of the previous
//! send. Suppression lets a worker skip clock flushes while the measured
//! communication time fits in the table staleness budget.
//!
//! Every `ClientSendOpLog` to a server carries the next consecutive version
//! for that server. A full `MsgTracker` window defers the clock flush until
//! `ServerOpLogAck` frees it.
//!
//! # Thread Safety
//!
//! The worker itself is single-threaded. Tables are shared with application
//! threads through `Arc<ClientTable>`.

use crate::error::{ClientError, Result};
use crate::table::ClientTable;
use crossbeam::channel::Sender;
use rustc_hash::FxHashMap;
use sspps_core::{
    ClientId, Clock, ConsistencyModel, PsConfig, RowId, TableId, ThreadId, INVALID_CLOCK,
};
use sspps_oplog::{OpLogSerializer, TableOpLogMeta};
use sspps_wire::{CommBus, Endpoint, Envelope, Message, MsgTracker, PushRowReader, TransTimeEstimate};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Unacknowledged oplog messages allowed per server thread
pub const OPLOG_WINDOW: u32 = 8;

/// Tables of one client process, by id
pub type ClientTables = BTreeMap<TableId, Arc<ClientTable>>;

/// What the loop does after a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep serving; run idle work if nothing arrives within the timeout
    Continue(Option<Duration>),
    /// Every server acknowledged the shutdown
    Exit,
}

/// Background worker of one comm channel
pub struct BgWorker {
    id: ThreadId,
    client_id: ClientId,
    channel: i32,
    config: Arc<PsConfig>,
    tables: Arc<ClientTables>,
    bus: Arc<dyn CommBus>,
    endpoint: Endpoint,
    ready: Option<Sender<ThreadId>>,
    early: Vec<(ThreadId, Envelope)>,
    server_ids: Vec<ThreadId>,
    tracker: MsgTracker,
    oplog_meta: BTreeMap<TableId, TableOpLogMeta>,
    row_requests: FxHashMap<(TableId, RowId), Vec<ThreadId>>,
    num_app_threads: usize,
    num_deregistered: usize,
    num_shutdown_acks: usize,
    client_clock: Clock,
    clock_has_pushed: Clock,
    pending_clock_send_oplog: bool,
    min_table_staleness: i32,
    suppression_on: bool,
    suppression_level: i32,
    suppression_level_min: i32,
    early_comm_on: bool,
    oplog_send_millis: f64,
    msg_send_timer: Instant,
    clock_timer: Instant,
    clock_tick_secs: f64,
    pacing: TransTimeEstimate,
}

impl std::fmt::Debug for BgWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BgWorker")
            .field("id", &self.id)
            .field("client_clock", &self.client_clock)
            .field("clock_has_pushed", &self.clock_has_pushed)
            .field("suppression_level", &self.suppression_level)
            .field("early_comm_on", &self.early_comm_on)
            .finish_non_exhaustive()
    }
}

fn millis(ms: f64) -> Duration {
    Duration::from_secs_f64(ms.max(0.0) / 1000.0)
}

impl BgWorker {
    /// Bg worker `channel` of client `client_id`, receiving on `endpoint`
    pub fn new(
        client_id: ClientId,
        channel: i32,
        config: Arc<PsConfig>,
        tables: Arc<ClientTables>,
        bus: Arc<dyn CommBus>,
        endpoint: Endpoint,
    ) -> Self {
        let server_ids = config.server_thread_ids(channel);
        let mut tracker = MsgTracker::new(OPLOG_WINDOW);
        for server_id in &server_ids {
            tracker.add_dest(*server_id);
        }
        let oplog_meta = tables
            .keys()
            .map(|table_id| {
                let meta = TableOpLogMeta::new(config.update_sort_policy, config.row_candidate_factor);
                (*table_id, meta)
            })
            .collect();
        let min_table_staleness = tables
            .values()
            .map(|table| table.info().table_staleness)
            .min()
            .unwrap_or(0);
        let pacing = TransTimeEstimate::new(config.client_bandwidth_mbps);
        Self {
            id: config.bg_thread_id(client_id, channel),
            client_id,
            channel,
            config,
            tables,
            bus,
            endpoint,
            ready: None,
            early: Vec::new(),
            server_ids,
            tracker,
            oplog_meta,
            row_requests: FxHashMap::default(),
            num_app_threads: 0,
            num_deregistered: 0,
            num_shutdown_acks: 0,
            client_clock: 0,
            clock_has_pushed: INVALID_CLOCK,
            pending_clock_send_oplog: false,
            min_table_staleness,
            suppression_on: false,
            suppression_level: 0,
            suppression_level_min: 0,
            early_comm_on: false,
            oplog_send_millis: 0.0,
            msg_send_timer: Instant::now(),
            clock_timer: Instant::now(),
            clock_tick_secs: 0.0,
            pacing,
        }
    }

    /// Replace the per-server oplog window
    pub fn with_oplog_window(mut self, window: u32) -> Self {
        let mut tracker = MsgTracker::new(window);
        for server_id in &self.server_ids {
            tracker.add_dest(*server_id);
        }
        self.tracker = tracker;
        self
    }

    /// Send this worker's id on `ready` once its tables exist on every server
    pub fn with_ready(mut self, ready: Sender<ThreadId>) -> Self {
        self.ready = Some(ready);
        self
    }

    /// Thread id
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Clocks completed by the application
    pub fn client_clock(&self) -> Clock {
        self.client_clock
    }

    /// Last clock whose updates were flushed
    pub fn clock_has_pushed(&self) -> Clock {
        self.clock_has_pushed
    }

    /// Whether a clock flush waits for acks
    pub fn pending_clock_send_oplog(&self) -> bool {
        self.pending_clock_send_oplog
    }

    /// Whether clock flushes may be skipped
    pub fn suppression_on(&self) -> bool {
        self.suppression_on
    }

    /// Clock flushes that may currently be skipped
    pub fn suppression_level(&self) -> i32 {
        self.suppression_level
    }

    /// Whether early communication is on
    pub fn early_comm_on(&self) -> bool {
        self.early_comm_on
    }

    fn aggressive(&self) -> bool {
        self.config.consistency_model == ConsistencyModel::SspAggr
    }

    fn reset_bg_idle(&self) -> Option<Duration> {
        (self.aggressive() && self.early_comm_on)
            .then(|| Duration::from_millis(self.config.bg_idle_milli))
    }

    /// Run the handshake and the message loop until shutdown is acknowledged
    pub fn run(mut self) -> Result<()> {
        self.init()?;
        let mut flow = Flow::Continue(self.reset_bg_idle());
        for (sender, envelope) in std::mem::take(&mut self.early) {
            flow = self.handle_message(sender, envelope)?;
        }
        let Flow::Continue(mut timeout) = flow else {
            return Ok(());
        };
        loop {
            let received = match timeout {
                Some(timeout) => self.endpoint.recv_timeout(timeout)?,
                None => Some(self.endpoint.recv()?),
            };
            let Some((sender, envelope)) = received else {
                timeout = self.bg_idle_work()?;
                continue;
            };
            match self.handle_message(sender, envelope)? {
                Flow::Continue(next) => timeout = next,
                Flow::Exit => {
                    info!(bg_id = self.id, "bg worker exiting");
                    return Ok(());
                }
            }
        }
    }

    /// Connect to every server thread and create every table on it
    pub fn init(&mut self) -> Result<()> {
        let connect = Envelope::new(Message::ClientConnect {
            client_id: self.client_id,
        });
        for server_id in &self.server_ids {
            self.bus.send(self.id, *server_id, &connect)?;
        }
        let mut started = 0;
        while started < self.server_ids.len() {
            let (sender, envelope) = self.endpoint.recv()?;
            if envelope.message == Message::ClientStart && self.server_ids.contains(&sender) {
                started += 1;
            } else {
                self.handle_before_start(sender, envelope)?;
            }
        }

        for (table_id, table) in self.tables.iter() {
            let create = Envelope::new(Message::CreateTable {
                table_id: *table_id,
                info: table.info().clone(),
            });
            for server_id in &self.server_ids {
                self.bus.send(self.id, *server_id, &create)?;
            }
        }
        let mut replies = 0;
        while replies < self.tables.len() * self.server_ids.len() {
            let (sender, envelope) = self.endpoint.recv()?;
            match envelope.message {
                Message::CreateTableReply { table_id } if self.tables.contains_key(&table_id) => {
                    replies += 1
                }
                _ => self.handle_before_start(sender, envelope)?,
            }
        }
        self.clock_timer = Instant::now();
        self.msg_send_timer = Instant::now();
        info!(
            bg_id = self.id,
            num_servers = self.server_ids.len(),
            num_tables = self.tables.len(),
            queued = self.early.len(),
            "bg worker started"
        );
        if let Some(ready) = self.ready.take() {
            if ready.send(self.id).is_err() {
                debug!(bg_id = self.id, "nobody waits for readiness");
            }
        }
        Ok(())
    }

    /// Queue application messages until the handshake is over
    fn handle_before_start(&mut self, sender: ThreadId, envelope: Envelope) -> Result<()> {
        if self.server_ids.contains(&sender) {
            return Err(ClientError::Handshake {
                sender,
                msg: format!("{:?}", envelope.message.msg_type()),
            });
        }
        debug!(bg_id = self.id, sender, msg = ?envelope.message.msg_type(), "queued before start");
        self.early.push((sender, envelope));
        Ok(())
    }

    /// Number of application messages waiting for the handshake to finish
    pub fn queued_before_start(&self) -> usize {
        self.early.len()
    }

    /// Dispatch one message
    pub fn handle_message(&mut self, sender: ThreadId, envelope: Envelope) -> Result<Flow> {
        match envelope.message {
            Message::AppConnect => self.num_app_threads += 1,
            Message::AppThreadDereg => {
                self.num_deregistered += 1;
                if self.num_deregistered >= self.num_app_threads {
                    self.shut_down()?;
                }
            }
            Message::ClientShutDown => self.shut_down()?,
            Message::ServerShutDownAck => {
                self.num_shutdown_acks += 1;
                if self.num_shutdown_acks == self.server_ids.len() {
                    return Ok(Flow::Exit);
                }
            }
            Message::RowRequest {
                table_id,
                row_id,
                clock,
                forced,
            } => self.forward_row_request(sender, table_id, row_id, clock, forced)?,
            Message::ServerRowRequestReply {
                table_id,
                row_id,
                clock,
                row_data,
                ..
            } => self.handle_server_row_request_reply(table_id, row_id, clock, &row_data)?,
            Message::BgClock => {
                self.client_clock += 1;
                return Ok(Flow::Continue(self.handle_clock_msg(true)?));
            }
            Message::BgSendOpLog => return Ok(Flow::Continue(self.handle_clock_msg(false)?)),
            Message::ServerPushRow { clock, payload, .. } => {
                self.handle_server_push_row(sender, envelope.seq_num, clock, &payload)?
            }
            Message::ServerOpLogAck { ack_version } => {
                return Ok(Flow::Continue(self.handle_oplog_ack(sender, ack_version)?))
            }
            Message::EarlyCommOn => self.handle_early_comm_on()?,
            Message::EarlyCommOff => self.handle_early_comm_off()?,
            Message::AdjustSuppressionLevel => self.handle_adjust_suppression_level(),
            other => warn!(bg_id = self.id, sender, msg = ?other.msg_type(), "unexpected message"),
        }
        Ok(Flow::Continue(self.reset_bg_idle()))
    }

    /// Flush the updates of the clock that just completed
    ///
    /// Returns how long to wait before idle work.
    pub fn handle_clock_msg(&mut self, clock_advanced: bool) -> Result<Option<Duration>> {
        if !clock_advanced {
            return Ok(self.reset_bg_idle());
        }
        if !self.pending_clock_send_oplog {
            self.clock_tick_secs = self.clock_timer.elapsed().as_secs_f64();
            self.clock_timer = Instant::now();
        }
        if !self.tracker.check_send_all() {
            debug!(bg_id = self.id, client_clock = self.client_clock, "clock flush waits for acks");
            self.pending_clock_send_oplog = true;
            return Ok(self.reset_bg_idle());
        }
        self.pending_clock_send_oplog = false;

        if self.client_clock - 1 <= self.clock_has_pushed {
            return Err(ClientError::ClockReplayed {
                bg_id: self.id,
                clock_has_pushed: self.clock_has_pushed,
                client_clock: self.client_clock,
            });
        }
        if self.suppression_on
            && self.clock_has_pushed >= self.client_clock - 1 - self.suppression_level
        {
            return Ok(self.reset_bg_idle());
        }

        let clock_to_push = self.client_clock - 1;
        self.clock_has_pushed = clock_to_push;

        let mut left_over = 0.0;
        if self.oplog_send_millis > 0.0 {
            let elapsed = self.msg_send_timer.elapsed().as_secs_f64() * 1000.0;
            left_over = (self.oplog_send_millis - elapsed).max(0.0);
        }
        self.msg_send_timer = Instant::now();

        let serialize_start = Instant::now();
        let serializer = if self.aggressive() {
            self.prepare_oplogs(Some(clock_to_push), true, true)
        } else {
            self.prepare_oplogs(Some(Clock::MAX), false, true)
        };
        let serialize_secs = serialize_start.elapsed().as_secs_f64();
        let sent = self.send_oplog_msgs(serializer, true)?;

        self.oplog_send_millis = self.pacing.estimate_trans_millisec(sent) + left_over;
        if self.suppression_on {
            self.reset_suppression_level(serialize_secs);
        }
        debug!(
            bg_id = self.id,
            clock_to_push,
            sent,
            millis = self.oplog_send_millis,
            "clock flush"
        );

        if self.early_comm_on {
            Ok(Some(millis(self.oplog_send_millis)))
        } else {
            Ok(self.reset_bg_idle())
        }
    }

    fn reset_suppression_level(&mut self, serialize_secs: f64) {
        if self.clock_tick_secs <= 0.0 {
            return;
        }
        let cap = (self.min_table_staleness - 1).max(0);
        let comm_secs = self.oplog_send_millis * 2.0 / 1000.0;
        let comm_ticks = ((comm_secs / self.clock_tick_secs) as i32).min(cap);
        let construct_ticks =
            (((serialize_secs + comm_secs) / self.clock_tick_secs) as i32 + 1).min(cap);

        self.suppression_level_min = comm_ticks;
        self.suppression_level = (self.min_table_staleness - 1 - construct_ticks).max(comm_ticks);
        info!(
            bg_id = self.id,
            level = self.suppression_level,
            level_min = self.suppression_level_min,
            comm_secs,
            clock_tick_secs = self.clock_tick_secs,
            "suppression level set"
        );
    }

    /// Idle-time send of ranked rows; returns how long to wait next
    pub fn bg_idle_work(&mut self) -> Result<Option<Duration>> {
        if !self.aggressive() {
            return Ok(None);
        }
        if self.oplog_send_millis > 1.0 {
            let elapsed = self.msg_send_timer.elapsed().as_secs_f64() * 1000.0;
            if self.oplog_send_millis > elapsed + 1.0 {
                return Ok(Some(millis(self.oplog_send_millis - elapsed)));
            }
        }
        if !self.tracker.check_send_all() {
            return Ok(self.reset_bg_idle());
        }

        let channel = self.channel as usize;
        let found = self.oplog_meta.values().any(|meta| !meta.is_empty())
            || self.tables.values().any(|table| table.has_pending_oplog(channel));
        if !found {
            self.oplog_send_millis = 0.0;
            return Ok(self.reset_bg_idle());
        }

        self.msg_send_timer = Instant::now();
        let serializer = self.prepare_oplogs(None, true, false);
        let sent = self.send_oplog_msgs(serializer, false)?;
        if sent == 0 {
            self.oplog_send_millis = 0.0;
            return Ok(self.reset_bg_idle());
        }
        self.oplog_send_millis = self.pacing.estimate_trans_millisec(sent);
        debug!(bg_id = self.id, sent, millis = self.oplog_send_millis, "idle send");
        Ok(Some(millis(self.oplog_send_millis)))
    }

    /// Collect this channel's rows to ship into a serializer
    ///
    /// Rows first touched at or before `up_to_clock` always go; with
    /// `budget` the round is topped up to each table's upper bound.
    fn prepare_oplogs(
        &mut self,
        up_to_clock: Option<Clock>,
        budget: bool,
        is_clock: bool,
    ) -> OpLogSerializer {
        let mut serializer = OpLogSerializer::new();
        let channel = self.channel as usize;
        let version = (self.client_clock.max(0) as u64, is_clock);
        let (policy, factor) = (self.config.update_sort_policy, self.config.row_candidate_factor);

        for (table_id, table) in self.tables.iter() {
            let meta = self
                .oplog_meta
                .entry(*table_id)
                .or_insert_with(|| TableOpLogMeta::new(policy, factor));
            let partition = table.oplog().partition(channel);
            for row_id in partition.take_oplog_index() {
                if let Some(row_meta) = partition.get_invalidate_meta(row_id) {
                    if !row_meta.is_invalid() {
                        meta.insert_merge(row_id, row_meta);
                    }
                }
            }

            let mut num_rows = 0;
            if let Some(clock) = up_to_clock {
                for row_id in meta.get_and_clear_up_to_clock(clock) {
                    if append_row(&mut serializer, &self.config, table, self.channel, row_id, version) {
                        num_rows += 1;
                    }
                }
            }

            let bound = table.config().client_send_oplog_upper_bound;
            if !budget || bound <= num_rows {
                continue;
            }
            meta.prepare(bound - num_rows);
            while let Some(row_id) = meta.get_and_clear_next_in_order() {
                if append_row(&mut serializer, &self.config, table, self.channel, row_id, version) {
                    num_rows += 1;
                    if num_rows >= bound {
                        break;
                    }
                }
            }
        }
        serializer
    }

    /// Send one `ClientSendOpLog` per server with data, or to every server
    /// on a clock; returns the bytes sent
    fn send_oplog_msgs(&mut self, serializer: OpLogSerializer, is_clock: bool) -> Result<usize> {
        let mut payloads = serializer.finish();
        let mut sent = 0;
        for server_id in &self.server_ids {
            let payload = match payloads.remove(server_id) {
                Some(payload) => payload,
                None if is_clock => Vec::new(),
                None => continue,
            };
            let version = self.tracker.record_send(*server_id);
            let envelope = Envelope {
                seq_num: version,
                ack_num: 0,
                message: Message::ClientSendOpLog {
                    is_clock,
                    client_id: self.client_id,
                    version,
                    bg_clock: self.client_clock,
                    payload,
                },
            };
            sent += self.bus.send(self.id, *server_id, &envelope)?;
        }
        Ok(sent)
    }

    fn handle_oplog_ack(&mut self, sender: ThreadId, ack_version: u32) -> Result<Option<Duration>> {
        self.tracker.recv_ack(sender, ack_version);
        if self.pending_clock_send_oplog && self.tracker.check_send_all() {
            return self.handle_clock_msg(true);
        }
        Ok(self.reset_bg_idle())
    }

    /// Install pushed rows and acknowledge the push
    pub fn handle_server_push_row(
        &mut self,
        sender: ThreadId,
        seq_num: u32,
        clock: Clock,
        payload: &[u8],
    ) -> Result<()> {
        let mut reader = PushRowReader::new(payload);
        let mut rows = 0;
        while let Some(row) = reader.next_row()? {
            let Some(table) = self.tables.get(&row.table_id) else {
                return Err(ClientError::UnknownTable(row.table_id));
            };
            table.apply_server_push(row.row_id, row.data, clock)?;
            rows += 1;
        }
        debug!(bg_id = self.id, server_id = sender, clock, rows, "rows pushed");
        let ack = Message::BgServerPushRowAck {
            ack_version: seq_num,
        };
        self.bus.send(self.id, sender, &Envelope::new(ack))?;
        Ok(())
    }

    fn forward_row_request(
        &mut self,
        app_id: ThreadId,
        table_id: TableId,
        row_id: RowId,
        clock: Clock,
        forced: bool,
    ) -> Result<()> {
        if !self.tables.contains_key(&table_id) {
            return Err(ClientError::UnknownTable(table_id));
        }
        let waiters = self.row_requests.entry((table_id, row_id)).or_default();
        waiters.push(app_id);
        if waiters.len() > 1 {
            return Ok(());
        }
        let server_id = self
            .config
            .server_thread_id(self.config.server_for_row(row_id), self.channel);
        let request = Message::RowRequest {
            table_id,
            row_id,
            clock,
            forced,
        };
        self.bus.send(self.id, server_id, &Envelope::new(request))?;
        Ok(())
    }

    fn handle_server_row_request_reply(
        &mut self,
        table_id: TableId,
        row_id: RowId,
        clock: Clock,
        row_data: &[u8],
    ) -> Result<()> {
        let Some(table) = self.tables.get(&table_id) else {
            return Err(ClientError::UnknownTable(table_id));
        };
        table.apply_server_push(row_id, row_data, clock)?;
        let waiters = self.row_requests.remove(&(table_id, row_id)).unwrap_or_default();
        let reply = Envelope::new(Message::RowRequestReply);
        for app_id in waiters {
            self.bus.send(self.id, app_id, &reply)?;
        }
        Ok(())
    }

    fn handle_early_comm_on(&mut self) -> Result<()> {
        self.suppression_on = self.config.suppression_on && self.min_table_staleness > 2;
        self.suppression_level = 0;
        self.early_comm_on = true;
        info!(bg_id = self.id, suppression_on = self.suppression_on, "early comm on");
        self.send_to_all_servers(Message::EarlyCommOn)
    }

    fn handle_early_comm_off(&mut self) -> Result<()> {
        self.early_comm_on = false;
        info!(bg_id = self.id, "early comm off");
        self.send_to_all_servers(Message::EarlyCommOff)
    }

    fn handle_adjust_suppression_level(&mut self) {
        self.suppression_level = self.suppression_level_min;
        info!(bg_id = self.id, level = self.suppression_level, "suppression level adjusted");
    }

    fn shut_down(&mut self) -> Result<()> {
        info!(bg_id = self.id, "client shutting down");
        self.send_to_all_servers(Message::ClientShutDown)
    }

    fn send_to_all_servers(&self, message: Message) -> Result<()> {
        let envelope = Envelope::new(message);
        for server_id in &self.server_ids {
            self.bus.send(self.id, *server_id, &envelope)?;
        }
        Ok(())
    }
}

/// Move one row's oplog into the serializer; false if it has none
fn append_row(
    serializer: &mut OpLogSerializer,
    config: &PsConfig,
    table: &ClientTable,
    channel: i32,
    row_id: RowId,
    (version, end_of_version): (u64, bool),
) -> bool {
    let partition = table.oplog().partition(channel as usize);
    let Some(mut oplog) = partition.get_erase_oplog(row_id) else {
        return false;
    };
    oplog.set_version(version, end_of_version);
    let server_id = config.server_thread_id(config.server_for_row(row_id), channel);
    serializer.append_row_oplog(
        server_id,
        table.table_id(),
        table.info().oplog_dense_serialized,
        row_id,
        &mut oplog,
        table.sample_row(),
    );
    true
}

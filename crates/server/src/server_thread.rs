//! Server thread: message loop around a `Server`
//!
//! # Design
//!
//! One server thread serves one comm channel: bg worker `channel` of every
//! client talks to server thread `channel` of every server. The loop is
//!
//! 1. wait for every bg worker's `ClientConnect`, then send `ClientStart`
//! 2. receive with a timeout; on timeout run idle work (partial pushes)
//! 3. dispatch table creation, row requests, oplogs, acks and shutdown
//!
//! Pushes are tracked per bg worker by a `MsgTracker`. When its window is
//! full a clock-boundary push is deferred until `BgServerPushRowAck` frees
//! it. Idle pushes are paced by the estimated transmission time of the
//! previous push.
//!
//! The consistency model picks the push behavior:
//! - `Ssp`: no pushes; clients fetch rows with row requests
//! - `SspPush`: a full push whenever the server clock advances
//! - `SspAggr`: `SspPush` plus paced partial pushes while early
//!   communication is on

use crate::error::{Result, ServerError};
use crate::server::{PushRowBatch, Server};
use crate::table::TableContext;
use crate::vector_clock::VectorClock;
use sspps_core::{
    Clock, ConsistencyModel, PsConfig, RowId, TableId, TableInfo, ThreadId,
    MAX_THREADS_PER_CLIENT, SERVER_THREAD_ID_START_OFFSET,
};
use sspps_wire::{CommBus, Endpoint, Envelope, Message, MsgTracker, TransTimeEstimate};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Unacknowledged push messages allowed per bg worker
pub const PUSH_ROW_WINDOW: u32 = 8;

/// Whether the loop keeps running after a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Keep serving
    Continue,
    /// Every client shut down and was acknowledged
    Exit,
}

/// Message loop of one server thread
pub struct ServerThread {
    id: ThreadId,
    config: Arc<PsConfig>,
    bus: Arc<dyn CommBus>,
    endpoint: Endpoint,
    server: Server,
    tracker: MsgTracker,
    client_progress: VectorClock,
    min_table_staleness: Option<i32>,
    num_shutdown_bgs: usize,
    pending_shut_down: bool,
    pending_clock_push_row: bool,
    early_comm_on: bool,
    num_early_comm_off_msgs: usize,
    row_send_millis: f64,
    send_timer: Instant,
    pacing: TransTimeEstimate,
}

impl std::fmt::Debug for ServerThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerThread")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("early_comm_on", &self.early_comm_on)
            .field("pending_clock_push_row", &self.pending_clock_push_row)
            .finish_non_exhaustive()
    }
}

/// Comm channel served by server thread `id`
pub fn server_channel(id: ThreadId) -> i32 {
    id.rem_euclid(MAX_THREADS_PER_CLIENT) - SERVER_THREAD_ID_START_OFFSET
}

fn send_push(
    bus: &dyn CommBus,
    tracker: &mut MsgTracker,
    from: ThreadId,
    batch: PushRowBatch,
) -> Result<usize> {
    let seq_num = tracker.record_send(batch.bg_id);
    let envelope = Envelope {
        seq_num,
        ack_num: 0,
        message: Message::ServerPushRow {
            clock: batch.clock,
            version: batch.version,
            is_clock: batch.is_clock,
            payload: batch.payload,
        },
    };
    Ok(bus.send(from, batch.bg_id, &envelope)?)
}

impl ServerThread {
    /// Server thread `id` receiving on `endpoint`
    pub fn new(
        id: ThreadId,
        config: Arc<PsConfig>,
        ctx: TableContext,
        bus: Arc<dyn CommBus>,
        endpoint: Endpoint,
    ) -> Self {
        let bg_ids = config.bg_thread_ids(server_channel(id));
        let mut tracker = MsgTracker::new(PUSH_ROW_WINDOW);
        for bg_id in &bg_ids {
            tracker.add_dest(*bg_id);
        }
        let pacing = TransTimeEstimate::new(config.server_bandwidth_mbps);
        Self {
            id,
            server: Server::new(id, &bg_ids, Arc::clone(&config), ctx),
            client_progress: VectorClock::with_ids(bg_ids.iter().copied()),
            config,
            bus,
            endpoint,
            tracker,
            min_table_staleness: None,
            num_shutdown_bgs: 0,
            pending_shut_down: false,
            pending_clock_push_row: false,
            early_comm_on: false,
            num_early_comm_off_msgs: 0,
            row_send_millis: 0.0,
            send_timer: Instant::now(),
            pacing,
        }
    }

    /// Thread id
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Server state
    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Smallest staleness of the tables created so far
    pub fn min_table_staleness(&self) -> Option<i32> {
        self.min_table_staleness
    }

    /// Run the handshake and the message loop until every client shut down
    pub fn run(mut self) -> Result<()> {
        self.init_server()?;
        let mut timeout = None;
        loop {
            let received = match timeout {
                Some(timeout) => self.endpoint.recv_timeout(timeout)?,
                None => Some(self.endpoint.recv()?),
            };
            let Some((sender, envelope)) = received else {
                timeout = self.server_idle_work()?;
                continue;
            };
            timeout = self.reset_server_idle();
            if self.handle_message(sender, envelope)? == Flow::Exit {
                info!(server_id = self.id, "server thread exiting");
                return Ok(());
            }
        }
    }

    /// Wait for every bg worker to connect, then let the clients start
    pub fn init_server(&mut self) -> Result<()> {
        let bg_ids = self.server.bg_ids().to_vec();
        let mut connected = Vec::with_capacity(bg_ids.len());
        while connected.len() < bg_ids.len() {
            let (sender, envelope) = self.endpoint.recv()?;
            match envelope.message {
                Message::ClientConnect { client_id } if bg_ids.contains(&sender) => {
                    if !connected.contains(&sender) {
                        debug!(server_id = self.id, bg_id = sender, client_id, "bg connected");
                        connected.push(sender);
                    }
                }
                other => warn!(
                    server_id = self.id,
                    sender,
                    msg = ?other.msg_type(),
                    "unexpected message before start"
                ),
            }
        }
        self.send_to_all_bg(Message::ClientStart)?;
        info!(server_id = self.id, num_bgs = bg_ids.len(), "server started");
        Ok(())
    }

    fn aggressive(&self) -> bool {
        self.config.consistency_model == ConsistencyModel::SspAggr
    }

    fn pushes_rows(&self) -> bool {
        self.config.consistency_model != ConsistencyModel::Ssp
    }

    fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.config.server_idle_milli)
    }

    fn reset_server_idle(&self) -> Option<Duration> {
        (self.aggressive() && self.early_comm_on).then(|| self.idle_interval())
    }

    /// Idle-time partial push; returns how long to wait for the next message
    pub fn server_idle_work(&mut self) -> Result<Option<Duration>> {
        if !self.aggressive() {
            return Ok(None);
        }
        if self.row_send_millis > 1.0 {
            let elapsed = self.send_timer.elapsed().as_secs_f64() * 1000.0;
            if self.row_send_millis > elapsed + 1.0 {
                return Ok(Some(millis(self.row_send_millis - elapsed)));
            }
        }
        if !self.tracker.check_send_all() {
            return Ok(Some(self.idle_interval()));
        }

        let (bus, tracker, id) = (&self.bus, &mut self.tracker, self.id);
        let sent = self
            .server
            .create_send_server_push_row_msgs_partial(|batch| {
                send_push(bus.as_ref(), tracker, id, batch)
            })?;
        if sent == 0 {
            return Ok(Some(self.idle_interval()));
        }
        self.row_send_millis = self.pacing.estimate_trans_millisec(sent);
        self.send_timer = Instant::now();
        debug!(server_id = self.id, sent, millis = self.row_send_millis, "idle push");
        Ok(Some(millis(self.row_send_millis)))
    }

    /// Dispatch one message
    pub fn handle_message(&mut self, sender: ThreadId, envelope: Envelope) -> Result<Flow> {
        match envelope.message {
            Message::ClientShutDown => return self.handle_shut_down_msg(),
            Message::CreateTable { table_id, info } => {
                self.handle_create_table(sender, table_id, info)?
            }
            Message::RowRequest {
                table_id,
                row_id,
                clock,
                ..
            } => self.handle_row_request(sender, table_id, row_id, clock)?,
            Message::ClientSendOpLog {
                is_clock,
                version,
                bg_clock,
                payload,
                ..
            } => self.handle_oplog_msg(sender, is_clock, version, bg_clock, &payload)?,
            Message::EarlyCommOn => self.handle_early_comm_on(),
            Message::EarlyCommOff => self.handle_early_comm_off(),
            Message::BgServerPushRowAck { ack_version } => {
                return self.handle_bg_server_push_row_ack(sender, ack_version)
            }
            other => warn!(
                server_id = self.id,
                sender,
                msg = ?other.msg_type(),
                "unexpected message"
            ),
        }
        Ok(Flow::Continue)
    }

    fn handle_shut_down_msg(&mut self) -> Result<Flow> {
        self.num_shutdown_bgs += 1;
        if self.num_shutdown_bgs < self.server.bg_ids().len() {
            return Ok(Flow::Continue);
        }
        if self.pending_clock_push_row || self.tracker.has_pending_acks() {
            debug!(server_id = self.id, "shutdown waits for push acks");
            self.pending_shut_down = true;
            return Ok(Flow::Continue);
        }
        self.send_to_all_bg(Message::ServerShutDownAck)?;
        Ok(Flow::Exit)
    }

    fn handle_create_table(
        &mut self,
        sender: ThreadId,
        table_id: TableId,
        info: TableInfo,
    ) -> Result<()> {
        let staleness = info.table_staleness;
        match self.server.create_table(table_id, info) {
            // every client creates its tables; the first request wins
            Err(ServerError::TableExists(_)) => {
                debug!(server_id = self.id, table_id, bg_id = sender, "table already created")
            }
            other => other?,
        }
        self.min_table_staleness = Some(
            self.min_table_staleness
                .map_or(staleness, |min| min.min(staleness)),
        );
        self.bus.send(
            self.id,
            sender,
            &Envelope::new(Message::CreateTableReply { table_id }),
        )?;
        Ok(())
    }

    fn handle_row_request(
        &mut self,
        sender: ThreadId,
        table_id: TableId,
        row_id: RowId,
        clock: Clock,
    ) -> Result<()> {
        if self.server.min_clock() < clock {
            self.server.add_row_request(sender, table_id, row_id, clock);
            return Ok(());
        }
        self.reply_row_request(sender, table_id, row_id)
    }

    fn reply_row_request(&mut self, bg_id: ThreadId, table_id: TableId, row_id: RowId) -> Result<()> {
        let reply = self.server.serve_row_request(bg_id, table_id, row_id)?;
        let message = Message::ServerRowRequestReply {
            table_id,
            row_id,
            clock: reply.clock,
            version: reply.version,
            row_data: reply.row_data,
        };
        self.bus.send(self.id, bg_id, &Envelope::new(message))?;
        Ok(())
    }

    fn handle_oplog_msg(
        &mut self,
        sender: ThreadId,
        is_clock: bool,
        version: u32,
        bg_clock: Clock,
        payload: &[u8],
    ) -> Result<()> {
        self.server
            .apply_oplog_update_version(payload, sender, version)?;

        let mut clock_changed = false;
        if is_clock {
            clock_changed = self.server.clock_until(sender, bg_clock);
            if clock_changed {
                for request in self.server.get_fulfilled_row_requests() {
                    self.reply_row_request(request.bg_id, request.table_id, request.row_id)?;
                }
            }
        } else if self.config.suppression_on && self.id == self.config.server_thread_id(0, 0) {
            self.adjust_suppression_level(sender, bg_clock)?;
        }

        if clock_changed && self.pushes_rows() {
            self.server_push_row(true)?;
        }

        let ack = Message::ServerOpLogAck {
            ack_version: self.server.wire_version(sender),
        };
        self.bus.send(self.id, sender, &Envelope::new(ack))?;
        Ok(())
    }

    /// Full push at a clock boundary, deferred while the window is full
    fn server_push_row(&mut self, clock_changed: bool) -> Result<()> {
        if !self.tracker.check_send_all() {
            debug!(server_id = self.id, "clock push waits for acks");
            self.pending_clock_push_row = true;
            return Ok(());
        }
        self.pending_clock_push_row = false;

        let (bus, tracker, id) = (&self.bus, &mut self.tracker, self.id);
        let sent = self
            .server
            .create_send_server_push_row_msgs(clock_changed, |batch| {
                send_push(bus.as_ref(), tracker, id, batch)
            })?;

        let mut left_over = 0.0;
        if self.row_send_millis > 1.0 {
            let elapsed = self.send_timer.elapsed().as_secs_f64() * 1000.0;
            left_over = (self.row_send_millis - elapsed).max(0.0);
        }
        self.row_send_millis = self.pacing.estimate_trans_millisec(sent) + left_over;
        self.send_timer = Instant::now();
        Ok(())
    }

    fn handle_early_comm_on(&mut self) {
        if !self.early_comm_on {
            self.early_comm_on = true;
            self.num_early_comm_off_msgs = 0;
            debug!(server_id = self.id, "early comm on");
        }
    }

    fn handle_early_comm_off(&mut self) {
        self.num_early_comm_off_msgs += 1;
        if self.num_early_comm_off_msgs == self.server.bg_ids().len() {
            self.early_comm_on = false;
            self.num_early_comm_off_msgs = 0;
            debug!(server_id = self.id, "early comm off");
        }
    }

    fn handle_bg_server_push_row_ack(&mut self, sender: ThreadId, ack_version: u32) -> Result<Flow> {
        self.tracker.recv_ack(sender, ack_version);
        if self.pending_clock_push_row && self.tracker.check_send_all() {
            self.server_push_row(true)?;
        }
        if self.pending_shut_down
            && !self.pending_clock_push_row
            && !self.tracker.has_pending_acks()
        {
            self.pending_shut_down = false;
            self.send_to_all_bg(Message::ServerShutDownAck)?;
            return Ok(Flow::Exit);
        }
        Ok(Flow::Continue)
    }

    /// Tell the slowest bg workers to flush sooner when one client leads
    /// the rest by two clocks or more
    fn adjust_suppression_level(&mut self, bg_id: ThreadId, bg_clock: Clock) -> Result<()> {
        let advanced = self
            .client_progress
            .clock(bg_id)
            .is_some_and(|clock| bg_clock > clock);
        if !advanced {
            return Ok(());
        }
        self.client_progress.tick_until(bg_id, bg_clock);
        if !self.client_progress.is_unique_max(bg_id) {
            return Ok(());
        }
        let min_clock = self.client_progress.min_clock();
        if bg_clock - min_clock < 2 {
            return Ok(());
        }
        let laggards: Vec<ThreadId> = self
            .server
            .bg_ids()
            .iter()
            .copied()
            .filter(|id| self.client_progress.clock(*id) == Some(min_clock))
            .collect();
        for laggard in laggards {
            info!(leader = bg_id, bg_id = laggard, bg_clock, min_clock, "adjusting suppression level");
            self.bus.send(
                self.id,
                laggard,
                &Envelope::new(Message::AdjustSuppressionLevel),
            )?;
        }
        Ok(())
    }

    fn send_to_all_bg(&self, message: Message) -> Result<()> {
        let envelope = Envelope::new(message);
        for bg_id in self.server.bg_ids() {
            self.bus.send(self.id, *bg_id, &envelope)?;
        }
        Ok(())
    }
}

fn millis(ms: f64) -> Duration {
    Duration::from_secs_f64(ms.max(0.0) / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logic::ServerTableLogicRegistry;
    use sspps_core::{encode_updates, RowRegistry, DENSE_F32};
    use sspps_oplog::{OpLogSerializer, RowOpLog};
    use sspps_wire::{LocalBus, PushRowReader};
    use std::thread;

    const SERVER: ThreadId = 1;
    const BG: ThreadId = 100;
    const WAIT: Duration = Duration::from_secs(5);

    fn spawn_server(config: PsConfig) -> (Arc<LocalBus>, Endpoint, thread::JoinHandle<Result<()>>) {
        let bus = Arc::new(LocalBus::new());
        let server_ep = bus.register(SERVER);
        let bg_ep = bus.register(BG);
        let config = Arc::new(config);
        let ctx = TableContext::from_config(
            &config,
            Arc::new(RowRegistry::with_builtin()),
            Arc::new(ServerTableLogicRegistry::new()),
        );
        let dyn_bus: Arc<dyn CommBus> = bus.clone();
        let handle = thread::spawn(move || {
            ServerThread::new(SERVER, config, ctx, dyn_bus, server_ep).run()
        });
        (bus, bg_ep, handle)
    }

    fn send(bus: &LocalBus, message: Message) {
        bus.send(BG, SERVER, &Envelope::new(message)).unwrap();
    }

    fn recv(ep: &Endpoint) -> Envelope {
        let (from, envelope) = ep.recv_timeout(WAIT).unwrap().expect("server reply");
        assert_eq!(from, SERVER);
        envelope
    }

    fn oplog(row_id: RowId, values: [f32; 2]) -> Vec<u8> {
        let sample = RowRegistry::with_builtin()
            .create_initialized(DENSE_F32, 2)
            .unwrap();
        let mut op = RowOpLog::dense(sample.as_ref(), 2);
        for (col, v) in values.iter().enumerate() {
            op.inc(sample.as_ref(), col as i32, &encode_updates(&[*v]), 0);
        }
        let mut ser = OpLogSerializer::new();
        ser.append_row_oplog(0, 0, true, row_id, &mut op, sample.as_ref());
        ser.finish().remove(&0).unwrap()
    }

    #[test]
    fn test_server_channel() {
        assert_eq!(server_channel(1), 0);
        assert_eq!(server_channel(1003), 2);
    }

    #[test]
    fn test_session_push_and_deferred_shutdown() {
        let (bus, bg, handle) = spawn_server(PsConfig {
            consistency_model: ConsistencyModel::SspPush,
            ..PsConfig::default()
        });

        send(&bus, Message::ClientConnect { client_id: 0 });
        assert_eq!(recv(&bg).message, Message::ClientStart);

        send(
            &bus,
            Message::CreateTable {
                table_id: 0,
                info: TableInfo::dense(DENSE_F32, 2, 0),
            },
        );
        assert_eq!(recv(&bg).message, Message::CreateTableReply { table_id: 0 });

        // a request for a future clock waits for the clock to advance
        send(
            &bus,
            Message::RowRequest {
                table_id: 0,
                row_id: 5,
                clock: 1,
                forced: false,
            },
        );
        send(
            &bus,
            Message::ClientSendOpLog {
                is_clock: true,
                client_id: 0,
                version: 0,
                bg_clock: 1,
                payload: oplog(5, [1.5, -1.0]),
            },
        );

        match recv(&bg).message {
            Message::ServerRowRequestReply {
                row_id,
                clock,
                version,
                row_data,
                ..
            } => {
                assert_eq!((row_id, clock, version), (5, 1, 0));
                assert_eq!(row_data, encode_updates(&[1.5f32, -1.0]));
            }
            other => panic!("unexpected {other:?}"),
        }

        // the reply subscribed the client, so the dirty row is pushed too
        let push = recv(&bg);
        let seq = push.seq_num;
        match push.message {
            Message::ServerPushRow {
                clock,
                is_clock,
                payload,
                ..
            } => {
                assert_eq!(clock, 1);
                assert!(is_clock);
                let mut reader = PushRowReader::new(&payload);
                let row = reader.next_row().unwrap().unwrap();
                assert_eq!((row.table_id, row.row_id), (0, 5));
                assert_eq!(row.data, encode_updates(&[1.5f32, -1.0]).as_slice());
                assert!(reader.next_row().unwrap().is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(recv(&bg).message, Message::ServerOpLogAck { ack_version: 0 });

        send(&bus, Message::ClientShutDown);
        assert!(bg.recv_timeout(Duration::from_millis(50)).unwrap().is_none());

        send(&bus, Message::BgServerPushRowAck { ack_version: seq });
        assert_eq!(recv(&bg).message, Message::ServerShutDownAck);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_plain_ssp_does_not_push() {
        let (bus, bg, handle) = spawn_server(PsConfig {
            consistency_model: ConsistencyModel::Ssp,
            ..PsConfig::default()
        });
        send(&bus, Message::ClientConnect { client_id: 0 });
        assert_eq!(recv(&bg).message, Message::ClientStart);
        send(
            &bus,
            Message::CreateTable {
                table_id: 0,
                info: TableInfo::dense(DENSE_F32, 2, 0),
            },
        );
        recv(&bg);
        send(
            &bus,
            Message::ClientSendOpLog {
                is_clock: true,
                client_id: 0,
                version: 0,
                bg_clock: 1,
                payload: oplog(2, [1.0, 1.0]),
            },
        );
        assert_eq!(recv(&bg).message, Message::ServerOpLogAck { ack_version: 0 });

        send(&bus, Message::ClientShutDown);
        assert_eq!(recv(&bg).message, Message::ServerShutDownAck);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_version_gap_stops_thread() {
        let (bus, bg, handle) = spawn_server(PsConfig::default());
        send(&bus, Message::ClientConnect { client_id: 0 });
        recv(&bg);
        send(
            &bus,
            Message::ClientSendOpLog {
                is_clock: false,
                client_id: 0,
                version: 3,
                bg_clock: 0,
                payload: Vec::new(),
            },
        );
        let err = handle.join().unwrap().unwrap_err();
        assert!(err.is_protocol());
    }

    #[test]
    fn test_corrupt_oplog_stops_thread() {
        let (bus, bg, handle) = spawn_server(PsConfig::default());
        send(&bus, Message::ClientConnect { client_id: 0 });
        recv(&bg);
        send(
            &bus,
            Message::CreateTable {
                table_id: 0,
                info: TableInfo::dense(DENSE_F32, 2, 0),
            },
        );
        recv(&bg);
        let mut payload = oplog(3, [1.0, 2.0]);
        payload.truncate(payload.len() - 2);
        send(
            &bus,
            Message::ClientSendOpLog {
                is_clock: true,
                client_id: 0,
                version: 0,
                bg_clock: 1,
                payload,
            },
        );
        let err = handle.join().unwrap().unwrap_err();
        assert!(err.is_protocol());
        assert!(bg.recv_timeout(Duration::from_millis(50)).unwrap().is_none());
    }
}

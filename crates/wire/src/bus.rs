//! Message transport
//!
//! `CommBus` is the seam between protocol logic and the network. `LocalBus`
//! implements it in-process with crossbeam channels: every thread registers
//! an `Endpoint` under its `ThreadId`, and sends carry encoded frames so the
//! codec is exercised exactly as over a socket.

use crate::error::{Result, WireError};
use crate::message::Envelope;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use sspps_core::ThreadId;
use std::time::Duration;
use tracing::trace;

type Frame = (ThreadId, Vec<u8>);

/// Point-to-point message delivery between threads
pub trait CommBus: Send + Sync {
    /// Send `envelope` from `from` to `to`; returns the encoded size
    fn send(&self, from: ThreadId, to: ThreadId, envelope: &Envelope) -> Result<usize>;
}

/// Receiving side of a registered thread
#[derive(Debug)]
pub struct Endpoint {
    id: ThreadId,
    rx: Receiver<Frame>,
}

impl Endpoint {
    /// Owner's thread id
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Block for the next message
    pub fn recv(&self) -> Result<(ThreadId, Envelope)> {
        let (from, bytes) = self.rx.recv().map_err(|_| WireError::Disconnected(self.id))?;
        Ok((from, Envelope::decode(&bytes)?))
    }

    /// Wait up to `timeout`; `Ok(None)` on timeout
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<(ThreadId, Envelope)>> {
        match self.rx.recv_timeout(timeout) {
            Ok((from, bytes)) => Ok(Some((from, Envelope::decode(&bytes)?))),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(WireError::Disconnected(self.id)),
        }
    }

    /// Take a message if one is queued
    pub fn try_recv(&self) -> Result<Option<(ThreadId, Envelope)>> {
        match self.rx.try_recv() {
            Ok((from, bytes)) => Ok(Some((from, Envelope::decode(&bytes)?))),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(WireError::Disconnected(self.id)),
        }
    }
}

/// In-process `CommBus`
#[derive(Debug, Default)]
pub struct LocalBus {
    senders: RwLock<FxHashMap<ThreadId, Sender<Frame>>>,
}

impl LocalBus {
    /// Bus with no endpoints
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `id`, replacing any previous endpoint
    pub fn register(&self, id: ThreadId) -> Endpoint {
        let (tx, rx) = channel::unbounded();
        self.senders.write().insert(id, tx);
        Endpoint { id, rx }
    }

    /// Drop `id`'s sender so further sends fail
    pub fn deregister(&self, id: ThreadId) {
        self.senders.write().remove(&id);
    }
}

impl CommBus for LocalBus {
    fn send(&self, from: ThreadId, to: ThreadId, envelope: &Envelope) -> Result<usize> {
        let bytes = envelope.encode()?;
        let len = bytes.len();
        let senders = self.senders.read();
        let tx = senders.get(&to).ok_or(WireError::UnknownDestination(to))?;
        tx.send((from, bytes))
            .map_err(|_| WireError::Disconnected(to))?;
        trace!(from, to, msg = ?envelope.msg_type(), len, "sent");
        Ok(len)
    }
}

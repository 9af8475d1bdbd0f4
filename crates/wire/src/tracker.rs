//! Send / acknowledgement bookkeeping
//!
//! A bg worker or server thread numbers every tracked message it sends to a
//! destination with a consecutive version. The peer acknowledges the highest
//! version it has processed. A destination may have at most `window`
//! unacknowledged messages; `check_send_all` is the backpressure test used
//! before every new round of sends.

use rustc_hash::FxHashMap;
use sspps_core::ThreadId;
use tracing::warn;

#[derive(Debug, Clone, Copy, Default)]
struct DestInfo {
    /// Next version to assign
    next_version: u32,
    /// Number of versions acknowledged (all versions below this)
    acked: u32,
}

impl DestInfo {
    fn outstanding(&self) -> u32 {
        self.next_version - self.acked
    }
}

/// Per-destination sliding window of unacknowledged messages
#[derive(Debug, Clone)]
pub struct MsgTracker {
    window: u32,
    dests: FxHashMap<ThreadId, DestInfo>,
}

impl MsgTracker {
    /// Tracker allowing `window` outstanding messages per destination
    pub fn new(window: u32) -> Self {
        Self {
            window: window.max(1),
            dests: FxHashMap::default(),
        }
    }

    /// Start tracking `dest`
    pub fn add_dest(&mut self, dest: ThreadId) {
        self.dests.entry(dest).or_default();
    }

    /// Whether another message may go to `dest`
    pub fn check_send(&self, dest: ThreadId) -> bool {
        self.dests
            .get(&dest)
            .map_or(true, |info| info.outstanding() < self.window)
    }

    /// Whether another message may go to every destination
    pub fn check_send_all(&self) -> bool {
        self.dests
            .values()
            .all(|info| info.outstanding() < self.window)
    }

    /// Assign the next version for `dest` and count it as outstanding
    pub fn record_send(&mut self, dest: ThreadId) -> u32 {
        let info = self.dests.entry(dest).or_default();
        let version = info.next_version;
        info.next_version = info.next_version.wrapping_add(1);
        version
    }

    /// Acknowledge every version up to and including `ack_version`
    ///
    /// Stale or out-of-range acks are ignored.
    pub fn recv_ack(&mut self, dest: ThreadId, ack_version: u32) {
        let Some(info) = self.dests.get_mut(&dest) else {
            warn!(dest, ack_version, "ack from untracked destination");
            return;
        };
        let acked = ack_version.wrapping_add(1);
        if acked > info.next_version {
            warn!(dest, ack_version, sent = info.next_version, "ack ahead of sends");
            return;
        }
        if acked > info.acked {
            info.acked = acked;
        }
    }

    /// Unacknowledged messages to `dest`
    pub fn outstanding(&self, dest: ThreadId) -> u32 {
        self.dests.get(&dest).map_or(0, DestInfo::outstanding)
    }

    /// Whether any destination has unacknowledged messages
    pub fn has_pending_acks(&self) -> bool {
        self.dests.values().any(|info| info.outstanding() > 0)
    }

    /// Tracked destinations
    pub fn dests(&self) -> impl Iterator<Item = ThreadId> + '_ {
        self.dests.keys().copied()
    }
}

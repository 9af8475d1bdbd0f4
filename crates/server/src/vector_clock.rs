//! Per-sender clocks and their minimum
//!
//! A server thread advances when the slowest bg worker does. `VectorClock`
//! keeps every registered sender's clock and the cached minimum, and reports
//! when a tick moved that minimum.

use rustc_hash::FxHashMap;
use sspps_core::{Clock, ThreadId};

/// Clock per sender with a cached minimum
#[derive(Debug, Clone, Default)]
pub struct VectorClock {
    clocks: FxHashMap<ThreadId, Clock>,
    min: Clock,
}

impl VectorClock {
    /// Empty vector clock
    pub fn new() -> Self {
        Self::default()
    }

    /// Vector clock with every id at clock 0
    pub fn with_ids(ids: impl IntoIterator<Item = ThreadId>) -> Self {
        let mut clock = Self::new();
        for id in ids {
            clock.add_clock(id, 0);
        }
        clock
    }

    /// Register `id` at `clock`
    ///
    /// The minimum drops if `clock` is below it.
    pub fn add_clock(&mut self, id: ThreadId, clock: Clock) {
        if self.clocks.is_empty() || clock < self.min {
            self.min = clock;
        }
        self.clocks.insert(id, clock);
    }

    /// Advance `id` by one; returns the new minimum if it moved
    ///
    /// # Panics
    ///
    /// If `id` was never registered.
    pub fn tick(&mut self, id: ThreadId) -> Option<Clock> {
        let Some(current) = self.clocks.get(&id).copied() else {
            panic!("tick from unregistered sender {}", id);
        };
        self.tick_until(id, current + 1)
    }

    /// Raise `id` to `clock`; returns the new minimum if it moved
    ///
    /// Clocks never go backwards; a lower `clock` is ignored.
    ///
    /// # Panics
    ///
    /// If `id` was never registered.
    pub fn tick_until(&mut self, id: ThreadId, clock: Clock) -> Option<Clock> {
        let Some(slot) = self.clocks.get_mut(&id) else {
            panic!("tick from unregistered sender {}", id);
        };
        if clock <= *slot {
            return None;
        }
        let was_min = *slot == self.min;
        *slot = clock;
        if !was_min {
            return None;
        }
        let new_min = self.clocks.values().copied().min().unwrap_or(clock);
        if new_min > self.min {
            self.min = new_min;
            Some(new_min)
        } else {
            None
        }
    }

    /// Slowest sender's clock
    pub fn min_clock(&self) -> Clock {
        self.min
    }

    /// Clock of `id`
    pub fn clock(&self, id: ThreadId) -> Option<Clock> {
        self.clocks.get(&id).copied()
    }

    /// Whether `id` alone holds the highest clock
    pub fn is_unique_max(&self, id: ThreadId) -> bool {
        let Some(mine) = self.clock(id) else {
            return false;
        };
        self.clocks
            .iter()
            .all(|(other, clock)| *other == id || *clock < mine)
    }

    /// Number of senders
    pub fn len(&self) -> usize {
        self.clocks.len()
    }

    /// Whether no sender is registered
    pub fn is_empty(&self) -> bool {
        self.clocks.is_empty()
    }
}

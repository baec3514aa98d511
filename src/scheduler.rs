/// Receiver-side delayed playback.
///
/// Each Bell frame is replayed after a fixed per-bell delay from the
/// installation's delay table. Pending strikes sit in a deadline-ordered
/// min-heap; the receiver sleeps until [`Scheduler::next_deadline`] and
/// pops whatever is due. Nothing is coalesced or cancelled.
use heapless::binary_heap::{BinaryHeap, Min};
use heapless::Vec;

use crate::error::{ConfigError, ScheduleError};
use crate::protocol::{BellNumber, Message, MAX_BELLS};

/// Most strikes that can be in flight at once
pub const MAX_PENDING: usize = 32;

/// Per-bell playback delay in ms; index 0 is bell 1.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DelayTable(Vec<u16, MAX_BELLS>);

impl DelayTable {
    pub fn new(delays: &[u16]) -> Result<Self, ConfigError> {
        Vec::from_slice(delays)
            .map(Self)
            .map_err(|_| ConfigError::TooManyBells(MAX_BELLS))
    }

    /// No installed bells: nothing is ever scheduled.
    pub const fn empty() -> Self {
        Self(Vec::new())
    }

    /// Parse a JSON array such as `[100, 250, 400]`.
    pub fn from_json(data: &[u8]) -> Result<Self, ConfigError> {
        let delays: Vec<u16, 16> = serde_json_core::from_slice(data)
            .map(|(d, _)| d)
            .map_err(|_| ConfigError::Malformed)?;
        Self::new(&delays)
    }

    pub fn total_bells(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Delay for bells `1..=total_bells`, `None` otherwise.
    pub fn delay_for(&self, bell: BellNumber) -> Option<u16> {
        let n = bell.get() as usize;
        if n == 0 {
            return None;
        }
        self.0.get(n - 1).copied()
    }
}

/// A playback that has fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StrikeEvent {
    pub bell: BellNumber,
    /// Delay the sensor reported in its Bell frame
    pub predicted_delay_ms: u16,
    pub fired_at_ms: u64,
}

// Field order gives the heap its ordering: deadline, then arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Pending {
    fire_at_ms: u64,
    seq: u32,
    bell: BellNumber,
    predicted_delay_ms: u16,
}

pub struct Scheduler {
    table: DelayTable,
    queue: BinaryHeap<Pending, Min, MAX_PENDING>,
    seq: u32,
}

impl Scheduler {
    pub fn new(table: DelayTable) -> Self {
        Self {
            table,
            queue: BinaryHeap::new(),
            seq: 0,
        }
    }

    pub fn table(&self) -> &DelayTable {
        &self.table
    }

    /// Schedule a strike for `bell` heard at `arrival_ms`. Returns the fire time.
    pub fn schedule(
        &mut self,
        bell: BellNumber,
        predicted_delay_ms: u16,
        arrival_ms: u64,
    ) -> Result<u64, ScheduleError> {
        let delay = self.table.delay_for(bell).ok_or(ScheduleError::NotInstalled(bell))?;
        let fire_at_ms = arrival_ms + delay as u64;
        let pending = Pending {
            fire_at_ms,
            seq: self.seq,
            bell,
            predicted_delay_ms,
        };
        self.queue.push(pending).map_err(|_| ScheduleError::Full)?;
        self.seq = self.seq.wrapping_add(1);
        Ok(fire_at_ms)
    }

    /// Feed a decoded bus message. Only Bell messages are scheduled;
    /// returns whether this one was.
    pub fn handle_message(&mut self, msg: &Message, arrival_ms: u64) -> bool {
        let Message::Bell { bell, delay_ms } = *msg else {
            return false;
        };
        match self.schedule(bell, delay_ms, arrival_ms) {
            Ok(at) => {
                log::debug!("Bell {} scheduled for {} ms", bell, at);
                true
            }
            Err(e @ ScheduleError::Full) => {
                log::warn!("Bell frame discarded: {}", e);
                false
            }
            Err(e) => {
                log::debug!("Bell frame discarded: {}", e);
                false
            }
        }
    }

    /// Next due strike at `now_ms`, earliest first.
    pub fn pop_due(&mut self, now_ms: u64) -> Option<StrikeEvent> {
        if self.queue.peek()?.fire_at_ms > now_ms {
            return None;
        }
        let p = self.queue.pop()?;
        Some(StrikeEvent {
            bell: p.bell,
            predicted_delay_ms: p.predicted_delay_ms,
            fired_at_ms: p.fire_at_ms,
        })
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.peek().map(|p| p.fire_at_ms)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

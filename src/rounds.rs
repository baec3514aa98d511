/// Synthetic rounds for the receiver self-test.
///
/// Rings bells `1..=n` in order at an even interval, with an extra
/// interval after every second row (the handstroke gap), and yields them
/// as Bell messages ready for the scheduler.
use crate::protocol::{BellNumber, Message, MAX_BELLS};

pub const INTERVAL_MS: u64 = 300;

#[derive(Debug, Clone)]
pub struct Rounds {
    bells: u8,
    place: u8,
    rows: u32,
    next_at: u64,
}

impl Rounds {
    /// `None` when there are no bells to ring.
    pub fn new(bells: usize, start_ms: u64) -> Option<Self> {
        if bells == 0 {
            return None;
        }
        Some(Self {
            bells: bells.min(MAX_BELLS) as u8,
            place: 0,
            rows: 0,
            next_at: start_ms,
        })
    }

    pub fn next_at(&self) -> u64 {
        self.next_at
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn pop_due(&mut self, now_ms: u64) -> Option<Message> {
        if now_ms < self.next_at {
            return None;
        }
        let bell = BellNumber::assigned(self.place + 1)?;
        self.place += 1;
        self.next_at += INTERVAL_MS;
        if self.place == self.bells {
            self.place = 0;
            self.rows += 1;
            if self.rows % 2 == 0 {
                self.next_at += INTERVAL_MS;
            }
        }
        Some(Message::Bell { bell, delay_ms: 0 })
    }
}

//! Touch logger: drains fired strikes and persists touches.
//!
//! The scheduler side only ever calls [`offer`], which never blocks; a
//! full queue drops the strike. The logger side blocks on the queue with
//! the idle timeout and closes the open touch when it expires.
//!
//! The logger is the only owner of the touch store. Listings are
//! requested through the same queue so they never see a half-rotated
//! log.
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::time::{Duration, Instant};

use crate::error::StorageError;
use crate::scheduler::StrikeEvent;
use crate::storage::{TouchStore, TouchSummary};
use crate::touch::TouchRecorder;

/// Silence that closes a touch
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Events buffered between scheduler and logger
pub const QUEUE_DEPTH: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogEvent {
    Strike(StrikeEvent),
    ListTouches,
}

pub type LogSender = SyncSender<LogEvent>;
pub type LogReceiver = Receiver<LogEvent>;

pub fn log_queue() -> (LogSender, LogReceiver) {
    sync_channel(QUEUE_DEPTH)
}

/// Non-blocking enqueue. Returns false if the strike was dropped.
pub fn offer(tx: &LogSender, ev: StrikeEvent) -> bool {
    match tx.try_send(LogEvent::Strike(ev)) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            log::warn!("Strike queue full, dropped bell {}", ev.bell);
            false
        }
        Err(TrySendError::Disconnected(_)) => false,
    }
}

/// Ask the logger for a touch listing. Non-blocking like [`offer`].
pub fn request_listing(tx: &LogSender) -> bool {
    match tx.try_send(LogEvent::ListTouches) {
        Ok(()) => true,
        Err(_) => {
            log::warn!("Logger busy, touch listing skipped");
            false
        }
    }
}

pub struct TouchLogger<S> {
    recorder: TouchRecorder,
    store: S,
    touches: usize,
}

impl<S: TouchStore> TouchLogger<S> {
    /// Fails when the touch buffer for `capacity` strikes cannot be
    /// allocated.
    pub fn new(store: S, capacity: usize) -> Result<Self, StorageError> {
        Ok(Self {
            recorder: TouchRecorder::new(capacity)?,
            store,
            touches: 0,
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn recorder(&self) -> &TouchRecorder {
        &self.recorder
    }

    /// Touches persisted so far.
    pub fn touches(&self) -> usize {
        self.touches
    }

    pub fn on_strike(&mut self, ev: &StrikeEvent) {
        if !self.recorder.record(ev) && self.recorder.is_full() {
            log::debug!("Touch buffer full, strike dropped");
        }
    }

    /// Idle timeout: close the open touch, if any.
    pub fn on_idle(&mut self) {
        if self.recorder.is_empty() {
            return;
        }
        let strikes = self.recorder.len();
        match self.store.save(self.recorder.as_bytes()) {
            Ok(()) => {
                self.touches += 1;
                log::info!("Touch saved, {} strikes", strikes);
            }
            Err(e) => log::error!("Touch of {} strikes lost: {}", strikes, e),
        }
        self.recorder.reset();
    }

    /// Drain `rx` until every sender is gone, closing touches after `idle`
    /// without a strike. Listing requests are answered through `on_list`
    /// and do not extend the touch. The open touch is flushed on exit.
    pub fn run<F>(&mut self, rx: &LogReceiver, idle: Duration, mut on_list: F)
    where
        F: FnMut(&[TouchSummary]),
    {
        let mut last_strike: Option<Instant> = None;
        loop {
            let wait = match last_strike {
                Some(at) => idle.saturating_sub(at.elapsed()),
                None => idle,
            };
            if wait.is_zero() {
                self.on_idle();
                last_strike = None;
                continue;
            }
            match rx.recv_timeout(wait) {
                Ok(LogEvent::Strike(ev)) => {
                    self.on_strike(&ev);
                    last_strike = Some(Instant::now());
                }
                Ok(LogEvent::ListTouches) => on_list(&self.store.summaries()),
                Err(RecvTimeoutError::Timeout) => {
                    self.on_idle();
                    last_strike = None;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.on_idle();
                    return;
                }
            }
        }
    }
}

//! Debounce and phase prediction for a single bell sensor.
//!
//! The sensor is active while the bell's magnet is in range. One pass
//! through the field is one activation pulse, possibly with mechanical
//! bounce. Half the pulse width, in milliseconds, approximates the time
//! from the leading edge to bottom dead centre and becomes the delay
//! broadcast on the *next* pass.
//!
//! ```text
//! Idle --activate--> Active --deactivate--> Settling --hold-off--> Idle
//!                       ^                       |
//!                       +------activate---------+
//! ```
//!
//! The FSM is driven by explicit edge and timer events with caller-supplied
//! microsecond timestamps, so it runs the same on firmware and in tests.

/// Bounce absorption window after a deactivation edge
pub const HOLD_OFF_US: u64 = 10_000;
/// Activations ignored for this long after a pass completes
pub const LOCKOUT_US: u64 = 100_000;
/// Upper clamp on the predicted delay
pub const MAX_DELAY_MS: u16 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    pub hold_off_us: u64,
    pub lockout_us: u64,
}

impl DebounceConfig {
    pub const fn new() -> Self {
        Self {
            hold_off_us: HOLD_OFF_US,
            lockout_us: LOCKOUT_US,
        }
    }
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Active { start: u64 },
    Settling { start: u64, stop: u64 },
}

/// Sensor level the FSM is waiting for next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Active,
    Inactive,
}

/// `clamp(elapsed / 2000, 0, 100)`: half the pulse width in ms.
pub fn predict_delay_ms(elapsed_us: u64) -> u16 {
    (elapsed_us / 2000).min(MAX_DELAY_MS as u64) as u16
}

#[derive(Debug, Clone)]
pub struct Debouncer {
    config: DebounceConfig,
    phase: Phase,
    delay_ms: u16,
    locked_until: Option<u64>,
}

impl Debouncer {
    pub const fn new(config: DebounceConfig) -> Self {
        Self {
            config,
            phase: Phase::Idle,
            delay_ms: 0,
            locked_until: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Delay that will be broadcast on the next pass.
    pub fn predicted_delay_ms(&self) -> u16 {
        self.delay_ms
    }

    /// Activation edge. Returns the delay to broadcast when this starts a
    /// new pass, or `None` for bounce and lockout.
    pub fn activate(&mut self, now: u64) -> Option<u16> {
        self.expire_lockout(now);
        if self.locked_until.is_some() {
            return None;
        }
        match self.phase {
            Phase::Idle => {
                self.phase = Phase::Active { start: now };
                Some(self.delay_ms)
            }
            Phase::Active { .. } => None,
            Phase::Settling { start, .. } => {
                self.phase = Phase::Active { start };
                None
            }
        }
    }

    /// Deactivation edge. Starts (or restarts) the hold-off.
    pub fn deactivate(&mut self, now: u64) {
        if let Phase::Active { start } = self.phase {
            self.phase = Phase::Settling { start, stop: now };
        }
    }

    /// Timer event. Completes a pass once the hold-off has elapsed and
    /// returns the newly stored prediction.
    pub fn poll(&mut self, now: u64) -> Option<u16> {
        self.expire_lockout(now);
        let Phase::Settling { start, stop } = self.phase else {
            return None;
        };
        if now < stop.saturating_add(self.config.hold_off_us) {
            return None;
        }
        self.delay_ms = predict_delay_ms(stop.saturating_sub(start));
        self.phase = Phase::Idle;
        if self.config.lockout_us > 0 {
            self.locked_until = Some(now.saturating_add(self.config.lockout_us));
        }
        log::debug!("Pass complete, next delay {} ms", self.delay_ms);
        Some(self.delay_ms)
    }

    /// When `poll` next needs to run.
    pub fn deadline(&self) -> Option<u64> {
        match self.phase {
            Phase::Settling { stop, .. } => Some(stop.saturating_add(self.config.hold_off_us)),
            _ => self.locked_until,
        }
    }

    /// Edge worth waiting for, or `None` while locked out.
    pub fn awaiting(&self) -> Option<Level> {
        match self.phase {
            Phase::Idle if self.locked_until.is_some() => None,
            Phase::Idle | Phase::Settling { .. } => Some(Level::Active),
            Phase::Active { .. } => Some(Level::Inactive),
        }
    }

    fn expire_lockout(&mut self, now: u64) {
        if matches!(self.locked_until, Some(t) if now >= t) {
            self.locked_until = None;
        }
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DebounceConfig::new())
    }
}

/// Bell assignment from the receiver.
///
/// The operator picks the bell number, then swings that one bell:
///
/// 1. All bells must be stationary for [`CHECK_MS`]; any frame fails.
/// 2. IdentRequest goes out; the moving bell answers its next pass with
///    an Ack instead of a strike.
/// 3. That Ack's identity is echoed back in a BellSet for the target bell.
///
/// No Ack within [`SET_TIMEOUT_MS`] fails the attempt.
use crate::error::CommissionError;
use crate::protocol::{BellNumber, Message};

pub const CHECK_MS: u64 = 5_000;
pub const SET_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    CheckingStationary { until: u64 },
    AwaitingAck { until: u64 },
    Done,
}

/// What the receiver should do after feeding the commissioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Idle,
    Send(Message),
    /// Send `set`; the attempt is finished
    Assigned {
        from: BellNumber,
        to: BellNumber,
        set: Message,
    },
    Failed(CommissionError),
}

#[derive(Debug, Clone)]
pub struct Commissioner {
    target: BellNumber,
    state: State,
}

impl Commissioner {
    pub fn new(target: u8, now_ms: u64) -> Result<Self, CommissionError> {
        let target = BellNumber::assigned(target).ok_or(CommissionError::InvalidBell(target))?;
        log::info!("Assigning bell {}: checking all bells are stationary", target);
        Ok(Self {
            target,
            state: State::CheckingStationary {
                until: now_ms + CHECK_MS,
            },
        })
    }

    pub fn target(&self) -> BellNumber {
        self.target
    }

    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Short state name for status reports.
    pub fn state_name(&self) -> &'static str {
        match self.state {
            State::CheckingStationary { .. } => "checking",
            State::AwaitingAck { .. } => "waiting",
            State::Done => "done",
        }
    }

    pub fn deadline(&self) -> Option<u64> {
        match self.state {
            State::CheckingStationary { until } | State::AwaitingAck { until } => Some(until),
            State::Done => None,
        }
    }

    /// Every decoded bus message goes through here while commissioning.
    pub fn on_message(&mut self, msg: &Message) -> Step {
        match self.state {
            State::CheckingStationary { .. } => {
                self.state = State::Done;
                Step::Failed(CommissionError::BellMoving)
            }
            State::AwaitingAck { .. } => match msg {
                Message::Ack { bell, identity } => {
                    self.state = State::Done;
                    Step::Assigned {
                        from: *bell,
                        to: self.target,
                        set: Message::BellSet {
                            bell: self.target,
                            identity: identity.clone(),
                        },
                    }
                }
                _ => Step::Idle,
            },
            State::Done => Step::Idle,
        }
    }

    /// Timer expiry.
    pub fn poll(&mut self, now_ms: u64) -> Step {
        match self.state {
            State::CheckingStationary { until } if now_ms >= until => {
                log::info!("Swing bell {} now", self.target);
                self.state = State::AwaitingAck {
                    until: now_ms + SET_TIMEOUT_MS,
                };
                Step::Send(Message::IdentRequest)
            }
            State::AwaitingAck { until } if now_ms >= until => {
                self.state = State::Done;
                Step::Failed(CommissionError::NoMovement)
            }
            _ => Step::Idle,
        }
    }
}

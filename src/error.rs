/// Error types for every layer of the system.
///
/// None of these are fatal. Control loops log them and move on to the
/// next frame, strike or touch.
use thiserror::Error;

use crate::protocol::BellNumber;

/// A received frame that cannot be turned into a [`Message`](crate::protocol::Message).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("identifier {0:#05x} is outside the 11-bit range")]
    InvalidId(u16),
    #[error("unknown command id {0:#05x}")]
    UnknownCommand(u16),
    #[error("payload of {len} bytes is invalid for id {id:#05x}")]
    PayloadLength { id: u16, len: usize },
}

/// An outgoing frame the bus driver refused. The frame is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transmit buffer busy")]
    Busy,
    #[error("frame not acknowledged")]
    NoAck,
    #[error("controller is bus-off")]
    BusOff,
    #[error("frame cannot be represented by the driver")]
    InvalidFrame,
}

/// Configuration that is missing or unusable. Callers fall back to defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("configuration not present")]
    Missing,
    #[error("configuration storage could not be accessed")]
    Unreadable,
    #[error("malformed configuration")]
    Malformed,
    #[error("settings record has unknown magic or version")]
    BadHeader,
    #[error("settings record checksum mismatch")]
    Checksum,
    #[error("bell number {0} out of range")]
    BellOutOfRange(u8),
    #[error("delay table has more than {0} entries")]
    TooManyBells(usize),
}

/// A Bell frame the scheduler declined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("bell {0} is not part of this installation")]
    NotInstalled(BellNumber),
    #[error("too many strikes pending")]
    Full,
}

/// Why a bell assignment attempt stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommissionError {
    #[error("bell number must be between 1 and 15, got {0}")]
    InvalidBell(u8),
    #[error("bell movement detected, all bells must be stationary")]
    BellMoving,
    #[error("no bell movement detected")]
    NoMovement,
}

/// A failed touch log operation. The touch being written is lost.
#[cfg(feature = "std")]
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("touch log I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("touch record of {0} bytes is not a whole number of entries")]
    Corrupt(usize),
    #[error("no memory for a touch buffer of {0} bytes")]
    OutOfMemory(usize),
}

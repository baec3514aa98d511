/// Console transport: NDJSON reports out, NDJSON commands in.
///
/// The receiver streams every fired strike, node acknowledgement and
/// touch summary as newline-delimited JSON on its console, and accepts
/// commands on the same line-oriented link.
use core::fmt::Write;

use heapless::{String, Vec};
use serde::{Deserialize, Serialize};

use crate::protocol::DeviceIdentity;

/// Firmware version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum size of a serialized JSON message
pub const MAX_MSG_LEN: usize = 256;

/// Buffer type for serialized JSON messages
pub type MsgBuffer = Vec<u8, MAX_MSG_LEN>;

/// Hex rendering of an 8-byte identity
pub type IdString = String<16>;

/// Messages sent from the receiver to the console
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum Report<'a> {
    /// Delayed playback fired
    #[serde(rename = "strike")]
    Strike {
        bell: u8,
        /// Ringing symbol ("1".."9", "0", "E", "T", ...)
        sym: &'a str,
        /// Delay the sensor predicted, ms
        delay: u16,
        /// Receiver uptime in ms when fired
        ts: u64,
    },
    /// A node answered Echo or Ident
    #[serde(rename = "ack")]
    Ack { bell: u8, id: &'a IdString },
    /// Stored touch, newest first
    #[serde(rename = "touch")]
    Touch {
        /// Listing number, 1 is the most recent
        n: u8,
        strikes: u32,
        /// Duration in seconds
        secs: u32,
    },
    /// Bell assignment progress
    #[serde(rename = "commission")]
    Commission {
        /// "checking", "swing", "assigned" or "failed"
        state: &'static str,
        bell: u8,
        /// Bell number the node had before
        #[serde(skip_serializing_if = "Option::is_none")]
        from: Option<u8>,
    },
    /// Receiver status
    #[serde(rename = "status")]
    Status {
        /// Installed bells
        bells: u8,
        /// Strikes waiting to fire
        pending: u8,
        /// Uptime in seconds
        uptime: u32,
        board: &'static str,
        version: &'static str,
    },
}

/// Commands sent from the console to the receiver.
///
/// Deserialized manually via [`RawCommand`] because `serde_json_core`
/// does not support internally tagged enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostCommand {
    /// Ask every node for an Ack
    Echo,
    /// Ask every node to Ack instead of its next strike
    Ident,
    /// Run the assignment procedure for this bell number
    SetBell { bell: u8 },
    /// List stored touches
    Touches,
    /// Request current status
    Status,
}

/// Wire format for console commands, e.g. `{"cmd":"set","bell":3}`.
#[derive(Deserialize)]
struct RawCommand {
    cmd: String<16>,
    #[serde(default)]
    bell: Option<u8>,
}

// ── Serialization helpers ──────────────────────────────────────────────

/// Serialize a Report to JSON bytes followed by a newline.
/// Returns the number of bytes written, or None if serialization failed.
pub fn serialize_report(msg: &Report, buf: &mut [u8]) -> Option<usize> {
    match serde_json_core::to_slice(msg, buf) {
        Ok(len) => {
            // Append newline for NDJSON
            if len < buf.len() {
                buf[len] = b'\n';
                Some(len + 1)
            } else {
                Some(len)
            }
        }
        Err(_) => None,
    }
}

/// Serialize into an owned buffer.
pub fn report_buffer(msg: &Report) -> Option<MsgBuffer> {
    let mut buf = [0u8; MAX_MSG_LEN];
    let len = serialize_report(msg, &mut buf)?;
    Vec::from_slice(&buf[..len]).ok()
}

/// Parse a console command line.
pub fn parse_command(data: &[u8]) -> Option<HostCommand> {
    let trimmed = trim_trailing_whitespace(data);
    if trimmed.is_empty() {
        return None;
    }
    let (raw, _) = serde_json_core::from_slice::<RawCommand>(trimmed).ok()?;
    match raw.cmd.as_str() {
        "echo" => Some(HostCommand::Echo),
        "ident" => Some(HostCommand::Ident),
        "set" => raw.bell.map(|bell| HostCommand::SetBell { bell }),
        "touches" => Some(HostCommand::Touches),
        "status" => Some(HostCommand::Status),
        _ => None,
    }
}

/// Lowercase hex, as printed by the monitor.
pub fn format_identity(id: &DeviceIdentity) -> IdString {
    let mut s = IdString::new();
    // 8 bytes always fit in 16 hex digits
    let _ = write!(s, "{}", id);
    s
}

// ── Serial NDJSON reader ───────────────────────────────────────────────

/// Serial NDJSON reader state machine.
/// Accumulates bytes until a newline is found, then yields the line.
pub struct LineReader {
    buf: [u8; MAX_MSG_LEN],
    pos: usize,
}

impl LineReader {
    pub const fn new() -> Self {
        Self {
            buf: [0; MAX_MSG_LEN],
            pos: 0,
        }
    }

    /// Feed a byte into the reader. Returns a complete line (without newline)
    /// when one is detected.
    pub fn feed(&mut self, byte: u8) -> Option<&[u8]> {
        if byte == b'\n' || byte == b'\r' {
            if self.pos > 0 {
                let line = &self.buf[..self.pos];
                self.pos = 0;
                Some(line)
            } else {
                None
            }
        } else if self.pos < self.buf.len() {
            self.buf[self.pos] = byte;
            self.pos += 1;
            None
        } else {
            // Overflow: discard and reset
            self.pos = 0;
            None
        }
    }
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_trailing_whitespace(data: &[u8]) -> &[u8] {
    let mut end = data.len();
    while end > 0 && matches!(data[end - 1], b' ' | b'\n' | b'\r' | b'\t') {
        end -= 1;
    }
    &data[..end]
}

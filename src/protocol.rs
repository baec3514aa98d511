/// CAN message protocol shared by sensor nodes and the receiver.
///
/// An 11-bit identifier carries a 7-bit command class in its upper bits and
/// a 4-bit bell number in the lower bits. Payloads are at most 8 bytes.
///
/// ```text
/// CMD_MASK   = 0x7F0
/// BELL       = 0x000 | bell    payload: u16 LE delay (ms)
/// ACK        = 0x010 | bell    payload: device identity
/// ECHO_REQ   = 0x080           broadcast
/// IDENT_REQ  = 0x090           broadcast
/// BELL_SET   = 0x0A0 | bell    payload: device identity (must match)
/// ```
use core::fmt;

use heapless::Vec;

use crate::error::ProtocolError;

/// Selects the command class from an identifier
pub const CMD_MASK: u16 = 0x7F0;
/// Selects the bell number from an identifier
pub const BELL_MASK: u16 = 0x00F;
/// Largest standard (11-bit) identifier
pub const MAX_ID: u16 = 0x7FF;
/// Largest classic CAN payload
pub const MAX_PAYLOAD: usize = 8;
/// Bell numbers run 1..=15; 0 means unassigned
pub const MAX_BELLS: usize = 15;

// ── Sensor messages ────────────────────────────────────────────────────

/// Bell passing bottom dead centre
pub const BELL: u16 = 0x000;
/// Sensor acknowledge
pub const ACK: u16 = 0x010;

// ── Receiver messages ──────────────────────────────────────────────────

/// Request all sensors to send ACK
pub const ECHO_REQ: u16 = 0x080;
/// Request all sensors to send ACK instead of their next ding
pub const IDENT_REQ: u16 = 0x090;
/// Set bell number
pub const BELL_SET: u16 = 0x0A0;

/// Frame payload storage
pub type Payload = Vec<u8, MAX_PAYLOAD>;

/// Ringing symbols indexed by bell number (`x` marks an unassigned node).
const BELL_SYMBOLS: &str = "x1234567890ETABC";

/// A raw bus frame: standard identifier plus up to 8 data bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    id: u16,
    data: Payload,
}

impl Frame {
    /// Build a frame, rejecting identifiers above 11 bits and oversized payloads.
    pub fn new(id: u16, data: &[u8]) -> Option<Self> {
        if id > MAX_ID {
            return None;
        }
        let data = Payload::from_slice(data).ok()?;
        Some(Self { id, data })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Bell number carried in the low identifier bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BellNumber(u8);

impl BellNumber {
    /// Wire value used by a node that has never been assigned.
    pub const UNASSIGNED: Self = Self(0);

    /// Any wire value, including unassigned.
    pub const fn new(n: u8) -> Option<Self> {
        if n as usize <= MAX_BELLS {
            Some(Self(n))
        } else {
            None
        }
    }

    /// A real bell, 1..=15.
    pub const fn assigned(n: u8) -> Option<Self> {
        if n >= 1 && n as usize <= MAX_BELLS {
            Some(Self(n))
        } else {
            None
        }
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    pub const fn is_assigned(self) -> bool {
        self.0 != 0
    }

    /// Ringing notation: 1–9, 0 for the tenth, E and T for 11 and 12.
    pub fn symbol(self) -> char {
        BELL_SYMBOLS.as_bytes()[self.0 as usize] as char
    }

    /// [`symbol`](Self::symbol) as a one-character string.
    pub fn symbol_str(self) -> &'static str {
        let i = self.0 as usize;
        &BELL_SYMBOLS[i..i + 1]
    }

    fn from_id(id: u16) -> Self {
        Self((id & BELL_MASK) as u8)
    }
}

impl fmt::Display for BellNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hardware-unique node identity, 1–8 bytes. Gates bell reassignment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity(Payload);

impl DeviceIdentity {
    pub fn new(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() {
            return None;
        }
        Payload::from_slice(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// Decoded bus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Strike broadcast with the sender's predicted delay to dead centre
    Bell { bell: BellNumber, delay_ms: u16 },
    /// Node identification / configuration confirmation
    Ack {
        bell: BellNumber,
        identity: DeviceIdentity,
    },
    /// Every node replies with an Ack
    EchoRequest,
    /// Every node replaces its next strike with an Ack
    IdentRequest,
    /// Assign `bell` to the node whose identity matches
    BellSet {
        bell: BellNumber,
        identity: DeviceIdentity,
    },
}

impl Message {
    /// Short name for log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Bell { .. } => "bell",
            Message::Ack { .. } => "ack",
            Message::EchoRequest => "echo",
            Message::IdentRequest => "ident",
            Message::BellSet { .. } => "set",
        }
    }

    pub fn encode(&self) -> Frame {
        let mut data = Payload::new();
        let id = match self {
            Message::Bell { bell, delay_ms } => {
                let _ = data.extend_from_slice(&delay_ms.to_le_bytes());
                BELL | bell.0 as u16
            }
            Message::Ack { bell, identity } => {
                data = identity.0.clone();
                ACK | bell.0 as u16
            }
            Message::EchoRequest => ECHO_REQ,
            Message::IdentRequest => IDENT_REQ,
            Message::BellSet { bell, identity } => {
                data = identity.0.clone();
                BELL_SET | bell.0 as u16
            }
        };
        Frame { id, data }
    }

    /// Decode a frame. Command classes are tried in the order
    /// Bell, Echo, Ident, Set; anything else is unknown.
    pub fn decode(frame: &Frame) -> Result<Self, ProtocolError> {
        let id = frame.id;
        if id > MAX_ID {
            return Err(ProtocolError::InvalidId(id));
        }
        let bell = BellNumber::from_id(id);

        match id & CMD_MASK {
            BELL => {
                let bytes: [u8; 2] = frame
                    .data()
                    .try_into()
                    .map_err(|_| ProtocolError::PayloadLength {
                        id,
                        len: frame.data.len(),
                    })?;
                Ok(Message::Bell {
                    bell,
                    delay_ms: u16::from_le_bytes(bytes),
                })
            }
            ACK => Ok(Message::Ack {
                bell,
                identity: identity_payload(frame)?,
            }),
            ECHO_REQ => Ok(Message::EchoRequest),
            IDENT_REQ => Ok(Message::IdentRequest),
            BELL_SET => Ok(Message::BellSet {
                bell,
                identity: identity_payload(frame)?,
            }),
            _ => Err(ProtocolError::UnknownCommand(id)),
        }
    }
}

fn identity_payload(frame: &Frame) -> Result<DeviceIdentity, ProtocolError> {
    if frame.data.is_empty() {
        return Err(ProtocolError::PayloadLength {
            id: frame.id,
            len: 0,
        });
    }
    Ok(DeviceIdentity(frame.data.clone()))
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Bell { bell, delay_ms } => {
                write!(f, "DING: bell {}, delay {}", bell, delay_ms)
            }
            Message::Ack { bell, identity } => write!(f, "ACK: bell {}, id {}", bell, identity),
            Message::EchoRequest => f.write_str("ECHO"),
            Message::IdentRequest => f.write_str("IDENT"),
            Message::BellSet { bell, identity } => {
                write!(f, "SET: bell {}, id {}", bell, identity)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new(&[0xE6, 0x61, 0x41, 0x03, 0xE7, 0x5A, 0x2B, 0x21]).unwrap()
    }

    // ── Frame construction ─────────────────────────────────────────

    #[test]
    fn frame_rejects_wide_id() {
        assert!(Frame::new(0x800, &[]).is_none());
        assert!(Frame::new(0x7FF, &[]).is_some());
    }

    #[test]
    fn frame_rejects_long_payload() {
        assert!(Frame::new(0x001, &[0; 9]).is_none());
        assert_eq!(Frame::new(0x001, &[0; 8]).unwrap().data().len(), 8);
    }

    // ── Bell numbers ───────────────────────────────────────────────

    #[test]
    fn bell_number_ranges() {
        assert!(BellNumber::new(0).is_some());
        assert!(BellNumber::new(15).is_some());
        assert!(BellNumber::new(16).is_none());
        assert!(BellNumber::assigned(0).is_none());
        assert!(BellNumber::assigned(1).is_some());
        assert!(BellNumber::assigned(16).is_none());
        assert!(!BellNumber::UNASSIGNED.is_assigned());
    }

    #[test]
    fn bell_symbols_follow_ringing_notation() {
        let sym = |n| BellNumber::new(n).unwrap().symbol();
        assert_eq!(sym(0), 'x');
        assert_eq!(sym(1), '1');
        assert_eq!(sym(9), '9');
        assert_eq!(sym(10), '0');
        assert_eq!(sym(11), 'E');
        assert_eq!(sym(12), 'T');
        assert_eq!(sym(15), 'C');
        assert_eq!(BellNumber::new(11).unwrap().symbol_str(), "E");
    }

    #[test]
    fn empty_identity_rejected() {
        assert!(DeviceIdentity::new(&[]).is_none());
        assert!(DeviceIdentity::new(&[0; 9]).is_none());
    }

    // ── Encoding ───────────────────────────────────────────────────

    #[test]
    fn bell_encodes_id_and_le_delay() {
        let msg = Message::Bell {
            bell: BellNumber::new(3).unwrap(),
            delay_ms: 0x1234,
        };
        let frame = msg.encode();
        assert_eq!(frame.id(), 0x003);
        assert_eq!(frame.data(), &[0x34, 0x12]);
    }

    #[test]
    fn commands_encode_to_fixed_ids() {
        assert_eq!(Message::EchoRequest.encode().id(), 0x080);
        assert_eq!(Message::IdentRequest.encode().id(), 0x090);
        assert!(Message::EchoRequest.encode().data().is_empty());

        let set = Message::BellSet {
            bell: BellNumber::new(7).unwrap(),
            identity: identity(),
        };
        let frame = set.encode();
        assert_eq!(frame.id(), 0x0A7);
        assert_eq!(frame.data(), identity().as_bytes());

        let ack = Message::Ack {
            bell: BellNumber::new(12).unwrap(),
            identity: identity(),
        };
        assert_eq!(ack.encode().id(), 0x01C);
    }

    #[test]
    fn bell_survives_encode_decode_for_every_bell_and_delay() {
        for b in 1..=15u8 {
            let bell = BellNumber::assigned(b).unwrap();
            for delay_ms in 0..=u16::MAX {
                let frame = Message::Bell { bell, delay_ms }.encode();
                match Message::decode(&frame) {
                    Ok(Message::Bell { bell: got, delay_ms: d }) => {
                        assert_eq!((got.get(), d), (b, delay_ms))
                    }
                    other => panic!("bell {} delay {}: {:?}", b, delay_ms, other),
                }
            }
        }
    }

    // ── Decoding ───────────────────────────────────────────────────

    #[test]
    fn decode_set_and_ack_carry_identity() {
        let frame = Frame::new(0x0A4, identity().as_bytes()).unwrap();
        match Message::decode(&frame).unwrap() {
            Message::BellSet { bell, identity: id } => {
                assert_eq!(bell.get(), 4);
                assert_eq!(id, identity());
            }
            other => panic!("decoded {other:?}"),
        }

        let frame = Frame::new(0x015, identity().as_bytes()).unwrap();
        assert!(matches!(
            Message::decode(&frame).unwrap(),
            Message::Ack { bell, .. } if bell.get() == 5
        ));
    }

    #[test]
    fn broadcast_commands_ignore_low_bits() {
        let frame = Frame::new(0x08F, &[]).unwrap();
        assert_eq!(Message::decode(&frame).unwrap(), Message::EchoRequest);
        let frame = Frame::new(0x093, &[1, 2]).unwrap();
        assert_eq!(Message::decode(&frame).unwrap(), Message::IdentRequest);
    }

    #[test]
    fn decode_unknown_command() {
        let frame = Frame::new(0x0B0, &[]).unwrap();
        assert_eq!(
            Message::decode(&frame),
            Err(ProtocolError::UnknownCommand(0x0B0))
        );
        let frame = Frame::new(0x700, &[]).unwrap();
        assert!(matches!(
            Message::decode(&frame),
            Err(ProtocolError::UnknownCommand(_))
        ));
    }

    #[test]
    fn decode_bell_with_wrong_payload_length() {
        for data in [&[][..], &[1][..], &[1, 2, 3][..]] {
            let frame = Frame::new(0x002, data).unwrap();
            assert_eq!(
                Message::decode(&frame),
                Err(ProtocolError::PayloadLength {
                    id: 0x002,
                    len: data.len()
                })
            );
        }
    }

    #[test]
    fn decode_set_without_identity() {
        let frame = Frame::new(0x0A1, &[]).unwrap();
        assert!(matches!(
            Message::decode(&frame),
            Err(ProtocolError::PayloadLength { id: 0x0A1, len: 0 })
        ));
    }

    // ── Display ────────────────────────────────────────────────────

    #[test]
    fn monitor_lines() {
        let ding = Message::Bell {
            bell: BellNumber::new(3).unwrap(),
            delay_ms: 42,
        };
        assert_eq!(ding.to_string(), "DING: bell 3, delay 42");

        let ack = Message::Ack {
            bell: BellNumber::new(2).unwrap(),
            identity: DeviceIdentity::new(&[0xE6, 0x61, 0x0A]).unwrap(),
        };
        assert_eq!(ack.to_string(), "ACK: bell 2, id e6610a");
    }
}

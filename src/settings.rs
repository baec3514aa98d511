/// Persisted per-node settings (the bell assignment).
///
/// Stored as one small record: a fixed header followed by a postcard
/// payload. The header guards against erased flash, foreign data and
/// torn writes.
///
/// ```text
/// offset 0  u32 LE  magic 'BEL1'
/// offset 4  u16 LE  version
/// offset 6  u16 LE  payload length
/// offset 8  u32 LE  CRC-32 of payload
/// offset 12 ..      postcard(NodeSettings)
/// ```
use crc32fast::Hasher;
use embedded_storage::{ReadStorage, Storage};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::protocol::{BellNumber, MAX_BELLS};

pub const RECORD_MAGIC: u32 = u32::from_le_bytes(*b"BEL1");
pub const RECORD_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 12;
/// Header plus the largest payload we ever write
pub const RECORD_MAX_LEN: usize = 32;

/// Erased NOR flash reads back as all ones
const ERASED: u32 = 0xFFFF_FFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeSettings {
    pub bell: u8,
}

fn crc32(data: &[u8]) -> u32 {
    let mut h = Hasher::new();
    h.update(data);
    h.finalize()
}

/// Serialize settings into `out`. Returns the record length.
pub fn encode_record(
    settings: &NodeSettings,
    out: &mut [u8; RECORD_MAX_LEN],
) -> Result<usize, ConfigError> {
    if settings.bell as usize > MAX_BELLS {
        return Err(ConfigError::BellOutOfRange(settings.bell));
    }
    let (header, payload) = out.split_at_mut(HEADER_LEN);
    let len = postcard::to_slice(settings, payload)
        .map_err(|_| ConfigError::Malformed)?
        .len();
    let crc = crc32(&payload[..len]);

    header[0..4].copy_from_slice(&RECORD_MAGIC.to_le_bytes());
    header[4..6].copy_from_slice(&RECORD_VERSION.to_le_bytes());
    header[6..8].copy_from_slice(&(len as u16).to_le_bytes());
    header[8..12].copy_from_slice(&crc.to_le_bytes());
    Ok(HEADER_LEN + len)
}

/// Validate and parse a record.
pub fn decode_record(buf: &[u8]) -> Result<NodeSettings, ConfigError> {
    if buf.len() < HEADER_LEN {
        return Err(ConfigError::Malformed);
    }
    let word = |at: usize| u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]]);
    let half = |at: usize| u16::from_le_bytes([buf[at], buf[at + 1]]);

    let magic = word(0);
    if magic == ERASED {
        return Err(ConfigError::Missing);
    }
    if magic != RECORD_MAGIC || half(4) != RECORD_VERSION {
        return Err(ConfigError::BadHeader);
    }
    let len = half(6) as usize;
    if len == 0 || HEADER_LEN + len > buf.len() || HEADER_LEN + len > RECORD_MAX_LEN {
        return Err(ConfigError::Malformed);
    }
    let payload = &buf[HEADER_LEN..HEADER_LEN + len];
    if crc32(payload) != word(8) {
        return Err(ConfigError::Checksum);
    }

    let settings: NodeSettings = postcard::from_bytes(payload).map_err(|_| ConfigError::Malformed)?;
    if settings.bell as usize > MAX_BELLS {
        return Err(ConfigError::BellOutOfRange(settings.bell));
    }
    Ok(settings)
}

/// Small persistent key-value store holding [`NodeSettings`].
pub trait SettingsStore {
    fn load(&mut self) -> Result<NodeSettings, ConfigError>;
    fn save(&mut self, settings: &NodeSettings) -> Result<(), ConfigError>;
}

/// Load the bell assignment, falling back to unassigned.
pub fn load_bell<S: SettingsStore + ?Sized>(store: &mut S) -> BellNumber {
    let loaded = store
        .load()
        .and_then(|s| BellNumber::new(s.bell).ok_or(ConfigError::BellOutOfRange(s.bell)));
    match loaded {
        Ok(bell) => bell,
        Err(e) => {
            log::warn!("Bell assignment unavailable ({}), using unassigned", e);
            BellNumber::UNASSIGNED
        }
    }
}

/// Settings record at a fixed offset of a flash device.
pub struct FlashSettings<F> {
    flash: F,
    offset: u32,
}

impl<F> FlashSettings<F> {
    pub const fn new(flash: F, offset: u32) -> Self {
        Self { flash, offset }
    }

    pub fn into_inner(self) -> F {
        self.flash
    }
}

impl<F: ReadStorage + Storage> SettingsStore for FlashSettings<F> {
    fn load(&mut self) -> Result<NodeSettings, ConfigError> {
        let mut buf = [0u8; RECORD_MAX_LEN];
        self.flash
            .read(self.offset, &mut buf)
            .map_err(|_| ConfigError::Unreadable)?;
        decode_record(&buf)
    }

    fn save(&mut self, settings: &NodeSettings) -> Result<(), ConfigError> {
        let mut buf = [0xFFu8; RECORD_MAX_LEN];
        let len = encode_record(settings, &mut buf)?;
        self.flash
            .write(self.offset, &buf[..len])
            .map_err(|_| ConfigError::Unreadable)?;
        log::info!("Saved bell assignment {}", settings.bell);
        Ok(())
    }
}

/// Touch recording.
///
/// A touch is a run of strikes with no silence longer than the idle
/// timeout. Each strike is kept as `(bell, offset from first strike)` and
/// the whole touch is persisted as fixed-width little-endian tuples:
///
/// ```text
/// [bell: u8][offset_ms: u32 LE]  repeated, 5 bytes each
/// ```
///
/// The open touch is held in exactly this packed form, so closing it
/// writes the buffer as-is.
use crate::error::StorageError;
use crate::scheduler::StrikeEvent;

pub const ENTRY_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchEntry {
    pub bell: u8,
    pub offset_ms: u32,
}

impl TouchEntry {
    pub fn to_bytes(self) -> [u8; ENTRY_LEN] {
        let o = self.offset_ms.to_le_bytes();
        [self.bell, o[0], o[1], o[2], o[3]]
    }

    pub fn from_bytes(b: [u8; ENTRY_LEN]) -> Self {
        Self {
            bell: b[0],
            offset_ms: u32::from_le_bytes([b[1], b[2], b[3], b[4]]),
        }
    }
}

/// Iterate packed entries. A trailing partial entry is ignored.
pub fn decode_entries(data: &[u8]) -> impl Iterator<Item = TouchEntry> + '_ {
    data.chunks_exact(ENTRY_LEN)
        .map(|c| TouchEntry::from_bytes([c[0], c[1], c[2], c[3], c[4]]))
}

/// The open touch. Storage is reserved once, up front; strikes beyond
/// capacity are dropped until the touch closes.
#[derive(Debug)]
pub struct TouchRecorder {
    buf: Vec<u8>,
    capacity: usize,
    start_ms: Option<u64>,
}

impl TouchRecorder {
    /// Reserve room for `capacity` strikes. Fails instead of aborting
    /// when the heap cannot supply the block.
    pub fn new(capacity: usize) -> Result<Self, StorageError> {
        let bytes = capacity.saturating_mul(ENTRY_LEN);
        let mut buf = Vec::new();
        buf.try_reserve_exact(bytes)
            .map_err(|_| StorageError::OutOfMemory(bytes))?;
        Ok(Self {
            buf,
            capacity,
            start_ms: None,
        })
    }

    /// Add a fired strike. Returns false when it was not recorded.
    pub fn record(&mut self, ev: &StrikeEvent) -> bool {
        if !ev.bell.is_assigned() || self.is_full() {
            return false;
        }
        let start = *self.start_ms.get_or_insert(ev.fired_at_ms);
        let offset = ev.fired_at_ms.saturating_sub(start).min(u32::MAX as u64) as u32;
        let entry = TouchEntry {
            bell: ev.bell.get(),
            offset_ms: offset,
        };
        self.buf.extend_from_slice(&entry.to_bytes());
        true
    }

    /// The filled prefix, in persisted form.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn entries(&self) -> impl Iterator<Item = TouchEntry> + '_ {
        decode_entries(&self.buf)
    }

    pub fn len(&self) -> usize {
        self.buf.len() / ENTRY_LEN
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Start a new touch, keeping the allocation.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.start_ms = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BellNumber;

    fn strike(bell: u8, at: u64) -> StrikeEvent {
        StrikeEvent {
            bell: BellNumber::new(bell).unwrap(),
            predicted_delay_ms: 0,
            fired_at_ms: at,
        }
    }

    fn recorder(capacity: usize) -> TouchRecorder {
        TouchRecorder::new(capacity).unwrap()
    }

    fn entry(bell: u8, offset_ms: u32) -> TouchEntry {
        TouchEntry { bell, offset_ms }
    }

    // ── Entry format ───────────────────────────────────────────────

    #[test]
    fn entry_is_five_le_bytes() {
        let e = TouchEntry {
            bell: 12,
            offset_ms: 0x0102_0304,
        };
        assert_eq!(e.to_bytes(), [12, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(TouchEntry::from_bytes(e.to_bytes()), e);
    }

    #[test]
    fn decode_ignores_trailing_partial_entry() {
        let e: Vec<TouchEntry> = decode_entries(&[7, 1, 0, 0, 0, 2]).collect();
        assert_eq!(e, vec![entry(7, 1)]);
    }

    // ── Recorder ───────────────────────────────────────────────────

    #[test]
    fn buffer_holds_five_bytes_per_strike() {
        let mut r = recorder(21_600);
        assert_eq!(r.buf.capacity(), 21_600 * ENTRY_LEN);

        r.record(&strike(4, 1_000));
        r.record(&strike(5, 1_258));
        assert_eq!(r.as_bytes(), &[4, 0, 0, 0, 0, 5, 2, 1, 0, 0]);
        assert_eq!(r.buf.capacity(), 21_600 * ENTRY_LEN);
    }

    #[test]
    fn impossible_capacity_is_an_error() {
        assert!(matches!(
            TouchRecorder::new(usize::MAX / 2),
            Err(StorageError::OutOfMemory(_))
        ));
    }

    #[test]
    fn offsets_start_at_zero_and_increase() {
        let mut r = recorder(16);
        for (i, bell) in [1, 2, 3, 1, 2, 3].into_iter().enumerate() {
            assert!(r.record(&strike(bell, 10_000 + i as u64 * 250)));
        }
        let offsets: Vec<u32> = r.entries().map(|e| e.offset_ms).collect();
        assert_eq!(offsets, vec![0, 250, 500, 750, 1000, 1250]);
        assert_eq!(r.len(), 6);
        assert_eq!(r.as_bytes().len(), 6 * ENTRY_LEN);
    }

    #[test]
    fn unassigned_bell_not_recorded() {
        let mut r = recorder(4);
        assert!(!r.record(&strike(0, 5)));
        assert!(r.is_empty());
        assert!(r.record(&strike(1, 100)));
        assert_eq!(r.entries().next().unwrap().offset_ms, 0);
    }

    #[test]
    fn strikes_beyond_capacity_dropped() {
        let mut r = recorder(3);
        for i in 0..10 {
            r.record(&strike(1, i * 100));
        }
        assert!(r.is_full());
        assert_eq!(r.len(), 3);
        assert_eq!(r.entries().last().unwrap().offset_ms, 200);
    }

    #[test]
    fn reset_starts_new_touch() {
        let mut r = recorder(4);
        r.record(&strike(1, 1_000));
        r.record(&strike(2, 1_300));
        r.reset();
        assert!(r.is_empty());
        r.record(&strike(3, 9_000));
        assert_eq!(r.entries().collect::<Vec<_>>(), vec![entry(3, 0)]);
    }
}

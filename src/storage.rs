/// Rotating touch log on a filesystem.
///
/// One file per touch, `touch00.bin` being the newest. Saving a touch
/// shifts every older file up one slot and discards whatever falls off
/// the end, so the directory never holds more than `depth` touches.
/// The new record is written to a temporary file first and only renamed
/// into slot 0 once complete.
use std::fmt;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::StorageError;
use crate::touch::{TouchEntry, ENTRY_LEN};

pub const DEFAULT_DEPTH: usize = 10;

const TEMP_NAME: &str = "touch.tmp";

/// Owner of the closed touches. Only the logger holds one, so listing
/// never races a rotation.
pub trait TouchStore {
    /// Persist one touch given as packed entries.
    fn save(&mut self, packed: &[u8]) -> Result<(), StorageError>;

    /// Stored touches, newest first.
    fn summaries(&self) -> Vec<TouchSummary>;
}

#[derive(Debug, Clone)]
pub struct TouchLog {
    dir: PathBuf,
    depth: usize,
}

impl TouchLog {
    /// Use `dir` for the log, creating it if needed. Slots beyond `depth`
    /// left by an earlier, deeper configuration are removed.
    pub fn open(dir: impl AsRef<Path>, depth: usize) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let log = Self {
            dir,
            depth: depth.max(1),
        };
        log.remove_stale()?;
        Ok(log)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn slot_path(&self, slot: usize) -> PathBuf {
        self.dir.join(format!("touch{:02}.bin", slot))
    }

    /// Strike count and duration of one slot, read without loading the
    /// whole record. `None` if the slot is empty.
    pub fn summary(&self, slot: usize) -> Result<Option<TouchSummary>, StorageError> {
        let path = self.slot_path(slot);
        if !path.exists() {
            return Ok(None);
        }
        let mut file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len % ENTRY_LEN != 0 {
            return Err(StorageError::Corrupt(len));
        }
        let mut duration_ms = 0;
        if len > 0 {
            let mut last = [0u8; ENTRY_LEN];
            file.seek(SeekFrom::End(-(ENTRY_LEN as i64)))?;
            file.read_exact(&mut last)?;
            duration_ms = TouchEntry::from_bytes(last).offset_ms;
        }
        Ok(Some(TouchSummary {
            slot,
            strikes: len / ENTRY_LEN,
            duration_ms,
        }))
    }

    fn rotate(&self) -> Result<(), StorageError> {
        let last = self.slot_path(self.depth - 1);
        if last.exists() {
            fs::remove_file(&last)?;
        }
        for slot in (0..self.depth - 1).rev() {
            let from = self.slot_path(slot);
            if from.exists() {
                fs::rename(&from, self.slot_path(slot + 1))?;
            }
        }
        Ok(())
    }

    fn remove_stale(&self) -> Result<(), StorageError> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let stale =
                name == TEMP_NAME || parse_slot(name).is_some_and(|slot| slot >= self.depth);
            if stale {
                log::info!("Removing stale touch file {}", name);
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

fn parse_slot(name: &str) -> Option<usize> {
    name.strip_prefix("touch")?.strip_suffix(".bin")?.parse().ok()
}

impl TouchStore for TouchLog {
    fn save(&mut self, packed: &[u8]) -> Result<(), StorageError> {
        if packed.len() % ENTRY_LEN != 0 {
            return Err(StorageError::Corrupt(packed.len()));
        }
        let tmp = self.dir.join(TEMP_NAME);
        let mut file = File::create(&tmp)?;
        file.write_all(packed)?;
        file.sync_all()?;
        drop(file);

        self.rotate()?;
        fs::rename(&tmp, self.slot_path(0))?;
        Ok(())
    }

    /// Unreadable slots are skipped.
    fn summaries(&self) -> Vec<TouchSummary> {
        (0..self.depth)
            .filter_map(|slot| match self.summary(slot) {
                Ok(summary) => summary,
                Err(e) => {
                    log::warn!("Skipping touch slot {}: {}", slot, e);
                    None
                }
            })
            .collect()
    }
}

/// One line of the touch listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TouchSummary {
    pub slot: usize,
    pub strikes: usize,
    pub duration_ms: u32,
}

impl TouchSummary {
    /// Whole seconds, capped at 59:59.
    pub fn secs(&self) -> u32 {
        (self.duration_ms / 1000).min(3599)
    }
}

impl fmt::Display for TouchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.secs();
        write!(f, "Touch {:<2} - {:2}:{:02}", self.slot + 1, secs / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::touch::decode_entries;

    fn touch(bell: u8, strikes: u32) -> Vec<u8> {
        (0..strikes)
            .flat_map(|i| {
                TouchEntry {
                    bell,
                    offset_ms: i * 1000,
                }
                .to_bytes()
            })
            .collect()
    }

    fn first_bell(log: &TouchLog, slot: usize) -> u8 {
        let data = fs::read(log.slot_path(slot)).unwrap();
        let bell = decode_entries(&data).next().unwrap().bell;
        bell
    }

    // ── Rotation ───────────────────────────────────────────────────

    #[test]
    fn newest_touch_in_slot_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TouchLog::open(dir.path(), 3).unwrap();
        log.save(&touch(1, 2)).unwrap();
        log.save(&touch(2, 3)).unwrap();

        assert_eq!(first_bell(&log, 0), 2);
        assert_eq!(first_bell(&log, 1), 1);
        assert!(!log.slot_path(2).exists());
        assert!(!dir.path().join(TEMP_NAME).exists());
    }

    #[test]
    fn deepest_touch_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TouchLog::open(dir.path(), 3).unwrap();
        for bell in 1..=5 {
            log.save(&touch(bell, 1)).unwrap();
        }
        let bells: Vec<u8> = (0..3).map(|s| first_bell(&log, s)).collect();
        assert_eq!(bells, vec![5, 4, 3]);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 3);
    }

    #[test]
    fn record_bytes_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TouchLog::open(dir.path(), 2).unwrap();
        log.save(&[3, 2, 1, 0, 0]).unwrap();
        assert_eq!(fs::read(log.slot_path(0)).unwrap(), vec![3, 2, 1, 0, 0]);
        assert_eq!(log.slot_path(0).file_name().unwrap(), "touch00.bin");
    }

    #[test]
    fn partial_entry_not_saved() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TouchLog::open(dir.path(), 2).unwrap();
        assert!(matches!(log.save(&[1, 2, 3]), Err(StorageError::Corrupt(3))));
        assert!(!log.slot_path(0).exists());
    }

    #[test]
    fn open_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("spiffs").join("log");
        let log = TouchLog::open(&nested, 0).unwrap();
        assert!(nested.is_dir());
        assert_eq!(log.depth(), 1);
    }

    #[test]
    fn shallower_depth_removes_old_slots() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TouchLog::open(dir.path(), 5).unwrap();
        for bell in 1..=5 {
            log.save(&touch(bell, 1)).unwrap();
        }
        fs::write(dir.path().join(TEMP_NAME), [9]).unwrap();
        fs::write(dir.path().join("notes.txt"), "keep").unwrap();

        let log = TouchLog::open(dir.path(), 2).unwrap();
        assert_eq!(log.summaries().len(), 2);
        assert_eq!(first_bell(&log, 1), 4);
        assert!(!log.slot_path(2).exists());
        assert!(!log.slot_path(4).exists());
        assert!(!dir.path().join(TEMP_NAME).exists());
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn write_failure_reports_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TouchLog::open(dir.path().join("log"), 2).unwrap();
        fs::remove_dir(dir.path().join("log")).unwrap();
        assert!(matches!(log.save(&touch(1, 1)), Err(StorageError::Io(_))));
    }

    // ── Listing ────────────────────────────────────────────────────

    #[test]
    fn summaries_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TouchLog::open(dir.path(), 4).unwrap();
        log.save(&touch(1, 61)).unwrap();
        log.save(&touch(2, 4)).unwrap();
        fs::write(log.slot_path(2), [1, 2, 3]).unwrap();

        let list = log.summaries();
        assert_eq!(list.len(), 2);
        assert_eq!(
            list[0],
            TouchSummary {
                slot: 0,
                strikes: 4,
                duration_ms: 3000
            }
        );
        assert_eq!(list[1].strikes, 61);
        assert_eq!(list[0].to_string(), "Touch 1  -  0:03");
        assert_eq!(list[1].to_string(), "Touch 2  -  1:00");
    }

    #[test]
    fn empty_slot_lists_as_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = TouchLog::open(dir.path(), 2).unwrap();
        log.save(&[]).unwrap();
        let s = log.summary(0).unwrap().unwrap();
        assert_eq!((s.strikes, s.duration_ms), (0, 0));
        assert!(log.summary(1).unwrap().is_none());
    }

    #[test]
    fn summary_caps_at_an_hour() {
        let s = TouchSummary {
            slot: 9,
            strikes: 1,
            duration_ms: 7_200_000,
        };
        assert_eq!(s.secs(), 3599);
        assert_eq!(s.to_string(), "Touch 10 - 59:59");
    }
}

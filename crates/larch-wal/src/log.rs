//! Append-only log with persist and checkpoint cadences.

use crate::record::LogRecord;
use larch_common::{Datum, LarchError, Result};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// First line of every log file; skipped on replay.
const HEADER: &str = "Logs:";

/// What the cadence check asks the tree to do after an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Checkpoint,
    Persist,
    Idle,
}

/// The write-ahead log: an in-memory tail of unpersisted records plus an
/// append-mode file.
///
/// `persist` drains the tail to the file; a checkpoint logically retires
/// everything up to its marker record. LSNs in the file are strictly
/// ascending.
pub struct Wal<K, V> {
    tail: Vec<LogRecord<K, V>>,
    file: File,
    path: PathBuf,
    pub persist_every: u64,
    pub checkpoint_every: u64,
    log_counter: u64,
    pub last_persist_lsn: u64,
    pub last_checkpoint_lsn: u64,
    fsync_enabled: bool,
}

impl<K: Datum + Ord, V: Datum> Wal<K, V> {
    /// Opens or creates the log file at `path`.
    ///
    /// Reopening an existing file scans it for the last recorded LSN, which
    /// serves as the persist-LSN fallback until the status file (if any)
    /// overrides it during recovery.
    pub fn open(
        path: impl Into<PathBuf>,
        persist_every: u64,
        checkpoint_every: u64,
        fsync_enabled: bool,
    ) -> Result<Self> {
        let path = path.into();
        let mut last_persist_lsn = 0;

        if path.exists() {
            last_persist_lsn = Self::scan_last_lsn(&path)?;
        } else {
            let mut file = File::create(&path)?;
            writeln!(file, "{}", HEADER)?;
            file.flush()?;
        }

        let file = OpenOptions::new().append(true).open(&path)?;
        Ok(Self {
            tail: Vec::new(),
            file,
            path,
            persist_every,
            checkpoint_every,
            log_counter: 0,
            last_persist_lsn,
            last_checkpoint_lsn: 0,
            fsync_enabled,
        })
    }

    fn scan_last_lsn(path: &Path) -> Result<u64> {
        let reader = BufReader::new(File::open(path)?);
        let mut last = 0;
        for (lineno, line) in reader.lines().enumerate().skip(1) {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = LogRecord::<K, V>::parse_line(&line).map_err(|e| {
                LarchError::LogCorrupted {
                    line: lineno + 1,
                    reason: e.to_string(),
                }
            })?;
            last = record.lsn();
        }
        Ok(last)
    }

    /// The log file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Total number of records ever appended through this handle.
    pub fn log_counter(&self) -> u64 {
        self.log_counter
    }

    /// Number of records waiting in the unpersisted tail.
    pub fn tail_len(&self) -> usize {
        self.tail.len()
    }

    /// Appends a record to the in-memory tail.
    pub fn log(&mut self, record: LogRecord<K, V>) {
        self.tail.push(record);
        self.log_counter += 1;
    }

    /// Writes every tail record with LSN > `last_persist_lsn` to the log
    /// file, flushes it, and clears the tail.
    pub fn persist(&mut self) -> Result<()> {
        for record in &self.tail {
            let lsn = record.lsn();
            if lsn > self.last_persist_lsn {
                writeln!(self.file, "{}", record.encode_line())?;
                self.last_persist_lsn = lsn;
            }
        }
        self.file.flush()?;
        if self.fsync_enabled {
            self.file.sync_all()?;
        }
        tracing::debug!(lsn = self.last_persist_lsn, "persisted log tail");
        self.tail.clear();
        Ok(())
    }

    /// Cadence check performed after every upsert.
    pub fn cadence(&self) -> Cadence {
        if self.log_counter == 0 {
            return Cadence::Idle;
        }
        if self.log_counter % self.checkpoint_every == 0 {
            Cadence::Checkpoint
        } else if self.log_counter % self.persist_every == 0 {
            Cadence::Persist
        } else {
            Cadence::Idle
        }
    }

    /// Reads back every persisted record with LSN in `(after, upto]`.
    ///
    /// Records beyond `upto` were never covered by a persist and are
    /// discarded.
    pub fn read_range(&self, after: u64, upto: u64) -> Result<Vec<LogRecord<K, V>>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut records = Vec::new();

        for (lineno, line) in reader.lines().enumerate().skip(1) {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record = LogRecord::<K, V>::parse_line(&line).map_err(|e| {
                LarchError::LogCorrupted {
                    line: lineno + 1,
                    reason: e.to_string(),
                }
            })?;
            let lsn = record.lsn();
            if lsn > upto {
                break;
            }
            if lsn > after {
                records.push(record);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use larch_common::{Message, MessageKey, Opcode};
    use tempfile::tempdir;

    fn record(lsn: u64, key: u64, value: &str) -> LogRecord<u64, String> {
        LogRecord::new(
            MessageKey::new(key, lsn),
            Message::new(Opcode::Insert, value.to_string()),
        )
    }

    fn open_wal(path: &Path, persist_every: u64, checkpoint_every: u64) -> Wal<u64, String> {
        Wal::open(path, persist_every, checkpoint_every, false).unwrap()
    }

    #[test]
    fn test_wal_creates_file_with_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.logg");
        let _wal = open_wal(&path, 1, 100);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "Logs:\n");
    }

    #[test]
    fn test_wal_log_and_persist() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.logg");
        let mut wal = open_wal(&path, 1, 100);

        wal.log(record(1, 10, "10:"));
        wal.log(record(2, 20, "20:"));
        assert_eq!(wal.tail_len(), 2);

        wal.persist().unwrap();
        assert_eq!(wal.tail_len(), 0);
        assert_eq!(wal.last_persist_lsn, 2);

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("1 10 -> 0 "));
        assert!(lines[2].starts_with("2 20 -> 0 "));
    }

    #[test]
    fn test_wal_persist_skips_already_persisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.logg");
        let mut wal = open_wal(&path, 1, 100);

        wal.log(record(1, 10, "a"));
        wal.persist().unwrap();

        // A stale record sneaking into the tail must not be rewritten.
        wal.log(record(1, 10, "a"));
        wal.log(record(2, 11, "b"));
        wal.persist().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().filter(|l| l.starts_with("1 ")).count(), 1);
    }

    #[test]
    fn test_wal_reopen_scans_last_lsn() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.logg");
        {
            let mut wal = open_wal(&path, 1, 100);
            wal.log(record(1, 10, "a"));
            wal.log(record(2, 20, "b"));
            wal.persist().unwrap();
        }

        let wal = open_wal(&path, 1, 100);
        assert_eq!(wal.last_persist_lsn, 2);
    }

    #[test]
    fn test_wal_cadence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.logg");
        let mut wal = open_wal(&path, 2, 6);

        assert_eq!(wal.cadence(), Cadence::Idle);

        let expected = [
            Cadence::Idle,       // 1
            Cadence::Persist,    // 2
            Cadence::Idle,       // 3
            Cadence::Persist,    // 4
            Cadence::Idle,       // 5
            Cadence::Checkpoint, // 6
        ];
        for (i, want) in expected.iter().enumerate() {
            wal.log(record(i as u64 + 1, 0, "x"));
            assert_eq!(wal.cadence(), *want, "after append {}", i + 1);
        }
    }

    #[test]
    fn test_wal_read_range() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.logg");
        let mut wal = open_wal(&path, 1, 100);

        for lsn in 1..=10 {
            wal.log(record(lsn, lsn * 10, "v"));
        }
        wal.persist().unwrap();

        let records = wal.read_range(3, 7).unwrap();
        let lsns: Vec<_> = records.iter().map(|r| r.lsn()).collect();
        assert_eq!(lsns, vec![4, 5, 6, 7]);
    }

    #[test]
    fn test_wal_read_range_ignores_unpersisted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.logg");
        let mut wal = open_wal(&path, 1, 100);

        wal.log(record(1, 1, "a"));
        wal.persist().unwrap();
        wal.log(record(2, 2, "b")); // still in the tail

        let records = wal.read_range(0, u64::MAX).unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn test_wal_read_range_detects_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.logg");
        {
            let mut wal = open_wal(&path, 1, 100);
            wal.log(record(1, 1, "a"));
            wal.persist().unwrap();
        }
        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str("garbage line\n");
        std::fs::write(&path, &contents).unwrap();

        // The reopen scan trips over the bad line.
        let result = Wal::<u64, String>::open(&path, 1, 100, false);
        assert!(matches!(result, Err(LarchError::LogCorrupted { .. })));
    }
}

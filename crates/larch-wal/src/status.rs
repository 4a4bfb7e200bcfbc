//! Checkpoint status file.

use larch_common::{LarchError, Result};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// The durable summary rewritten at each checkpoint: where the log lives,
/// which object is the tree root, and the persist/checkpoint watermarks.
///
/// Text format, one `<key> <value>` pair per line:
///
/// ```text
/// log_file_path <string>
/// betree_root_id <uint64>
/// persist_lsn <uint64>
/// checkpoint_lsn <uint64>
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub log_file_path: PathBuf,
    pub root_id: u64,
    pub persist_lsn: u64,
    pub checkpoint_lsn: u64,
}

impl Status {
    /// Rewrites the status file at `path`.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut file = File::create(path)?;
        writeln!(file, "log_file_path {}", self.log_file_path.display())?;
        writeln!(file, "betree_root_id {}", self.root_id)?;
        writeln!(file, "persist_lsn {}", self.persist_lsn)?;
        writeln!(file, "checkpoint_lsn {}", self.checkpoint_lsn)?;
        file.flush()?;
        file.sync_all()?;
        Ok(())
    }

    /// Reads the status file back.
    pub fn read(path: &Path) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let mut log_file_path = None;
        let mut root_id = None;
        let mut persist_lsn = None;
        let mut checkpoint_lsn = None;

        for line in reader.lines() {
            let line = line?;
            let Some((key, value)) = line.split_once(' ') else {
                continue;
            };
            match key {
                "log_file_path" => log_file_path = Some(PathBuf::from(value)),
                "betree_root_id" => root_id = Some(parse(key, value)?),
                "persist_lsn" => persist_lsn = Some(parse(key, value)?),
                "checkpoint_lsn" => checkpoint_lsn = Some(parse(key, value)?),
                _ => {}
            }
        }

        let missing = |name: &str| LarchError::Format(format!("status file missing {}", name));
        Ok(Self {
            log_file_path: log_file_path.ok_or_else(|| missing("log_file_path"))?,
            root_id: root_id.ok_or_else(|| missing("betree_root_id"))?,
            persist_lsn: persist_lsn.ok_or_else(|| missing("persist_lsn"))?,
            checkpoint_lsn: checkpoint_lsn.ok_or_else(|| missing("checkpoint_lsn"))?,
        })
    }

    /// Rewrites just the `persist_lsn` line in an existing status file.
    /// A no-op when the file does not exist yet (no checkpoint has run).
    pub fn update_persist_lsn(path: &Path, persist_lsn: u64) -> Result<()> {
        if !path.exists() {
            return Ok(());
        }
        let reader = BufReader::new(File::open(path)?);
        let mut updated = String::new();
        for line in reader.lines() {
            let line = line?;
            if line.starts_with("persist_lsn") {
                updated.push_str(&format!("persist_lsn {}\n", persist_lsn));
            } else {
                updated.push_str(&line);
                updated.push('\n');
            }
        }
        std::fs::write(path, updated)?;
        Ok(())
    }
}

fn parse(key: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| LarchError::Format(format!("status file: bad {} value {:?}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> Status {
        Status {
            log_file_path: PathBuf::from("/tmp/test.logg"),
            root_id: 42,
            persist_lsn: 500,
            checkpoint_lsn: 400,
        }
    }

    #[test]
    fn test_status_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.txt");

        let status = sample();
        status.write(&path).unwrap();
        let read = Status::read(&path).unwrap();
        assert_eq!(read, status);
    }

    #[test]
    fn test_status_file_shape() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.txt");
        sample().write(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines[0], "log_file_path /tmp/test.logg");
        assert_eq!(lines[1], "betree_root_id 42");
        assert_eq!(lines[2], "persist_lsn 500");
        assert_eq!(lines[3], "checkpoint_lsn 400");
    }

    #[test]
    fn test_status_update_persist_lsn() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.txt");
        sample().write(&path).unwrap();

        Status::update_persist_lsn(&path, 777).unwrap();
        let read = Status::read(&path).unwrap();
        assert_eq!(read.persist_lsn, 777);
        // Other fields untouched.
        assert_eq!(read.root_id, 42);
        assert_eq!(read.checkpoint_lsn, 400);
    }

    #[test]
    fn test_status_update_without_file_is_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing.txt");
        Status::update_persist_lsn(&path, 5).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_status_read_missing_field() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("status.txt");
        std::fs::write(&path, "log_file_path /x\npersist_lsn 1\n").unwrap();

        let err = Status::read(&path).unwrap_err();
        assert!(err.to_string().contains("betree_root_id"));
    }
}

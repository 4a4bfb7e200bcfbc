//! One-file-per-object backing store.

use crate::BackingStore;
use bytes::Bytes;
use larch_common::{LarchError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Backing store keeping each (id, version) pair in its own file.
///
/// Files are named `<id>_<version>` inside the data directory. A pair is
/// written exactly once; rewrites go to a fresh version.
pub struct FileBackingStore {
    dir: PathBuf,
    fsync_enabled: bool,
}

impl FileBackingStore {
    /// Creates the store, creating the data directory if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            fsync_enabled: true,
        })
    }

    /// Disables fsync after writes. Useful for tests.
    pub fn without_fsync(mut self) -> Self {
        self.fsync_enabled = false;
        self
    }

    /// Returns the data directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl BackingStore for FileBackingStore {
    fn allocate(&mut self, id: u64, version: u64) -> Result<()> {
        File::create(self.path(id, version))?;
        Ok(())
    }

    fn write(&mut self, id: u64, version: u64, data: &[u8]) -> Result<()> {
        let path = self.path(id, version);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.write_all(data)?;
        if self.fsync_enabled {
            file.sync_all()?;
        }
        tracing::trace!(id, version, bytes = data.len(), "wrote object file");
        Ok(())
    }

    fn read(&self, id: u64, version: u64) -> Result<Bytes> {
        let path = self.path(id, version);
        let mut file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LarchError::ObjectNotFound { id }
            } else {
                LarchError::Io(e)
            }
        })?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(Bytes::from(buf))
    }

    fn path(&self, id: u64, version: u64) -> PathBuf {
        self.dir.join(format!("{}_{}", id, version))
    }
}

//! Configuration structures for LarchDB.

use crate::error::{LarchError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Tuning parameters for the B^ε-tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeConfig {
    /// Hard cap on total node cardinality (pivots + elements) before a
    /// split is considered.
    pub max_node_size: u64,
    /// Minimum buffered-message block size worth flushing to an on-disk
    /// child. Half of this suffices for a clean in-memory child.
    pub min_flush_size: u64,
    /// Minimum node size considered by the small-sibling merge utility.
    pub min_node_size: u64,
    /// Shape parameter in (0, 1): pivot budget is max_node_size^epsilon.
    pub epsilon: f64,
    /// Epsilon adopted when the workload turns write-heavy.
    pub write_heavy_epsilon: f64,
    /// Epsilon adopted when the workload turns read-heavy.
    pub read_heavy_epsilon: f64,
    /// Run the height-reducing rewrite when crossing into read-heavy.
    pub shorten_on_read_heavy: bool,
    /// Initial workload state: 0 = write-heavy, 1-2 = transitional,
    /// 3 = read-heavy, 7 = fixed (adaptivity disabled).
    pub initial_state: u8,
}

impl Default for TreeConfig {
    fn default() -> Self {
        Self {
            max_node_size: 64,
            min_flush_size: 4,  // max_node_size / 16
            min_node_size: 16,  // max_node_size / 4
            epsilon: 0.5,
            write_heavy_epsilon: 0.5,
            read_heavy_epsilon: 0.6,
            shorten_on_read_heavy: false,
            initial_state: 0,
        }
    }
}

impl TreeConfig {
    /// Derives the companion thresholds from a node size cap, using the
    /// same ratios as the defaults.
    pub fn with_max_node_size(max_node_size: u64) -> Self {
        Self {
            max_node_size,
            min_flush_size: (max_node_size / 16).max(1),
            min_node_size: (max_node_size / 4).max(1),
            ..Default::default()
        }
    }

    /// Checks parameter ranges.
    pub fn validate(&self) -> Result<()> {
        if self.max_node_size < 4 {
            return Err(LarchError::InvalidParameter {
                name: "max_node_size".to_string(),
                value: self.max_node_size.to_string(),
            });
        }
        for (name, eps) in [
            ("epsilon", self.epsilon),
            ("write_heavy_epsilon", self.write_heavy_epsilon),
            ("read_heavy_epsilon", self.read_heavy_epsilon),
        ] {
            if !(eps > 0.0 && eps < 1.0) {
                return Err(LarchError::InvalidParameter {
                    name: name.to_string(),
                    value: eps.to_string(),
                });
            }
        }
        if !matches!(self.initial_state, 0..=3 | 7) {
            return Err(LarchError::InvalidParameter {
                name: "initial_state".to_string(),
                value: self.initial_state.to_string(),
            });
        }
        Ok(())
    }
}

/// Storage and durability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory for live node object files.
    pub data_dir: PathBuf,
    /// Directory receiving the checkpoint image of object files.
    pub backup_dir: PathBuf,
    /// Write-ahead log file.
    pub log_file: PathBuf,
    /// Status file rewritten at each checkpoint.
    pub status_file: PathBuf,
    /// Object-metadata table file written at each checkpoint.
    pub objects_file: PathBuf,
    /// Maximum number of node bodies resident in the swap space.
    pub cache_size: u64,
    /// Persist the log tail every this many appends.
    pub persist_every: u64,
    /// Checkpoint every this many appends.
    pub checkpoint_every: u64,
    /// Enable fsync for durability.
    pub fsync_enabled: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./larch-data"),
            backup_dir: PathBuf::from("./larch-data-backup"),
            log_file: PathBuf::from("./larch.logg"),
            status_file: PathBuf::from("./larch-status.txt"),
            objects_file: PathBuf::from("./larch-objects.txt"),
            cache_size: 4,
            persist_every: 64,
            checkpoint_every: 4096,
            fsync_enabled: true,
        }
    }
}

impl StorageConfig {
    /// Roots every path under `dir`, keeping the default file names.
    pub fn rooted_at(dir: &std::path::Path) -> Self {
        Self {
            data_dir: dir.join("data"),
            backup_dir: dir.join("backup"),
            log_file: dir.join("larch.logg"),
            status_file: dir.join("larch-status.txt"),
            objects_file: dir.join("larch-objects.txt"),
            ..Default::default()
        }
    }

    /// Checks parameter ranges.
    pub fn validate(&self) -> Result<()> {
        for (name, v) in [
            ("cache_size", self.cache_size),
            ("persist_every", self.persist_every),
            ("checkpoint_every", self.checkpoint_every),
        ] {
            if v == 0 {
                return Err(LarchError::InvalidParameter {
                    name: name.to_string(),
                    value: v.to_string(),
                });
            }
        }
        Ok(())
    }
}

//! Write-ahead log for LarchDB.
//!
//! Provides durability by logging every upsert before it is applied to the
//! tree, with tunable persist and checkpoint cadences, and the status file
//! that ties a checkpoint image together for recovery.

pub mod log;
pub mod record;
pub mod status;

pub use log::{Cadence, Wal};
pub use record::LogRecord;
pub use status::Status;

//! Workload state for the adaptive shape mechanism.

use larch_common::{LarchError, Result};

/// Where the tree believes the workload sits between write-heavy and
/// read-heavy. The state moves one step at a time as write ratios are
/// reported; `Fixed` disables all transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadState {
    WriteHeavy,
    Transitional1,
    Transitional2,
    ReadHeavy,
    Fixed,
}

impl WorkloadState {
    /// Decodes the numeric form used by configuration and the CLI:
    /// 0-3 for the spectrum, 7 for fixed.
    pub fn from_level(level: u8) -> Result<Self> {
        match level {
            0 => Ok(WorkloadState::WriteHeavy),
            1 => Ok(WorkloadState::Transitional1),
            2 => Ok(WorkloadState::Transitional2),
            3 => Ok(WorkloadState::ReadHeavy),
            7 => Ok(WorkloadState::Fixed),
            _ => Err(LarchError::InvalidParameter {
                name: "state".to_string(),
                value: level.to_string(),
            }),
        }
    }

    /// Position on the write-to-read spectrum, or None for `Fixed`.
    pub fn level(&self) -> Option<u8> {
        match self {
            WorkloadState::WriteHeavy => Some(0),
            WorkloadState::Transitional1 => Some(1),
            WorkloadState::Transitional2 => Some(2),
            WorkloadState::ReadHeavy => Some(3),
            WorkloadState::Fixed => None,
        }
    }
}

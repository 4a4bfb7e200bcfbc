//! LarchDB common types, errors, and utilities.
//!
//! This crate provides shared definitions used across all LarchDB components.

pub mod config;
pub mod error;
pub mod message;
pub mod types;

pub use config::{StorageConfig, TreeConfig};
pub use error::{LarchError, Result};
pub use message::{Message, MessageKey, Opcode};
pub use types::{Combine, Datum};

//! Write-optimized B^ε-tree engine for LarchDB.
//!
//! Each node holds routing pivots plus a buffer of pending messages;
//! mutations enter at the root and ride flush cascades toward the leaves,
//! amortizing I/O. Nodes live in a swap space ([`larch_swap`]) backed by a
//! pluggable store, durability comes from the write-ahead log
//! ([`larch_wal`]), and an adaptive shape mechanism re-tunes the tree
//! between write-heavy and read-heavy workloads.

pub mod cursor;
pub mod node;
pub mod state;
pub mod tree;

pub use cursor::Cursor;
pub use node::{ChildInfo, MessageMap, Node, PivotMap};
pub use state::WorkloadState;
pub use tree::Betree;

//! Backing store for LarchDB node objects.
//!
//! The swap space hands whole serialized node bodies to a [`BackingStore`]
//! keyed by (object id, version). The store promises durability of a write
//! once it returns; it makes no ordering promises between distinct
//! (id, version) pairs.

pub mod file;

pub use file::FileBackingStore;

use bytes::Bytes;
use larch_common::Result;
use std::path::PathBuf;

/// Byte storage keyed by (id, version).
///
/// Versions for a given id are strictly increasing and a written pair is
/// never overwritten; garbage collection of superseded versions is outside
/// this contract.
pub trait BackingStore {
    /// Reserves storage for a new (id, version) pair.
    fn allocate(&mut self, id: u64, version: u64) -> Result<()>;

    /// Writes the full body for an allocated pair. The contents are durable
    /// once this returns.
    fn write(&mut self, id: u64, version: u64, data: &[u8]) -> Result<()>;

    /// Reads back the full body for a pair.
    fn read(&self, id: u64, version: u64) -> Result<Bytes>;

    /// Opaque locator for a pair, used only by the checkpoint copier.
    fn path(&self, id: u64, version: u64) -> PathBuf;
}

//! Object swap space for LarchDB.
//!
//! The swap space caches at most N deserialized node bodies in memory,
//! tracking identity, version, dirtiness, pins, and last access per object.
//! Bodies are faulted in from the backing store on dereference and written
//! back (under a fresh version) when evicted or when the whole tree is
//! flushed for a checkpoint.

pub mod object;
pub mod space;

pub use object::{EncodeCtx, ObjRef, Object, Swappable};
pub use space::SwapSpace;

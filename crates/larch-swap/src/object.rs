//! Swap-space objects and references.

use bytes::{Buf, BufMut, BytesMut};
use larch_common::{LarchError, Result};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

/// Handle to a swap-space object.
///
/// The handle carries only the target id; every operation (dereference, pin,
/// dirty marking) goes through the owning [`SwapSpace`](crate::SwapSpace).
/// Dereference is the operation that may fault the body in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjRef {
    pub(crate) id: u64,
}

impl ObjRef {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Rebuilds a handle from a raw id, e.g. the root id recorded in the
    /// status file.
    pub fn from_id(id: u64) -> Self {
        Self { id }
    }

    /// Serializes the reference as an (id, version) pair, resolving the
    /// current version through the encode context.
    pub fn encode(&self, ctx: &EncodeCtx<'_>, buf: &mut BytesMut) {
        buf.put_u64_le(self.id);
        buf.put_u64_le(ctx.version_of(self.id));
    }

    /// Reads back an (id, version) pair. The version is a hint; the
    /// authoritative version lives in the object table.
    pub fn decode(buf: &mut &[u8]) -> Result<Self> {
        if buf.remaining() < 16 {
            return Err(LarchError::Format("truncated object reference".to_string()));
        }
        let id = buf.get_u64_le();
        let _version = buf.get_u64_le();
        Ok(Self { id })
    }
}

impl std::fmt::Display for ObjRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "obj:{}", self.id)
    }
}

/// Payloads storable in a swap space.
///
/// Embedded [`ObjRef`]s must be encoded through the context so that child
/// references serialize as (id, version) pairs.
pub trait Swappable: Sized {
    fn encode(&self, ctx: &EncodeCtx<'_>, buf: &mut BytesMut) -> Result<()>;

    fn decode(buf: &mut &[u8]) -> Result<Self>;

    /// Metadata hint recorded at writeback time.
    fn is_leaf_hint(&self) -> bool;
}

/// Resolves object ids to their current versions during encoding.
pub struct EncodeCtx<'a> {
    versions: &'a dyn VersionLookup,
}

impl<'a> EncodeCtx<'a> {
    pub(crate) fn new(versions: &'a dyn VersionLookup) -> Self {
        Self { versions }
    }

    /// Current version of `id`, or 0 for memory-only objects.
    pub fn version_of(&self, id: u64) -> u64 {
        self.versions.version_of(id).unwrap_or(0)
    }
}

pub(crate) trait VersionLookup {
    fn version_of(&self, id: u64) -> Option<u64>;
}

impl<P> VersionLookup for BTreeMap<u64, Object<P>> {
    fn version_of(&self, id: u64) -> Option<u64> {
        self.get(&id).map(|o| o.version)
    }
}

/// Cache-table entry: object metadata plus the resident body, if any.
///
/// `version == 0` means the object has only ever lived in memory. The body
/// is shared through `Rc<RefCell<_>>` so tree recursion can hold several
/// distinct nodes mutably at once; the swap space itself is single-threaded.
pub struct Object<P> {
    pub id: u64,
    pub version: u64,
    pub is_leaf: bool,
    pub refcount: u64,
    pub last_access: u64,
    pub dirty: bool,
    pub pincount: u64,
    pub(crate) body: Option<Rc<RefCell<P>>>,
}

impl<P> Object<P> {
    pub fn is_resident(&self) -> bool {
        self.body.is_some()
    }
}

impl<P> std::fmt::Debug for Object<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("is_leaf", &self.is_leaf)
            .field("refcount", &self.refcount)
            .field("last_access", &self.last_access)
            .field("dirty", &self.dirty)
            .field("pincount", &self.pincount)
            .field("resident", &self.is_resident())
            .finish()
    }
}

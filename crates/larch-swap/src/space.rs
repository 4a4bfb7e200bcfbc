//! The swap space: an object cache with writeback.

use crate::object::{EncodeCtx, ObjRef, Object, Swappable};
use bytes::{Buf, BufMut, BytesMut};
use larch_common::{LarchError, Result};
use larch_store::BackingStore;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::rc::Rc;
use sysinfo::System;

/// Caches up to `max_in_memory` object bodies, spilling the least recently
/// used unpinned object to the backing store when the cap is exceeded.
///
/// Object ids are assigned monotonically and never reused within a process
/// lifetime; versions are strictly increasing per id, with version 0
/// meaning "memory only, never written back".
pub struct SwapSpace<P: Swappable> {
    store: Box<dyn BackingStore>,
    max_in_memory: u64,
    objects: BTreeMap<u64, Object<P>>,
    next_id: u64,
    next_access: u64,
    resident: u64,
}

impl<P: Swappable> SwapSpace<P> {
    /// Creates a swap space over `store` holding at most `cache_size`
    /// resident bodies.
    pub fn new(store: Box<dyn BackingStore>, cache_size: u64) -> Self {
        Self {
            store,
            max_in_memory: cache_size.max(1),
            objects: BTreeMap::new(),
            next_id: 1,
            next_access: 1,
            resident: 0,
        }
    }

    /// Creates a swap space sized to 25% of available system RAM, given a
    /// rough per-object footprint in bytes. Minimum 16 objects so the cache
    /// stays useful on low-memory systems.
    pub fn auto_sized(store: Box<dyn BackingStore>, approx_object_bytes: u64) -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let available = sys.available_memory();
        let target = available / 4;
        let cache_size = (target / approx_object_bytes.max(1)).max(16);

        Self::new(store, cache_size)
    }

    /// Changes the resident cap, evicting immediately if it shrank.
    pub fn set_cache_size(&mut self, cache_size: u64) -> Result<()> {
        self.max_in_memory = cache_size.max(1);
        self.maybe_evict_except(None)
    }

    /// Number of objects tracked (resident or not).
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Number of bodies currently resident.
    pub fn resident_count(&self) -> u64 {
        self.resident
    }

    /// Largest id ever assigned, if any object exists.
    pub fn max_id(&self) -> Option<u64> {
        self.objects.keys().next_back().copied()
    }

    /// Recovery hook: restart id assignment at `n`.
    pub fn set_next_id(&mut self, n: u64) {
        self.next_id = n;
    }

    /// Recovery hook: restart the logical access clock at `n`.
    pub fn set_next_access_time(&mut self, n: u64) {
        self.next_access = n;
    }

    fn stamp(&mut self) -> u64 {
        let t = self.next_access;
        self.next_access += 1;
        t
    }

    /// Constructs a new object around `payload`: next id, version 0, dirty,
    /// refcount 1. Nothing is written to the backing store.
    pub fn allocate(&mut self, payload: P) -> Result<ObjRef> {
        let id = self.next_id;
        self.next_id += 1;
        let last_access = self.stamp();

        let object = Object {
            id,
            version: 0,
            is_leaf: payload.is_leaf_hint(),
            refcount: 1,
            last_access,
            dirty: true,
            pincount: 0,
            body: Some(Rc::new(RefCell::new(payload))),
        };
        self.objects.insert(id, object);
        self.resident += 1;

        self.maybe_evict_except(Some(id))?;
        Ok(ObjRef::from_id(id))
    }

    /// Returns the body for `r`, faulting it in from the backing store if it
    /// was evicted. Stamps the access clock and may evict another object.
    pub fn deref(&mut self, r: ObjRef) -> Result<Rc<RefCell<P>>> {
        let id = r.id();
        let (needs_fault, version) = {
            let object = self
                .objects
                .get(&id)
                .ok_or(LarchError::ObjectNotFound { id })?;
            (!object.is_resident(), object.version)
        };

        if needs_fault {
            if version == 0 {
                return Err(LarchError::ObjectNotResident { id });
            }
            let data = self.store.read(id, version)?;
            let payload = decode_frame::<P>(id, version, &data)?;

            let object = self
                .objects
                .get_mut(&id)
                .ok_or(LarchError::ObjectNotFound { id })?;
            object.body = Some(Rc::new(RefCell::new(payload)));
            self.resident += 1;
            tracing::debug!(id, version, "faulted object in");
        }

        let last_access = self.stamp();
        let object = self
            .objects
            .get_mut(&id)
            .ok_or(LarchError::ObjectNotFound { id })?;
        object.last_access = last_access;
        let body = object
            .body
            .clone()
            .ok_or(LarchError::ObjectNotResident { id })?;

        self.maybe_evict_except(Some(id))?;
        Ok(body)
    }

    /// Disables eviction of `r` until the matching `unpin`.
    pub fn pin(&mut self, r: ObjRef) -> Result<()> {
        let object = self
            .objects
            .get_mut(&r.id())
            .ok_or(LarchError::ObjectNotFound { id: r.id() })?;
        object.pincount += 1;
        Ok(())
    }

    /// Re-enables eviction once the pin count reaches zero.
    pub fn unpin(&mut self, r: ObjRef) -> Result<()> {
        let object = self
            .objects
            .get_mut(&r.id())
            .ok_or(LarchError::ObjectNotFound { id: r.id() })?;
        debug_assert!(object.pincount > 0, "unbalanced unpin for object {}", r.id());
        object.pincount = object.pincount.saturating_sub(1);
        Ok(())
    }

    /// Records that the in-memory body diverged from its last writeback.
    pub fn mark_dirty(&mut self, r: ObjRef) -> Result<()> {
        let object = self
            .objects
            .get_mut(&r.id())
            .ok_or(LarchError::ObjectNotFound { id: r.id() })?;
        object.dirty = true;
        Ok(())
    }

    /// O(1) dirtiness check; usable by flush heuristics without faulting.
    pub fn is_dirty(&self, r: ObjRef) -> bool {
        self.objects.get(&r.id()).map_or(false, |o| o.dirty)
    }

    /// O(1) residency check; usable by flush heuristics without faulting.
    pub fn is_in_memory(&self, r: ObjRef) -> bool {
        self.objects.get(&r.id()).map_or(false, |o| o.is_resident())
    }

    /// Drops one reference to `r`, removing the object once unreferenced.
    ///
    /// Callers transfer or clear any child references held by the body
    /// before releasing it; the swap space does not chase embedded refs.
    pub fn release(&mut self, r: ObjRef) {
        let id = r.id();
        let Some(object) = self.objects.get_mut(&id) else {
            return;
        };
        object.refcount = object.refcount.saturating_sub(1);
        if object.refcount == 0 {
            if let Some(object) = self.objects.remove(&id) {
                if object.is_resident() {
                    self.resident -= 1;
                }
                tracing::debug!(id, "released object");
            }
        }
    }

    /// Serializes and writes the body of `id` under a fresh version, if
    /// dirty. The previous version's storage is not reclaimed.
    fn write_back(&mut self, id: u64) -> Result<()> {
        let (body, version, dirty) = {
            let object = self
                .objects
                .get(&id)
                .ok_or(LarchError::ObjectNotFound { id })?;
            (object.body.clone(), object.version, object.dirty)
        };
        let Some(body) = body else {
            return Ok(());
        };
        let is_leaf = body.borrow().is_leaf_hint();

        if dirty {
            let mut buf = BytesMut::new();
            {
                let ctx = EncodeCtx::new(&self.objects);
                body.borrow().encode(&ctx, &mut buf)?;
            }
            let checksum = crc32fast::hash(&buf);
            buf.put_u32_le(checksum);

            let new_version = version + 1;
            self.store.allocate(id, new_version)?;
            self.store.write(id, new_version, &buf)?;
            tracing::debug!(id, version = new_version, "wrote back object");

            let object = self
                .objects
                .get_mut(&id)
                .ok_or(LarchError::ObjectNotFound { id })?;
            object.version = new_version;
            object.dirty = false;
            object.is_leaf = is_leaf;
        } else {
            let object = self
                .objects
                .get_mut(&id)
                .ok_or(LarchError::ObjectNotFound { id })?;
            object.is_leaf = is_leaf;
        }
        Ok(())
    }

    /// Evicts least-recently-used unpinned bodies until the resident count
    /// is back under the cap. Stops quietly if every candidate is pinned;
    /// the count may temporarily exceed the cap.
    fn maybe_evict_except(&mut self, except: Option<u64>) -> Result<()> {
        while self.resident > self.max_in_memory {
            let victim = self
                .objects
                .values()
                .filter(|o| o.is_resident() && o.pincount == 0 && Some(o.id) != except)
                .min_by_key(|o| o.last_access)
                .map(|o| o.id);

            let Some(victim_id) = victim else {
                return Ok(());
            };

            self.write_back(victim_id)?;
            let object = self
                .objects
                .get_mut(&victim_id)
                .ok_or(LarchError::ObjectNotFound { id: victim_id })?;
            object.body = None;
            self.resident -= 1;
            tracing::debug!(id = victim_id, "evicted object");
        }
        Ok(())
    }

    /// Writes back every resident object in LRU order and drops its body,
    /// then copies the current (id, version) file of every written object
    /// into `dest_dir`. Supports the checkpoint's atomic-image requirement.
    pub fn flush_whole_tree(&mut self, dest_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dest_dir)?;

        let mut resident: Vec<(u64, u64)> = self
            .objects
            .values()
            .filter(|o| o.is_resident())
            .map(|o| (o.last_access, o.id))
            .collect();
        resident.sort_unstable();

        for (_, id) in resident {
            self.write_back(id)?;
            let object = self
                .objects
                .get_mut(&id)
                .ok_or(LarchError::ObjectNotFound { id })?;
            object.body = None;
            self.resident -= 1;
        }

        for object in self.objects.values() {
            if object.version > 0 {
                let src = self.store.path(object.id, object.version);
                let dst = dest_dir.join(format!("{}_{}", object.id, object.version));
                std::fs::copy(&src, &dst)?;
            }
        }
        tracing::info!(objects = self.objects.len(), "flushed whole tree");
        Ok(())
    }

    /// Recovery hook: drops every resident body without writing back.
    pub fn clear_lru(&mut self) {
        for object in self.objects.values_mut() {
            object.body = None;
        }
        self.resident = 0;
    }

    /// Persists the object-metadata table (metadata only, no bodies).
    pub fn serialize_objects(&self, path: &Path) -> Result<()> {
        let mut file = std::fs::File::create(path)?;
        for object in self.objects.values() {
            writeln!(file, "obj_id {}", object.id)?;
            writeln!(file, "object->id {}", object.id)?;
            writeln!(file, "object->version {}", object.version)?;
            writeln!(file, "object->is_leaf {}", object.is_leaf as u8)?;
            writeln!(file, "object->refcount {}", object.refcount)?;
            writeln!(file, "object->last_access {}", object.last_access)?;
            writeln!(file, "object->target_is_dirty {}", object.dirty as u8)?;
            writeln!(file, "object->pincount {}", object.pincount)?;
        }
        file.flush()?;
        Ok(())
    }

    /// Replaces the object table with the one recorded at `path`. Bodies
    /// are absent afterwards; the access clock is advanced past the largest
    /// restored stamp so fresh faults do not look ancient.
    pub fn deserialize_objects(&mut self, path: &Path) -> Result<()> {
        let file = std::fs::File::open(path)?;
        let reader = BufReader::new(file);

        self.objects.clear();
        self.resident = 0;

        let mut current: Option<Object<P>> = None;
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            let mut parts = line.split_whitespace();
            let (Some(token), Some(value)) = (parts.next(), parts.next()) else {
                continue;
            };
            let parse = |v: &str| -> Result<u64> {
                v.parse::<u64>().map_err(|e| {
                    LarchError::Format(format!("objects file line {}: {}", lineno + 1, e))
                })
            };

            match token {
                "obj_id" => {
                    if let Some(object) = current.take() {
                        self.objects.insert(object.id, object);
                    }
                    current = Some(Object {
                        id: parse(value)?,
                        version: 0,
                        is_leaf: false,
                        refcount: 0,
                        last_access: 0,
                        dirty: false,
                        pincount: 0,
                        body: None,
                    });
                }
                _ => {
                    let Some(object) = current.as_mut() else {
                        return Err(LarchError::Format(format!(
                            "objects file line {}: field before obj_id",
                            lineno + 1
                        )));
                    };
                    match token {
                        "object->id" => object.id = parse(value)?,
                        "object->version" => object.version = parse(value)?,
                        "object->is_leaf" => object.is_leaf = parse(value)? != 0,
                        "object->refcount" => object.refcount = parse(value)?,
                        "object->last_access" => object.last_access = parse(value)?,
                        "object->target_is_dirty" => object.dirty = parse(value)? != 0,
                        "object->pincount" => object.pincount = parse(value)?,
                        _ => {
                            return Err(LarchError::Format(format!(
                                "objects file line {}: unknown field {}",
                                lineno + 1,
                                token
                            )));
                        }
                    }
                }
            }
        }
        if let Some(object) = current.take() {
            self.objects.insert(object.id, object);
        }

        let max_access = self
            .objects
            .values()
            .map(|o| o.last_access)
            .max()
            .unwrap_or(0);
        if self.next_access <= max_access {
            self.next_access = max_access + 1;
        }
        tracing::info!(objects = self.objects.len(), "restored object table");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn object(&self, id: u64) -> Option<&Object<P>> {
        self.objects.get(&id)
    }
}

/// Strips and verifies the trailing checksum, then decodes the payload.
fn decode_frame<P: Swappable>(id: u64, version: u64, data: &[u8]) -> Result<P> {
    if data.len() < 4 {
        return Err(LarchError::ObjectCorrupted {
            id,
            version,
            reason: "frame shorter than checksum".to_string(),
        });
    }
    let (payload, mut tail) = data.split_at(data.len() - 4);
    let stored = tail.get_u32_le();
    let computed = crc32fast::hash(payload);
    if stored != computed {
        return Err(LarchError::ObjectCorrupted {
            id,
            version,
            reason: format!("checksum mismatch: stored={}, computed={}", stored, computed),
        });
    }
    let mut slice = payload;
    P::decode(&mut slice)
}

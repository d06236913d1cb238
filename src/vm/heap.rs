use std::collections::HashSet;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use tracing::debug;

use super::Value;
use super::bytecode::BytecodeUnit;
use super::method::MethodEntry;
use crate::config::RuntimeConfig;
use crate::error::HeapError;
use crate::gc::barrier::WriteBarrier;
use crate::gc::buffer::allocation_size;

// =============================================================================
// Object layout
// =============================================================================
//
// Every object lives in a slot of the object table and is addressed by a
// stable `ObjRef` handle. Handles survive collection; what moves is the
// byte storage of `Buffer` objects, which is reallocated on every full
// collection unless the buffer (or its owner) is pinned.
//
// +----------------+        +----------------------------+
// | String / Array | -----> | Buffer (capacity bytes)    |
// | len, buffer    |        | relocated by the collector |
// +----------------+        +----------------------------+
//
// Ownership is forward-only: a buffer never knows its owner.

/// Size charged for a bare object header.
pub const OBJECT_HEADER_SIZE: usize = 40;

/// Extra per-object size for the buffer reference of strings and arrays.
pub const BUFFER_EXT_SIZE: usize = 8;

/// Buffers are allocated in multiples of this.
const BUFFER_ALIGN: usize = 8;

/// Heap size at which the first automatic collection runs.
const INITIAL_GC_THRESHOLD: usize = 1024 * 1024;

/// Handle to a managed object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjRef {
    index: u32,
}

impl ObjRef {
    pub fn from_index(index: u32) -> Self {
        Self { index }
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({})", self.index)
    }
}

/// Kind of a managed object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    String,
    Array,
    /// Relocatable backing storage for a string or array.
    Buffer,
    BytecodeUnit,
    MethodEntry,
    /// Opaque metadata with reference fields (JIT tables, roots).
    Metadata,
}

impl ObjectKind {
    /// Whether objects of this kind own a backing buffer.
    pub fn has_buffer(self) -> bool {
        matches!(self, ObjectKind::String | ObjectKind::Array)
    }
}

#[derive(Debug)]
enum Payload {
    None,
    Bytes(Box<[u8]>),
    Unit(Arc<BytecodeUnit>),
    Method(Arc<MethodEntry>),
}

/// A managed object.
#[derive(Debug)]
pub struct HeapObject {
    kind: ObjectKind,
    marked: bool,
    pins: u32,
    /// Forward reference to the backing buffer (strings and arrays).
    buffer: Option<ObjRef>,
    /// Used bytes of the backing buffer.
    len: usize,
    fields: Vec<Value>,
    payload: Payload,
}

impl HeapObject {
    fn new(kind: ObjectKind, fields: usize, payload: Payload) -> Self {
        Self {
            kind,
            marked: false,
            pins: 0,
            buffer: None,
            len: 0,
            fields: vec![Value::Nil; fields],
            payload,
        }
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn buffer(&self) -> Option<ObjRef> {
        self.buffer
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn fields(&self) -> &[Value] {
        &self.fields
    }

    pub fn is_pinned(&self) -> bool {
        self.pins > 0
    }

    pub fn is_marked(&self) -> bool {
        self.marked
    }

    /// The bytecode unit carried by a `BytecodeUnit` object.
    pub fn unit(&self) -> Option<&Arc<BytecodeUnit>> {
        match &self.payload {
            Payload::Unit(unit) => Some(unit),
            _ => None,
        }
    }

    /// The method entry carried by a `MethodEntry` object.
    pub fn method(&self) -> Option<&Arc<MethodEntry>> {
        match &self.payload {
            Payload::Method(me) => Some(me),
            _ => None,
        }
    }

    fn bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Bytes(b) => Some(b),
            _ => None,
        }
    }

    fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.payload {
            Payload::Bytes(b) => Some(b),
            _ => None,
        }
    }

    fn children(&self) -> impl Iterator<Item = ObjRef> + '_ {
        self.buffer
            .into_iter()
            .chain(self.fields.iter().filter_map(Value::as_obj))
    }
}

/// Collector statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub collections: usize,
    pub objects_freed: usize,
    pub buffers_relocated: usize,
}

// =============================================================================
// Heap
// =============================================================================

/// A moving mark-sweep heap with incremental marking.
///
/// Raw byte pointers handed out by [`Heap::buffer_ptr`] stay valid only until
/// the next allocation, which may collect and relocate every unpinned buffer.
pub struct Heap {
    objects: Vec<Option<HeapObject>>,
    free_slots: Vec<u32>,
    bytes_allocated: usize,
    next_gc: usize,
    heap_limit: Option<usize>,
    gc_enabled: bool,
    gc_stress: bool,
    permanent_roots: Vec<ObjRef>,
    permanent_index: HashSet<ObjRef>,
    scoped_roots: Vec<ObjRef>,
    gray: Vec<ObjRef>,
    barrier: Arc<WriteBarrier>,
    stats: HeapStats,
}

impl Heap {
    pub fn new() -> Self {
        Self::with_config(&RuntimeConfig::default())
    }

    pub fn with_config(config: &RuntimeConfig) -> Self {
        Self {
            objects: Vec::new(),
            free_slots: Vec::new(),
            bytes_allocated: 0,
            next_gc: INITIAL_GC_THRESHOLD,
            heap_limit: config.heap_limit,
            gc_enabled: config.gc_enabled,
            gc_stress: config.gc_stress,
            permanent_roots: Vec::new(),
            permanent_index: HashSet::new(),
            scoped_roots: Vec::new(),
            gray: Vec::new(),
            barrier: Arc::new(WriteBarrier::new()),
            stats: HeapStats::default(),
        }
    }

    /// Run a full collection on every allocation.
    pub fn set_gc_stress(&mut self, stress: bool) {
        self.gc_stress = stress;
    }

    /// The write barrier that out-of-line stores must report to.
    pub fn barrier(&self) -> &Arc<WriteBarrier> {
        &self.barrier
    }

    pub fn stats(&self) -> &HeapStats {
        &self.stats
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    // -------------------------------------------------------------------------
    // Allocation
    // -------------------------------------------------------------------------

    /// Allocate a zero-filled buffer of at least `capacity` bytes.
    pub fn alloc_buffer(&mut self, capacity: usize) -> Result<ObjRef, HeapError> {
        let capacity = capacity.div_ceil(BUFFER_ALIGN) * BUFFER_ALIGN;
        let size = OBJECT_HEADER_SIZE + capacity;
        self.prepare_alloc(size)?;
        let bytes = vec![0u8; capacity].into_boxed_slice();
        Ok(self.insert(
            HeapObject::new(ObjectKind::Buffer, 0, Payload::Bytes(bytes)),
            size,
        ))
    }

    /// Allocate an empty string or array with no backing buffer yet.
    pub fn alloc_container(&mut self, kind: ObjectKind) -> Result<ObjRef, HeapError> {
        assert!(kind.has_buffer(), "{kind:?} objects do not own buffers");
        let size = allocation_size(OBJECT_HEADER_SIZE);
        self.prepare_alloc(size)?;
        Ok(self.insert(HeapObject::new(kind, 0, Payload::None), size))
    }

    /// Allocate a metadata object with `fields` reference slots.
    pub fn alloc_object(&mut self, fields: usize) -> Result<ObjRef, HeapError> {
        let size = OBJECT_HEADER_SIZE + fields * 8;
        self.prepare_alloc(size)?;
        Ok(self.insert(
            HeapObject::new(ObjectKind::Metadata, fields, Payload::None),
            size,
        ))
    }

    pub fn alloc_unit(&mut self, unit: Arc<BytecodeUnit>) -> Result<ObjRef, HeapError> {
        self.prepare_alloc(OBJECT_HEADER_SIZE)?;
        Ok(self.insert(
            HeapObject::new(ObjectKind::BytecodeUnit, 0, Payload::Unit(unit)),
            OBJECT_HEADER_SIZE,
        ))
    }

    pub fn alloc_method(&mut self, method: Arc<MethodEntry>) -> Result<ObjRef, HeapError> {
        self.prepare_alloc(OBJECT_HEADER_SIZE)?;
        Ok(self.insert(
            HeapObject::new(ObjectKind::MethodEntry, 0, Payload::Method(method)),
            OBJECT_HEADER_SIZE,
        ))
    }

    /// Trigger collection as needed before allocating `size` bytes.
    ///
    /// Over the heap limit, exactly one full collection runs before the
    /// allocation is retried; a second failure is reported as out of memory.
    fn prepare_alloc(&mut self, size: usize) -> Result<(), HeapError> {
        if self.gc_enabled && (self.gc_stress || self.bytes_allocated + size > self.next_gc) {
            self.collect();
        }

        if let Some(limit) = self.heap_limit
            && self.bytes_allocated + size > limit
        {
            if self.gc_enabled {
                self.collect();
            }
            if self.bytes_allocated + size > limit {
                return Err(HeapError::OutOfMemory {
                    requested: size,
                    allocated: self.bytes_allocated,
                    limit,
                });
            }
        }
        Ok(())
    }

    fn insert(&mut self, mut obj: HeapObject, size: usize) -> ObjRef {
        // Allocate black while a mark is in progress.
        obj.marked = self.barrier.is_marking();
        self.bytes_allocated += size;
        match self.free_slots.pop() {
            Some(index) => {
                self.objects[index as usize] = Some(obj);
                ObjRef::from_index(index)
            }
            None => {
                self.objects.push(Some(obj));
                ObjRef::from_index((self.objects.len() - 1) as u32)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Access
    // -------------------------------------------------------------------------

    pub fn get(&self, r: ObjRef) -> Option<&HeapObject> {
        self.objects.get(r.index as usize)?.as_ref()
    }

    fn get_mut(&mut self, r: ObjRef) -> Result<&mut HeapObject, HeapError> {
        self.objects
            .get_mut(r.index as usize)
            .and_then(Option::as_mut)
            .ok_or(HeapError::InvalidRef(r.index))
    }

    fn get_ref(&self, r: ObjRef) -> Result<&HeapObject, HeapError> {
        self.get(r).ok_or(HeapError::InvalidRef(r.index))
    }

    /// Whether `r` names a live object the collector can mark.
    pub fn is_markable(&self, r: ObjRef) -> bool {
        self.get(r).is_some()
    }

    /// The buffer object holding `r`'s bytes: `r` itself for buffers.
    fn storage_of(&self, r: ObjRef) -> Result<ObjRef, HeapError> {
        let obj = self.get_ref(r)?;
        match obj.kind {
            ObjectKind::Buffer => Ok(r),
            _ => obj.buffer.ok_or(HeapError::NoBuffer(r.index)),
        }
    }

    /// Capacity in bytes of `r`'s storage.
    pub fn capacity(&self, r: ObjRef) -> Result<usize, HeapError> {
        let storage = self.storage_of(r)?;
        Ok(self.get_ref(storage)?.bytes().map_or(0, <[u8]>::len))
    }

    /// Used length of a string or array.
    pub fn length(&self, r: ObjRef) -> Result<usize, HeapError> {
        Ok(self.get_ref(r)?.len)
    }

    pub fn set_length(&mut self, r: ObjRef, len: usize) -> Result<(), HeapError> {
        let capacity = self.capacity(r)?;
        if len > capacity {
            return Err(HeapError::OutOfBounds {
                offset: 0,
                len,
                capacity,
            });
        }
        self.get_mut(r)?.len = len;
        Ok(())
    }

    /// Raw pointer to the first byte of `r`'s storage.
    ///
    /// Valid only until the next operation that can allocate.
    pub fn buffer_ptr(&mut self, r: ObjRef) -> Result<*mut u8, HeapError> {
        let storage = self.storage_of(r)?;
        self.get_mut(storage)?
            .bytes_mut()
            .map(<[u8]>::as_mut_ptr)
            .ok_or(HeapError::NoBuffer(r.index))
    }

    /// Used bytes of a string or array, or the whole block of a buffer.
    pub fn bytes(&self, r: ObjRef) -> Result<&[u8], HeapError> {
        let obj = self.get_ref(r)?;
        let storage = self.get_ref(self.storage_of(r)?)?;
        let bytes = storage.bytes().ok_or(HeapError::NoBuffer(r.index))?;
        Ok(match obj.kind {
            ObjectKind::Buffer => bytes,
            _ => &bytes[..obj.len],
        })
    }

    /// Write `data` at `offset`, extending a container's length as needed.
    pub fn write_bytes(&mut self, r: ObjRef, offset: usize, data: &[u8]) -> Result<(), HeapError> {
        let storage = self.storage_of(r)?;
        let bytes = self
            .get_mut(storage)?
            .bytes_mut()
            .ok_or(HeapError::NoBuffer(r.index))?;
        let end = offset + data.len();
        if end > bytes.len() {
            return Err(HeapError::OutOfBounds {
                offset,
                len: data.len(),
                capacity: bytes.len(),
            });
        }
        bytes[offset..end].copy_from_slice(data);

        let obj = self.get_mut(r)?;
        if obj.kind != ObjectKind::Buffer {
            obj.len = obj.len.max(end);
        }
        Ok(())
    }

    /// Point `target` at `buffer`. The previous buffer becomes garbage.
    pub(crate) fn set_buffer(&mut self, target: ObjRef, buffer: ObjRef) -> Result<(), HeapError> {
        let capacity = self.capacity(buffer)?;
        let obj = self.get_mut(target)?;
        obj.buffer = Some(buffer);
        obj.len = obj.len.min(capacity);
        self.barrier.record_heap_edge(target, Value::Ref(buffer));
        Ok(())
    }

    pub fn field(&self, r: ObjRef, index: usize) -> Option<Value> {
        self.get(r)?.fields.get(index).copied()
    }

    /// Store a reference field through the instrumented path.
    pub fn store_field(&mut self, r: ObjRef, index: usize, value: Value) -> Result<(), HeapError> {
        self.store_field_unbarriered(r, index, value)?;
        self.barrier.record_heap_edge(r, value);
        Ok(())
    }

    /// Store a field without notifying the collector.
    ///
    /// This is what generated code does; it must follow up with
    /// [`WriteBarrier::record_heap_edge`] for every heap reference stored.
    pub fn store_field_unbarriered(
        &mut self,
        r: ObjRef,
        index: usize,
        value: Value,
    ) -> Result<(), HeapError> {
        let obj = self.get_mut(r)?;
        let len = obj.fields.len();
        let slot = obj.fields.get_mut(index).ok_or(HeapError::OutOfBounds {
            offset: index,
            len: 1,
            capacity: len,
        })?;
        *slot = value;
        Ok(())
    }

    /// Visit every live object.
    pub fn each_object(&self, mut f: impl FnMut(ObjRef, &HeapObject)) {
        for (index, slot) in self.objects.iter().enumerate() {
            if let Some(obj) = slot {
                f(ObjRef::from_index(index as u32), obj);
            }
        }
    }

    pub fn object_count(&self) -> usize {
        self.objects.iter().filter(|o| o.is_some()).count()
    }

    // -------------------------------------------------------------------------
    // Roots and pinning
    // -------------------------------------------------------------------------

    /// Make `r` reachable for the life of the heap. Permanent roots are pinned.
    /// Returns false if it was already registered.
    pub fn register_permanent_root(&mut self, r: ObjRef) -> Result<bool, HeapError> {
        self.get_ref(r)?;
        if !self.permanent_index.insert(r) {
            return Ok(false);
        }
        self.permanent_roots.push(r);
        if self.barrier.is_marking() {
            self.shade(r);
        }
        Ok(true)
    }

    pub fn permanent_roots(&self) -> &[ObjRef] {
        &self.permanent_roots
    }

    /// Pin `obj` (if any) until the returned guard is dropped. A pinned object
    /// is reachable and neither it nor its buffer is relocated.
    pub fn pin(&mut self, obj: Option<ObjRef>) -> Pinned<'_> {
        let obj = obj.filter(|r| self.is_markable(*r));
        if let Some(r) = obj
            && let Ok(o) = self.get_mut(r)
        {
            o.pins += 1;
            if self.barrier.is_marking() {
                self.shade(r);
            }
        }
        Pinned { heap: self, obj }
    }

    /// Keep `obj` reachable until the returned guard is dropped. Unlike
    /// [`Heap::pin`], its buffer may still move.
    pub fn keep_alive(&mut self, obj: ObjRef) -> KeepAlive<'_> {
        self.scoped_roots.push(obj);
        if self.barrier.is_marking() {
            self.shade(obj);
        }
        KeepAlive { heap: self, obj }
    }

    fn unpin(&mut self, r: ObjRef) {
        if let Ok(obj) = self.get_mut(r) {
            obj.pins = obj.pins.saturating_sub(1);
        }
    }

    fn release_scoped_root(&mut self, r: ObjRef) {
        if let Some(pos) = self.scoped_roots.iter().rposition(|s| *s == r) {
            self.scoped_roots.remove(pos);
        }
    }

    // -------------------------------------------------------------------------
    // Collection
    // -------------------------------------------------------------------------

    /// Run a complete stop-the-world collection.
    pub fn collect(&mut self) {
        if !self.barrier.is_marking() {
            self.start_marking();
        }
        self.finish_collection();
    }

    /// Begin an incremental mark. Roots are shaded immediately.
    pub fn start_marking(&mut self) {
        for obj in self.objects.iter_mut().flatten() {
            obj.marked = false;
        }
        self.gray.clear();
        self.barrier.set_marking(true);
        self.shade_roots();
    }

    /// Shade permanent roots, then scoped roots, then pinned objects.
    fn shade_roots(&mut self) {
        let mut roots: Vec<ObjRef> = self.permanent_roots.clone();
        roots.extend_from_slice(&self.scoped_roots);
        self.each_object(|r, obj| {
            if obj.is_pinned() {
                roots.push(r);
            }
        });
        for r in roots {
            self.shade(r);
        }
    }

    /// Scan up to `budget` gray objects. Returns true while work remains.
    pub fn mark_step(&mut self, budget: usize) -> bool {
        for _ in 0..budget {
            let Some(r) = self.gray.pop() else { break };
            let children: Vec<ObjRef> = match self.get(r) {
                Some(obj) => obj.children().collect(),
                None => continue,
            };
            for child in children {
                self.shade(child);
            }
        }
        !self.gray.is_empty()
    }

    fn shade(&mut self, r: ObjRef) {
        if let Ok(obj) = self.get_mut(r)
            && !obj.marked
        {
            obj.marked = true;
            self.gray.push(r);
        }
    }

    /// Finish marking (rescanning objects reported by the write barrier),
    /// then sweep and compact.
    pub fn finish_collection(&mut self) {
        // Pins and permanent roots added after `start_marking` may still be white.
        self.shade_roots();
        loop {
            for origin in self.barrier.drain() {
                if self.get(origin).is_some_and(HeapObject::is_marked) {
                    self.gray.push(origin);
                }
            }
            if self.gray.is_empty() {
                break;
            }
            while self.mark_step(usize::MAX) {}
        }
        self.barrier.set_marking(false);

        let freed = self.sweep();
        let relocated = self.compact();
        self.next_gc = (self.bytes_allocated * 2).max(INITIAL_GC_THRESHOLD);
        self.stats.collections += 1;
        self.stats.objects_freed += freed;
        self.stats.buffers_relocated += relocated;
        debug!(
            target: "jitcore::gc",
            freed, relocated, live_bytes = self.bytes_allocated, "collection finished"
        );
    }

    fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for index in 0..self.objects.len() {
            let dead = matches!(&self.objects[index], Some(obj) if !obj.marked);
            if dead {
                if let Some(obj) = self.objects[index].take() {
                    self.bytes_allocated -= Self::footprint(&obj);
                }
                self.free_slots.push(index as u32);
                freed += 1;
            }
        }
        freed
    }

    fn footprint(obj: &HeapObject) -> usize {
        match (&obj.kind, &obj.payload) {
            (ObjectKind::Buffer, Payload::Bytes(b)) => OBJECT_HEADER_SIZE + b.len(),
            (kind, _) if kind.has_buffer() => allocation_size(OBJECT_HEADER_SIZE),
            (ObjectKind::Metadata, _) => OBJECT_HEADER_SIZE + obj.fields.len() * 8,
            _ => OBJECT_HEADER_SIZE,
        }
    }

    /// Move every unpinned buffer to fresh storage.
    fn compact(&mut self) -> usize {
        let mut pinned: HashSet<ObjRef> = HashSet::new();
        for r in &self.permanent_roots {
            pinned.insert(*r);
            if let Some(b) = self.get(*r).and_then(HeapObject::buffer) {
                pinned.insert(b);
            }
        }
        self.each_object(|r, obj| {
            if obj.is_pinned() {
                pinned.insert(r);
                if let Some(b) = obj.buffer {
                    pinned.insert(b);
                }
            }
        });

        let mut relocated = 0;
        for (index, slot) in self.objects.iter_mut().enumerate() {
            let Some(obj) = slot else { continue };
            if pinned.contains(&ObjRef::from_index(index as u32)) {
                continue;
            }
            if let Payload::Bytes(old) = &obj.payload {
                // The new block exists before the old one is freed, so the
                // address always changes.
                let moved: Box<[u8]> = old.to_vec().into_boxed_slice();
                obj.payload = Payload::Bytes(moved);
                relocated += 1;
            }
        }
        relocated
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped pin on a heap object; derefs to the heap so work can continue
/// while the pin is held. Unpins on drop.
pub struct Pinned<'h> {
    heap: &'h mut Heap,
    obj: Option<ObjRef>,
}

impl Deref for Pinned<'_> {
    type Target = Heap;

    fn deref(&self) -> &Heap {
        self.heap
    }
}

impl DerefMut for Pinned<'_> {
    fn deref_mut(&mut self) -> &mut Heap {
        self.heap
    }
}

impl Drop for Pinned<'_> {
    fn drop(&mut self) {
        if let Some(r) = self.obj {
            self.heap.unpin(r);
        }
    }
}

/// Scoped root; derefs to the heap. Released on drop.
pub struct KeepAlive<'h> {
    heap: &'h mut Heap,
    obj: ObjRef,
}

impl Deref for KeepAlive<'_> {
    type Target = Heap;

    fn deref(&self) -> &Heap {
        self.heap
    }
}

impl DerefMut for KeepAlive<'_> {
    fn deref_mut(&mut self) -> &mut Heap {
        self.heap
    }
}

impl Drop for KeepAlive<'_> {
    fn drop(&mut self) {
        self.heap.release_scoped_root(self.obj);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_with(heap: &mut Heap, data: &[u8], capacity: usize) -> ObjRef {
        let s = heap.alloc_container(ObjectKind::String).unwrap();
        let buf = heap.alloc_buffer(capacity).unwrap();
        heap.set_buffer(s, buf).unwrap();
        heap.write_bytes(s, 0, data).unwrap();
        s
    }

    #[test]
    fn test_alloc_buffer_rounds_capacity() {
        let mut heap = Heap::new();
        let buf = heap.alloc_buffer(13).unwrap();
        assert_eq!(heap.capacity(buf).unwrap(), 16);
        assert!(heap.bytes(buf).unwrap().iter().all(|b| *b == 0));
    }

    #[test]
    fn test_write_and_read_container() {
        let mut heap = Heap::new();
        let s = string_with(&mut heap, b"hello", 16);
        assert_eq!(heap.bytes(s).unwrap(), b"hello");
        assert_eq!(heap.length(s).unwrap(), 5);
        assert!(heap.write_bytes(s, 14, b"xyz").is_err());
    }

    #[test]
    fn test_unrooted_objects_are_swept() {
        let mut heap = Heap::new();
        let kept = heap.alloc_object(0).unwrap();
        let dropped = heap.alloc_object(0).unwrap();
        heap.register_permanent_root(kept).unwrap();

        heap.collect();

        assert!(heap.is_markable(kept));
        assert!(!heap.is_markable(dropped));
        assert_eq!(heap.stats().objects_freed, 1);
    }

    #[test]
    fn test_slot_reuse_after_sweep() {
        let mut heap = Heap::new();
        let dead = heap.alloc_object(0).unwrap();
        heap.collect();
        let fresh = heap.alloc_object(0).unwrap();
        assert_eq!(dead.index(), fresh.index());
    }

    #[test]
    fn test_collection_relocates_unpinned_buffers() {
        let mut heap = Heap::new();
        let s = string_with(&mut heap, b"abc", 8);
        let mut heap = heap.keep_alive(s);

        let before = heap.buffer_ptr(s).unwrap() as usize;
        heap.collect();
        let after = heap.buffer_ptr(s).unwrap() as usize;

        assert_ne!(before, after);
        assert_eq!(heap.bytes(s).unwrap(), b"abc");
    }

    #[test]
    fn test_pinned_buffer_does_not_move() {
        let mut heap = Heap::new();
        let s = string_with(&mut heap, b"abc", 8);
        let mut pinned = heap.pin(Some(s));

        let before = pinned.buffer_ptr(s).unwrap() as usize;
        pinned.collect();
        let after = pinned.buffer_ptr(s).unwrap() as usize;

        assert_eq!(before, after);
        drop(pinned);
        assert!(!heap.get(s).unwrap().is_pinned());
    }

    #[test]
    fn test_guards_taken_while_marking_keep_objects() {
        let mut heap = Heap::new();
        let kept = string_with(&mut heap, b"kept", 8);
        let pinned = string_with(&mut heap, b"pinned", 8);
        let rooted = heap.alloc_object(0).unwrap();

        heap.start_marking();
        heap.register_permanent_root(rooted).unwrap();
        let mut heap = heap.keep_alive(kept);
        let mut heap = heap.pin(Some(pinned));
        heap.collect();

        assert!(heap.is_markable(rooted));
        assert_eq!(heap.bytes(kept).unwrap(), b"kept");
        assert_eq!(heap.bytes(pinned).unwrap(), b"pinned");
    }

    #[test]
    fn test_finish_collection_shades_late_pins() {
        let mut heap = Heap::new();
        let obj = heap.alloc_object(0).unwrap();
        heap.start_marking();
        heap.get_mut(obj).unwrap().pins += 1;

        heap.finish_collection();
        assert!(heap.is_markable(obj));
    }

    #[test]
    fn test_permanent_root_is_idempotent() {
        let mut heap = Heap::new();
        let r = heap.alloc_object(0).unwrap();
        assert!(heap.register_permanent_root(r).unwrap());
        assert!(!heap.register_permanent_root(r).unwrap());
        assert_eq!(heap.permanent_roots().len(), 1);
    }

    #[test]
    fn test_heap_limit_out_of_memory() {
        let config = RuntimeConfig {
            heap_limit: Some(256),
            ..RuntimeConfig::default()
        };
        let mut heap = Heap::with_config(&config);
        let err = heap.alloc_buffer(1024).unwrap_err();
        assert!(matches!(err, HeapError::OutOfMemory { limit: 256, .. }));
    }

    #[test]
    fn test_heap_limit_retries_after_collection() {
        let config = RuntimeConfig {
            heap_limit: Some(200),
            ..RuntimeConfig::default()
        };
        let mut heap = Heap::with_config(&config);
        // Garbage that only a collection can reclaim.
        heap.alloc_buffer(64).unwrap();
        assert!(heap.alloc_buffer(64).is_ok());
        assert_eq!(heap.stats().collections, 1);
    }

    #[test]
    fn test_unit_and_method_payloads() {
        use crate::vm::method::{MethodDef, Visibility};

        let mut heap = Heap::new();
        let unit = Arc::new(BytecodeUnit::new("m", vec![]));
        let u = heap.alloc_unit(Arc::clone(&unit)).unwrap();
        let me = Arc::new(MethodEntry::new(1, 2, Visibility::Public, MethodDef::Iseq(unit)));
        let m = heap.alloc_method(me).unwrap();

        assert_eq!(heap.get(u).unwrap().kind(), ObjectKind::BytecodeUnit);
        assert_eq!(heap.get(u).unwrap().unit().unwrap().name(), "m");
        assert!(heap.get(u).unwrap().method().is_none());
        let entry = heap.get(m).unwrap().method().unwrap();
        assert_eq!(entry.unit().unwrap().name(), "m");
        assert!(matches!(heap.capacity(u), Err(HeapError::NoBuffer(_))));
    }

    #[test]
    fn test_gc_stress_collects_on_every_allocation() {
        let mut heap = Heap::new();
        heap.set_gc_stress(true);
        heap.alloc_object(0).unwrap();
        heap.alloc_object(0).unwrap();
        assert_eq!(heap.stats().collections, 2);
    }
}

//! Growing and replacing the backing buffers of strings and arrays.
//!
//! A new buffer is always fully written before the target is repointed at
//! it, and any object the copy reads from is pinned for the whole operation
//! so the allocation cannot relocate the bytes being copied.

use std::ptr;

use crate::error::HeapError;
use crate::vm::heap::{BUFFER_EXT_SIZE, Heap, OBJECT_HEADER_SIZE};
use crate::vm::ObjRef;

/// Allocate a zero-filled buffer of at least `capacity` bytes.
///
/// May trigger a collection.
pub fn new_buffer(heap: &mut Heap, capacity: usize) -> Result<ObjRef, HeapError> {
    heap.alloc_buffer(capacity)
}

/// Give `target` a new buffer of `new_capacity` bytes whose first `copy_size`
/// bytes are copied from `source_ptr`, and return the new buffer.
///
/// `source` (if any) is the object that owns the bytes at `source_ptr`; it
/// is pinned until this returns.
///
/// # Panics
///
/// If `copy_size > new_capacity`.
///
/// # Safety
///
/// When `copy_size > 0`, `source_ptr` must be valid for `copy_size` reads,
/// and must point into storage owned by `source` (or outside the heap).
pub unsafe fn grow_or_copy(
    heap: &mut Heap,
    target: ObjRef,
    new_capacity: usize,
    source: Option<ObjRef>,
    source_ptr: *const u8,
    copy_size: usize,
) -> Result<ObjRef, HeapError> {
    assert!(
        copy_size <= new_capacity,
        "copy of {copy_size} bytes into a {new_capacity}-byte buffer"
    );

    let mut pinned = heap.pin(source);
    let mut heap = pinned.keep_alive(target);

    let buffer = new_buffer(&mut heap, new_capacity)?;
    if copy_size > 0 {
        let dst = heap.buffer_ptr(buffer)?;
        // SAFETY: `dst` has at least `new_capacity >= copy_size` bytes; the
        // source is pinned, so the allocation above did not move it. The
        // buffer is fresh, so the ranges cannot overlap.
        unsafe { ptr::copy_nonoverlapping(source_ptr, dst, copy_size) };
    }
    heap.set_buffer(target, buffer)?;
    Ok(buffer)
}

/// Attach an empty buffer of `capacity` bytes to `target`.
pub fn attach_new_buffer(
    heap: &mut Heap,
    target: ObjRef,
    capacity: usize,
) -> Result<ObjRef, HeapError> {
    // SAFETY: nothing is read from the source pointer when copy_size is 0.
    unsafe { grow_or_copy(heap, target, capacity, None, ptr::null(), 0) }
}

/// Replace `target`'s buffer with one of `new_capacity` bytes, keeping as
/// much of the old contents as fits. The length is clamped to the new
/// capacity.
pub fn resize(heap: &mut Heap, target: ObjRef, new_capacity: usize) -> Result<ObjRef, HeapError> {
    let old = heap
        .get(target)
        .ok_or(HeapError::InvalidRef(target.index()))?
        .buffer();
    let Some(old) = old else {
        return attach_new_buffer(heap, target, new_capacity);
    };

    let len = heap.length(target)?;
    let copy_size = heap.capacity(old)?.min(new_capacity);
    let src = heap.buffer_ptr(old)?;
    // SAFETY: `src` spans the old buffer's capacity and `old` is pinned
    // during the copy.
    let buffer = unsafe { grow_or_copy(heap, target, new_capacity, Some(old), src, copy_size) }?;
    heap.set_length(target, len.min(new_capacity))?;
    Ok(buffer)
}

/// Give `target` a new buffer holding `copy_size` bytes of `source`'s
/// storage starting at `offset`, and set its length to `copy_size`.
pub fn copy_from_object(
    heap: &mut Heap,
    target: ObjRef,
    new_capacity: usize,
    source: ObjRef,
    offset: usize,
    copy_size: usize,
) -> Result<ObjRef, HeapError> {
    let capacity = heap.capacity(source)?;
    if offset + copy_size > capacity {
        return Err(HeapError::OutOfBounds {
            offset,
            len: copy_size,
            capacity,
        });
    }
    let src = heap.buffer_ptr(source)?;
    // SAFETY: bounds checked above; `source` is pinned during the copy.
    let buffer = unsafe {
        grow_or_copy(
            heap,
            target,
            new_capacity,
            Some(source),
            src.add(offset),
            copy_size,
        )
    }?;
    heap.set_length(target, copy_size)?;
    Ok(buffer)
}

/// Give `target` a new buffer initialised from bytes outside the heap.
pub fn copy_from_slice(
    heap: &mut Heap,
    target: ObjRef,
    new_capacity: usize,
    bytes: &[u8],
) -> Result<ObjRef, HeapError> {
    // SAFETY: `bytes` is a live slice not owned by the heap.
    let buffer =
        unsafe { grow_or_copy(heap, target, new_capacity, None, bytes.as_ptr(), bytes.len()) }?;
    heap.set_length(target, bytes.len())?;
    Ok(buffer)
}

/// Size of a heap string or array: header plus the buffer reference.
pub const fn minimum_heap_footprint() -> usize {
    OBJECT_HEADER_SIZE + BUFFER_EXT_SIZE
}

/// Bytes charged for a container allocation of `requested` bytes.
pub fn allocation_size(requested: usize) -> usize {
    requested.max(minimum_heap_footprint())
}

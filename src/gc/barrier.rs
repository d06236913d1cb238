//! Write barrier for stores performed outside the collector's own accessors.
//!
//! Generated code and runtime glue write object references with raw stores.
//! Each such store must be followed by [`WriteBarrier::record_heap_edge`],
//! so an incremental mark in progress rescans the origin before it finishes.
//! When no mark is running the call is one atomic load plus a counter bump.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::trace;

use crate::vm::{ObjRef, Value};

#[derive(Debug, Default)]
pub struct WriteBarrier {
    /// Whether marking is in progress
    marking: AtomicBool,
    /// Number of edges reported, marking or not
    edges: AtomicU64,
    /// Origins to rescan before the mark completes
    remembered: Mutex<Vec<ObjRef>>,
}

impl WriteBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report that `origin` now holds `referenced`.
    pub fn record_heap_edge(&self, origin: ObjRef, referenced: Value) {
        self.edges.fetch_add(1, Ordering::Relaxed);
        if !self.is_marking() {
            return;
        }
        if referenced.is_ref() {
            trace!(target: "jitcore::gc", ?origin, ?referenced, "barrier slow path");
            self.remembered.lock().push(origin);
        }
    }

    pub fn is_marking(&self) -> bool {
        self.marking.load(Ordering::Acquire)
    }

    /// Total edges reported since creation.
    pub fn edges_recorded(&self) -> u64 {
        self.edges.load(Ordering::Relaxed)
    }

    /// Address of the entry point generated code calls after a raw store.
    pub fn entry_point() -> usize {
        record_heap_edge_entry as *const () as usize
    }

    pub(crate) fn set_marking(&self, marking: bool) {
        self.marking.store(marking, Ordering::Release);
    }

    pub(crate) fn drain(&self) -> Vec<ObjRef> {
        std::mem::take(&mut *self.remembered.lock())
    }
}

/// C-ABI form of [`WriteBarrier::record_heap_edge`] for generated code.
/// `referenced` is an object index, or `u32::MAX` for a non-reference value.
///
/// # Safety
///
/// `barrier` must point to a live `WriteBarrier`.
pub unsafe extern "C" fn record_heap_edge_entry(
    barrier: *const WriteBarrier,
    origin: u32,
    referenced: u32,
) {
    let referenced = match referenced {
        u32::MAX => Value::Nil,
        index => Value::Ref(ObjRef::from_index(index)),
    };
    // SAFETY: caller guarantees `barrier` is live.
    let barrier = unsafe { &*barrier };
    barrier.record_heap_edge(ObjRef::from_index(origin), referenced);
}

//! Process-lifetime roots and the guarded heap walk.

use std::collections::HashSet;

use tracing::debug;

use crate::error::HeapError;
use crate::jit::safepoint::SafepointGuard;
use crate::vm::{Heap, HeapObject, ObjRef};

/// Objects the JIT keeps alive for the life of the process.
#[derive(Debug, Default)]
pub struct RootSet {
    roots: Vec<ObjRef>,
    index: HashSet<ObjRef>,
}

impl RootSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `obj` a permanent root of `heap`. Registering the same object
    /// again is a no-op; returns whether it was newly added.
    pub fn register_process_root(&mut self, heap: &mut Heap, obj: ObjRef) -> Result<bool, HeapError> {
        if self.index.contains(&obj) {
            return Ok(false);
        }
        heap.register_permanent_root(obj)?;
        self.index.insert(obj);
        self.roots.push(obj);
        debug!(target: "jitcore::gc", ?obj, "registered process root");
        Ok(true)
    }

    pub fn contains(&self, obj: ObjRef) -> bool {
        self.index.contains(&obj)
    }

    pub fn roots(&self) -> &[ObjRef] {
        &self.roots
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Visit every live object accepted by `predicate`. Requires the barrier so
/// no mutator can allocate or store during the walk.
pub fn for_each_managed_object(
    heap: &Heap,
    _guard: &SafepointGuard<'_>,
    mut predicate: impl FnMut(&HeapObject) -> bool,
    mut callback: impl FnMut(ObjRef, &HeapObject),
) {
    heap.each_object(|r, obj| {
        if predicate(obj) {
            callback(r, obj);
        }
    });
}

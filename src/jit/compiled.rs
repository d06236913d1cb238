//! The compiled state attached to each bytecode unit.

use std::fmt;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use parking_lot::Mutex;

use super::invariants::Assumption;
use super::memory::CodePtr;
use super::safepoint::SafepointGuard;

/// Entry point of a unit's generated code.
///
/// The entry moves null -> non-null on install and back to null on
/// invalidation; both transitions require the safepoint barrier. Readers
/// load it without locking.
pub struct CompiledUnit {
    entry: AtomicPtr<u8>,
    assumptions: Mutex<Vec<Assumption>>,
    invalidations: AtomicU32,
}

impl CompiledUnit {
    pub fn new() -> Self {
        Self {
            entry: AtomicPtr::new(std::ptr::null_mut()),
            assumptions: Mutex::new(Vec::new()),
            invalidations: AtomicU32::new(0),
        }
    }

    pub fn entry(&self) -> Option<CodePtr> {
        CodePtr::from_raw(self.entry.load(Ordering::Acquire))
    }

    pub fn is_installed(&self) -> bool {
        !self.entry.load(Ordering::Acquire).is_null()
    }

    /// Publish `entry`. Fails with the existing entry if one is installed.
    pub fn install(
        &self,
        _guard: &SafepointGuard<'_>,
        entry: CodePtr,
        assumptions: Vec<Assumption>,
    ) -> Result<(), CodePtr> {
        self.entry
            .compare_exchange(
                std::ptr::null_mut(),
                entry.as_ptr().cast_mut(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map_err(|existing| CodePtr::from_raw(existing).unwrap_or(entry))?;
        *self.assumptions.lock() = assumptions;
        Ok(())
    }

    /// Drop the entry so the next call runs in the interpreter. Returns
    /// whether there was an entry to drop.
    pub fn invalidate(&self, _guard: &SafepointGuard<'_>) -> bool {
        let old = self.entry.swap(std::ptr::null_mut(), Ordering::AcqRel);
        if old.is_null() {
            return false;
        }
        self.assumptions.lock().clear();
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        true
    }

    pub fn invalidation_count(&self) -> u32 {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Assumptions the installed code was compiled under.
    pub fn assumptions(&self) -> Vec<Assumption> {
        self.assumptions.lock().clone()
    }
}

impl Default for CompiledUnit {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CompiledUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledUnit")
            .field("entry", &self.entry.load(Ordering::Relaxed))
            .field("invalidations", &self.invalidation_count())
            .finish()
    }
}

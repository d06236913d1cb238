//! Tracking which compiled units depend on which facts about the VM, so a
//! change to one of those facts invalidates exactly the affected code.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::vm::BytecodeUnit;

/// Basic operators whose redefinition invalidates inlined fast paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicOp {
    Plus,
    Minus,
    Mult,
    Div,
    Mod,
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    Aref,
    Aset,
    Length,
    Not,
}

/// A fact generated code relies on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Assumption {
    /// `op` on instances of `class` still has its builtin meaning.
    BasicOpNotRedefined { class: u32, op: BasicOp },
    /// Looking up `method` on `class` still finds the same entry.
    MethodLookupStable { class: u32, method: u32 },
    /// The method entry with this serial has not been invalidated.
    MethodEntryValid(u64),
    /// Only one mutator thread exists.
    SingleMutator,
    /// No constant has been redefined since compilation.
    StableConstantState,
}

/// Map from assumption to the units compiled under it.
#[derive(Debug, Default)]
pub struct Invariants {
    dependents: HashMap<Assumption, Vec<Weak<BytecodeUnit>>>,
}

impl Invariants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, unit: &Arc<BytecodeUnit>, assumptions: &[Assumption]) {
        for assumption in assumptions {
            let units = self.dependents.entry(*assumption).or_default();
            if !units.iter().any(|u| std::ptr::eq(u.as_ptr(), Arc::as_ptr(unit))) {
                units.push(Arc::downgrade(unit));
            }
        }
    }

    /// Remove and return the live units depending on `assumption`.
    pub fn take_dependents(&mut self, assumption: &Assumption) -> Vec<Arc<BytecodeUnit>> {
        self.dependents
            .remove(assumption)
            .unwrap_or_default()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    pub fn dependent_count(&self, assumption: &Assumption) -> usize {
        self.dependents
            .get(assumption)
            .map_or(0, |units| units.iter().filter(|u| u.strong_count() > 0).count())
    }

    /// Number of distinct assumptions with registered dependents.
    pub fn len(&self) -> usize {
        self.dependents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dependents.is_empty()
    }

    pub fn clear(&mut self) {
        self.dependents.clear();
    }
}

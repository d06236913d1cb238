//! JIT compilation lifecycle.
//!
//! This module owns everything between "a unit got hot" and "its entry
//! point is published":
//! - Code memory with W^X page protection
//! - Instruction-cache maintenance
//! - The safepoint barrier every code-patching step runs under
//! - Assumption tracking and invalidation of installed code
//!
//! Code generation itself is delegated to a [`CodeGenerator`].

pub mod compiled;
pub mod icache;
pub mod introspect;
pub mod invariants;
pub mod memory;
pub mod safepoint;

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{HeapError, JitError, MemoryError};
use crate::gc::roots::{RootSet, for_each_managed_object};
use crate::vm::{BytecodeUnit, Heap, MethodEntry, ObjRef, ObjectKind};

pub use compiled::CompiledUnit;
pub use invariants::{Assumption, BasicOp, Invariants};
pub use memory::{CodePtr, CodeRegion, Protection};
pub use safepoint::{LockDepth, MutatorHandle, SafepointCoordinator, SafepointGuard, SafepointState};

/// Output of a code generator.
#[derive(Debug, Clone, Default)]
pub struct GeneratedCode {
    pub code: Vec<u8>,
    /// Facts the code relies on; breaking any of them invalidates it.
    pub assumptions: Vec<Assumption>,
}

/// Turns a bytecode unit into machine code.
///
/// Called with the safepoint barrier held, so it may inspect the unit and
/// the heap freely but must not block on other mutators.
pub trait CodeGenerator {
    /// Generate code for `unit`, or `None` to leave it to the interpreter.
    fn generate(&mut self, unit: &BytecodeUnit, config: &RuntimeConfig) -> Option<GeneratedCode>;
}

/// Counters describing JIT activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JitStats {
    pub compiled_units: usize,
    pub failed_compiles: usize,
    pub invalidations: usize,
    pub global_invalidations: usize,
    pub code_bytes: usize,
    pub code_region_size: usize,
    pub enabled: bool,
}

/// The JIT driver.
pub struct Jit {
    config: RuntimeConfig,
    coordinator: Arc<SafepointCoordinator>,
    region: Option<CodeRegion>,
    enabled: bool,
    invariants: Invariants,
    roots: RootSet,
    stats: JitStats,
}

impl Jit {
    pub fn new(config: RuntimeConfig, coordinator: Arc<SafepointCoordinator>) -> Self {
        let enabled = config.jit_mode.is_enabled();
        Self {
            config,
            coordinator,
            region: None,
            enabled,
            invariants: Invariants::new(),
            roots: RootSet::new(),
            stats: JitStats::default(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<SafepointCoordinator> {
        &self.coordinator
    }

    pub fn region(&self) -> Option<&CodeRegion> {
        self.region.as_ref()
    }

    pub fn invariants(&self) -> &Invariants {
        &self.invariants
    }

    /// Count a call to `unit`. Returns true exactly once, on the call that
    /// reaches the compile threshold.
    pub fn record_call(&self, unit: &BytecodeUnit) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(calls) = unit.bump_call_count() else {
            return false;
        };
        let hot = calls == self.config.jit_threshold;
        if hot && self.config.trace_jit {
            info!(target: "jitcore::jit", unit = unit.name(), calls, "hot unit detected");
        }
        hot
    }

    /// Generate, write and install code for `unit` under the barrier.
    pub fn compile(
        &mut self,
        depth: &mut LockDepth,
        unit: &Arc<BytecodeUnit>,
        generator: &mut dyn CodeGenerator,
    ) -> Result<CodePtr, JitError> {
        if !self.enabled {
            return Err(JitError::Disabled);
        }
        let coordinator = Arc::clone(&self.coordinator);
        let guard = coordinator.enter(depth);

        if unit.compiled().is_installed() {
            return Err(JitError::AlreadyInstalled(unit.name().to_string()));
        }

        let Some(generated) = generator.generate(unit, &self.config) else {
            self.stats.failed_compiles += 1;
            if self.config.trace_jit {
                info!(target: "jitcore::jit", unit = unit.name(), "generator declined");
            }
            return Err(JitError::CompileFailed(unit.name().to_string()));
        };

        let entry = match self.write_code(&guard, &generated.code) {
            Ok(entry) => entry,
            Err(e) => {
                self.disable(&e);
                return Err(e.into());
            }
        };

        self.invariants.register(unit, &generated.assumptions);
        unit.compiled()
            .install(&guard, entry, generated.assumptions)
            .map_err(|_| JitError::AlreadyInstalled(unit.name().to_string()))?;

        self.stats.compiled_units += 1;
        self.stats.code_bytes += generated.code.len();
        debug!(
            target: "jitcore::jit",
            unit = unit.name(), entry = entry.addr(), size = generated.code.len(), "compiled"
        );
        Ok(entry)
    }

    fn write_code(&mut self, guard: &SafepointGuard<'_>, code: &[u8]) -> Result<CodePtr, MemoryError> {
        let region = match self.region.take() {
            Some(region) => region,
            None => {
                let region = CodeRegion::reserve(self.config.exec_mem_bytes())?;
                self.stats.code_region_size = region.size();
                region
            }
        };
        self.region.insert(region).write(guard, code)
    }

    fn disable(&mut self, cause: &MemoryError) {
        self.enabled = false;
        warn!(target: "jitcore::jit", error = %cause, "disabling JIT");
    }

    /// Invalidate every installed unit that relies on `assumption`.
    fn invalidate_dependents(&mut self, depth: &mut LockDepth, assumption: Assumption) -> usize {
        let coordinator = Arc::clone(&self.coordinator);
        let guard = coordinator.enter(depth);
        let invalidated = self
            .invariants
            .take_dependents(&assumption)
            .iter()
            .filter(|unit| unit.compiled().invalidate(&guard))
            .count();
        self.stats.invalidations += invalidated;
        if invalidated > 0 {
            debug!(target: "jitcore::jit", ?assumption, invalidated, "invalidated dependents");
        }
        invalidated
    }

    /// `op` was redefined on `class`.
    pub fn bop_redefined(&mut self, depth: &mut LockDepth, class: u32, op: BasicOp) -> usize {
        self.invalidate_dependents(depth, Assumption::BasicOpNotRedefined { class, op })
    }

    /// A method entry was invalidated (redefined, removed or had its
    /// visibility changed).
    pub fn method_entry_invalidated(&mut self, depth: &mut LockDepth, entry: &MethodEntry) -> usize {
        self.invalidate_dependents(depth, Assumption::MethodEntryValid(entry.serial()))
    }

    /// Lookup of `method` on `class` may now resolve differently.
    pub fn method_lookup_changed(&mut self, depth: &mut LockDepth, class: u32, method: u32) -> usize {
        self.invalidate_dependents(depth, Assumption::MethodLookupStable { class, method })
    }

    /// A second mutator thread is about to start.
    pub fn before_mutator_spawn(&mut self, depth: &mut LockDepth) -> usize {
        self.invalidate_dependents(depth, Assumption::SingleMutator)
    }

    pub fn constant_state_changed(&mut self, depth: &mut LockDepth) -> usize {
        self.invalidate_dependents(depth, Assumption::StableConstantState)
    }

    /// Drop the entry of every compiled unit on the heap.
    pub fn invalidate_all(&mut self, depth: &mut LockDepth, heap: &Heap) -> usize {
        let coordinator = Arc::clone(&self.coordinator);
        let guard = coordinator.enter(depth);
        let mut invalidated = 0;
        for_each_managed_object(
            heap,
            &guard,
            |obj| obj.kind() == ObjectKind::BytecodeUnit,
            |_, obj| {
                if obj.unit().is_some_and(|unit| unit.compiled().invalidate(&guard)) {
                    invalidated += 1;
                }
            },
        );
        self.invariants.clear();
        self.stats.invalidations += invalidated;
        self.stats.global_invalidations += 1;
        debug!(target: "jitcore::jit", invalidated, "invalidated all compiled code");
        invalidated
    }

    /// Keep `obj` alive, and its buffer in place, for the life of the process.
    pub fn register_root(&mut self, heap: &mut Heap, obj: ObjRef) -> Result<bool, HeapError> {
        self.roots.register_process_root(heap, obj)
    }

    pub fn roots(&self) -> &RootSet {
        &self.roots
    }

    pub fn stats(&self) -> JitStats {
        JitStats {
            enabled: self.enabled,
            ..self.stats.clone()
        }
    }

    pub fn stats_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.stats())
    }
}

impl Drop for Jit {
    fn drop(&mut self) {
        if self.config.gen_stats {
            match self.stats_json() {
                Ok(json) => info!(target: "jitcore::jit", "JIT stats: {json}"),
                Err(e) => warn!(target: "jitcore::jit", error = %e, "failed to render JIT stats"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JitMode;

    struct Fixed {
        code: Option<Vec<u8>>,
        assumptions: Vec<Assumption>,
        calls: usize,
    }

    impl Fixed {
        fn new(assumptions: Vec<Assumption>) -> Self {
            Self {
                code: Some(vec![0xC3]),
                assumptions,
                calls: 0,
            }
        }
    }

    impl CodeGenerator for Fixed {
        fn generate(&mut self, _unit: &BytecodeUnit, _config: &RuntimeConfig) -> Option<GeneratedCode> {
            self.calls += 1;
            Some(GeneratedCode {
                code: self.code.clone()?,
                assumptions: self.assumptions.clone(),
            })
        }
    }

    fn jit_with(threshold: u32) -> Jit {
        let config = RuntimeConfig {
            jit_mode: JitMode::On,
            jit_threshold: threshold,
            exec_mem_size: 1,
            ..RuntimeConfig::default()
        };
        Jit::new(config, Arc::new(SafepointCoordinator::new()))
    }

    #[test]
    fn test_record_call_fires_once_at_threshold() {
        let jit = jit_with(3);
        let unit = BytecodeUnit::new("hot", vec![]);
        let fired: Vec<bool> = (0..5).map(|_| jit.record_call(&unit)).collect();
        assert_eq!(fired, [false, false, true, false, false]);
    }

    #[test]
    fn test_threshold_one_compiles_on_first_call() {
        let jit = jit_with(1);
        assert!(jit.record_call(&BytecodeUnit::new("f", vec![])));
    }

    #[test]
    fn test_disabled_jit() {
        let config = RuntimeConfig {
            jit_mode: JitMode::Off,
            ..RuntimeConfig::default()
        };
        let mut jit = Jit::new(config, Arc::new(SafepointCoordinator::new()));
        let unit = Arc::new(BytecodeUnit::new("f", vec![]));
        assert!(!jit.record_call(&unit));
        let err = jit
            .compile(&mut LockDepth::new(), &unit, &mut Fixed::new(vec![]))
            .unwrap_err();
        assert_eq!(err, JitError::Disabled);
        assert!(jit.region().is_none());
    }

    #[test]
    fn test_compile_installs_entry() {
        let mut jit = jit_with(1);
        let mut depth = LockDepth::new();
        let unit = Arc::new(BytecodeUnit::new("f", vec![]));
        let mut generator = Fixed::new(vec![Assumption::SingleMutator]);

        let entry = jit.compile(&mut depth, &unit, &mut generator).unwrap();

        assert_eq!(unit.compiled().entry(), Some(entry));
        assert!(jit.region().unwrap().contains(entry.addr()));
        assert_eq!(depth.get(), 0);
        let stats = jit.stats();
        assert_eq!(stats.compiled_units, 1);
        assert_eq!(stats.code_bytes, 1);
        assert_eq!(stats.code_region_size, 1024 * 1024);
    }

    #[test]
    fn test_compile_twice_is_rejected_without_generating() {
        let mut jit = jit_with(1);
        let mut depth = LockDepth::new();
        let unit = Arc::new(BytecodeUnit::new("f", vec![]));
        let mut generator = Fixed::new(vec![]);

        jit.compile(&mut depth, &unit, &mut generator).unwrap();
        let err = jit.compile(&mut depth, &unit, &mut generator).unwrap_err();

        assert_eq!(err, JitError::AlreadyInstalled("f".to_string()));
        assert_eq!(generator.calls, 1);
    }

    #[test]
    fn test_declined_generation_leaves_entry_null() {
        let mut jit = jit_with(1);
        let unit = Arc::new(BytecodeUnit::new("g", vec![]));
        let mut generator = Fixed::new(vec![]);
        generator.code = None;

        let err = jit
            .compile(&mut LockDepth::new(), &unit, &mut generator)
            .unwrap_err();

        assert_eq!(err, JitError::CompileFailed("g".to_string()));
        assert!(unit.compiled().entry().is_none());
        assert_eq!(jit.stats().failed_compiles, 1);
        assert!(jit.is_enabled());
    }

    #[test]
    fn test_exhausted_region_disables_jit() {
        let mut jit = jit_with(1);
        let unit = Arc::new(BytecodeUnit::new("huge", vec![]));
        let mut generator = Fixed::new(vec![]);
        generator.code = Some(vec![0x90; 2 * 1024 * 1024]);

        let err = jit
            .compile(&mut LockDepth::new(), &unit, &mut generator)
            .unwrap_err();

        assert!(matches!(err, JitError::Memory(MemoryError::OutOfCodeMemory { .. })));
        assert!(!jit.is_enabled());
        assert!(!jit.stats().enabled);
    }

    #[test]
    fn test_hooks_invalidate_only_dependents() {
        let mut jit = jit_with(1);
        let mut depth = LockDepth::new();
        let plus = Assumption::BasicOpNotRedefined {
            class: 1,
            op: BasicOp::Plus,
        };
        let adder = Arc::new(BytecodeUnit::new("adder", vec![]));
        let other = Arc::new(BytecodeUnit::new("other", vec![]));
        jit.compile(&mut depth, &adder, &mut Fixed::new(vec![plus])).unwrap();
        jit.compile(&mut depth, &other, &mut Fixed::new(vec![Assumption::StableConstantState]))
            .unwrap();

        assert_eq!(jit.bop_redefined(&mut depth, 2, BasicOp::Plus), 0);
        assert_eq!(jit.bop_redefined(&mut depth, 1, BasicOp::Plus), 1);
        assert!(adder.compiled().entry().is_none());
        assert!(other.compiled().entry().is_some());

        assert_eq!(jit.constant_state_changed(&mut depth), 1);
        assert!(other.compiled().entry().is_none());
        assert_eq!(jit.constant_state_changed(&mut depth), 0);
        assert_eq!(jit.stats().invalidations, 2);
    }

    #[test]
    fn test_method_hooks() {
        use crate::vm::method::{MethodDef, Visibility};

        let mut jit = jit_with(1);
        let mut depth = LockDepth::new();
        let callee = MethodEntry::new(5, 1, Visibility::Public, MethodDef::Bmethod);
        let caller = Arc::new(BytecodeUnit::new("caller", vec![]));
        let looker = Arc::new(BytecodeUnit::new("looker", vec![]));
        let spawner = Arc::new(BytecodeUnit::new("spawner", vec![]));
        let gen_for = |a| Fixed::new(vec![a]);
        jit.compile(&mut depth, &caller, &mut gen_for(Assumption::MethodEntryValid(callee.serial())))
            .unwrap();
        jit.compile(
            &mut depth,
            &looker,
            &mut gen_for(Assumption::MethodLookupStable { class: 1, method: 5 }),
        )
        .unwrap();
        jit.compile(&mut depth, &spawner, &mut gen_for(Assumption::SingleMutator))
            .unwrap();

        assert_eq!(jit.method_entry_invalidated(&mut depth, &callee), 1);
        assert_eq!(jit.method_lookup_changed(&mut depth, 1, 5), 1);
        assert_eq!(jit.before_mutator_spawn(&mut depth), 1);
        for unit in [&caller, &looker, &spawner] {
            assert!(!unit.compiled().is_installed(), "{} still installed", unit.name());
        }
    }

    #[test]
    fn test_invalidate_all_walks_heap_units() {
        let mut jit = jit_with(1);
        let mut depth = LockDepth::new();
        let mut heap = Heap::new();
        let a = Arc::new(BytecodeUnit::new("a", vec![]));
        let b = Arc::new(BytecodeUnit::new("b", vec![]));
        heap.alloc_unit(Arc::clone(&a)).unwrap();
        heap.alloc_unit(Arc::clone(&b)).unwrap();
        jit.compile(&mut depth, &a, &mut Fixed::new(vec![Assumption::SingleMutator]))
            .unwrap();

        assert_eq!(jit.invalidate_all(&mut depth, &heap), 1);
        assert!(a.compiled().entry().is_none());
        assert!(jit.invariants().is_empty());
        assert_eq!(jit.invalidate_all(&mut depth, &heap), 0);
        assert_eq!(jit.stats().global_invalidations, 2);

        // Recompiling after global invalidation works.
        assert!(jit.compile(&mut depth, &a, &mut Fixed::new(vec![])).is_ok());
    }

    #[test]
    fn test_stats_json() {
        let jit = jit_with(1);
        let json: serde_json::Value = serde_json::from_str(&jit.stats_json().unwrap()).unwrap();
        assert_eq!(json["compiled_units"], 0);
        assert_eq!(json["enabled"], true);
    }
}

//! Read-only queries a code generator makes about bytecode.
//!
//! None of these allocate or touch the heap, so they are safe to call while
//! mutators are parked.

use crate::vm::bytecode::{Builtin, BytecodeUnit, Opcode};

/// The pc of the word at `index`, if it lies inside the unit.
pub fn pc_at_index(unit: &BytecodeUnit, index: usize) -> Option<usize> {
    (index < unit.encoded_size()).then_some(index)
}

/// Decode the opcode at `pc`.
pub fn opcode_at_pc(unit: &BytecodeUnit, pc: usize) -> Option<Opcode> {
    unit.encoded().get(pc).copied().and_then(Opcode::from_word)
}

/// Width of `op` in words, opcode included.
pub fn insn_len(op: Opcode) -> usize {
    op.width()
}

pub fn insn_name(op: Opcode) -> &'static str {
    op.name()
}

/// The builtin a unit consists of, when its whole body is a single
/// delegating call to a leaf builtin followed by `leave`.
pub fn leaf_builtin_function(unit: &BytecodeUnit) -> Option<&Builtin> {
    let expected = insn_len(Opcode::InvokeBuiltinDelegateLeave) + insn_len(Opcode::Leave);
    if unit.encoded_size() != expected {
        return None;
    }
    if opcode_at_pc(unit, 0)? != Opcode::InvokeBuiltinDelegateLeave {
        return None;
    }
    let builtin = unit.builtin(usize::try_from(unit.encoded()[1]).ok()?)?;
    builtin.leaf.then_some(builtin)
}

pub fn is_leaf_builtin(unit: &BytecodeUnit) -> bool {
    leaf_builtin_function(unit).is_some()
}

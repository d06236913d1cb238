//! Bytecode units as the JIT sees them.
//!
//! A unit's instruction stream is a flat sequence of 64-bit words: an opcode
//! word followed by its operand words. A program counter is a word offset
//! into that stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use super::Value;
use crate::jit::compiled::CompiledUnit;

/// Instruction opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    PutNil,
    /// operand: immediate integer
    PutObject,
    /// operands: local index, env level
    GetLocal,
    /// operands: local index, env level
    SetLocal,
    /// operand: call site index
    Send,
    /// operand: builtin index
    InvokeBuiltin,
    /// operands: builtin index, first local passed
    InvokeBuiltinDelegateLeave,
    Leave,
    /// operand: absolute target pc
    Jump,
    /// operand: absolute target pc
    BranchIf,
}

impl Opcode {
    const ALL: [Opcode; 11] = [
        Opcode::Nop,
        Opcode::PutNil,
        Opcode::PutObject,
        Opcode::GetLocal,
        Opcode::SetLocal,
        Opcode::Send,
        Opcode::InvokeBuiltin,
        Opcode::InvokeBuiltinDelegateLeave,
        Opcode::Leave,
        Opcode::Jump,
        Opcode::BranchIf,
    ];

    pub fn from_word(word: u64) -> Option<Opcode> {
        Self::ALL.get(usize::try_from(word).ok()?).copied()
    }

    /// Length of the instruction in words, opcode included.
    pub fn width(self) -> usize {
        match self {
            Opcode::Nop | Opcode::PutNil | Opcode::Leave => 1,
            Opcode::PutObject
            | Opcode::Send
            | Opcode::InvokeBuiltin
            | Opcode::Jump
            | Opcode::BranchIf => 2,
            Opcode::GetLocal | Opcode::SetLocal | Opcode::InvokeBuiltinDelegateLeave => 3,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Opcode::Nop => "nop",
            Opcode::PutNil => "putnil",
            Opcode::PutObject => "putobject",
            Opcode::GetLocal => "getlocal",
            Opcode::SetLocal => "setlocal",
            Opcode::Send => "send",
            Opcode::InvokeBuiltin => "invokebuiltin",
            Opcode::InvokeBuiltinDelegateLeave => "invokebuiltin_delegate_leave",
            Opcode::Leave => "leave",
            Opcode::Jump => "jump",
            Opcode::BranchIf => "branchif",
        }
    }
}

/// Builds an instruction stream.
#[derive(Debug, Default)]
pub struct Assembler {
    words: Vec<u64>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(mut self, op: Opcode, operands: &[u64]) -> Self {
        assert_eq!(
            operands.len() + 1,
            op.width(),
            "wrong operand count for {}",
            op.name()
        );
        self.words.push(op as u64);
        self.words.extend_from_slice(operands);
        self
    }

    pub fn finish(self) -> Vec<u64> {
        self.words
    }
}

/// A native function callable from bytecode.
#[derive(Debug, Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub argc: usize,
    /// Does not call back into the VM, allocate, or raise.
    pub leaf: bool,
    pub func: fn(&[Value]) -> Value,
}

/// Parameter kinds a unit accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParamFlags {
    pub has_opt: bool,
    pub has_kw: bool,
    pub has_rest: bool,
    pub has_post: bool,
    pub has_kwrest: bool,
    pub has_block: bool,
    pub accepts_no_kwarg: bool,
    pub forwards_keywords: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamShape {
    pub flags: ParamFlags,
    /// Total parameter slots.
    pub size: usize,
    pub lead_num: usize,
    pub opt_num: usize,
    /// Entry pcs for each count of supplied optional arguments.
    pub opt_table: Vec<usize>,
}

/// A compiled method or block body.
#[derive(Debug)]
pub struct BytecodeUnit {
    name: String,
    encoded: Vec<u64>,
    params: ParamShape,
    local_table_size: usize,
    stack_max: usize,
    builtin_inline: bool,
    /// Enclosing method body for blocks.
    local_unit: Option<Arc<BytecodeUnit>>,
    builtins: Vec<Builtin>,
    call_count: AtomicU32,
    compiled: CompiledUnit,
}

impl BytecodeUnit {
    pub fn new(name: impl Into<String>, encoded: Vec<u64>) -> Self {
        Self {
            name: name.into(),
            encoded,
            params: ParamShape::default(),
            local_table_size: 0,
            stack_max: 0,
            builtin_inline: false,
            local_unit: None,
            builtins: Vec::new(),
            call_count: AtomicU32::new(0),
            compiled: CompiledUnit::new(),
        }
    }

    pub fn with_params(mut self, params: ParamShape) -> Self {
        self.params = params;
        self
    }

    pub fn with_locals(mut self, local_table_size: usize, stack_max: usize) -> Self {
        self.local_table_size = local_table_size;
        self.stack_max = stack_max;
        self
    }

    pub fn with_builtins(mut self, builtins: Vec<Builtin>, inline: bool) -> Self {
        self.builtins = builtins;
        self.builtin_inline = inline;
        self
    }

    pub fn with_local_unit(mut self, local: Arc<BytecodeUnit>) -> Self {
        self.local_unit = Some(local);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn encoded(&self) -> &[u64] {
        &self.encoded
    }

    /// Length of the instruction stream in words.
    pub fn encoded_size(&self) -> usize {
        self.encoded.len()
    }

    pub fn params(&self) -> &ParamShape {
        &self.params
    }

    pub fn param_flags(&self) -> ParamFlags {
        self.params.flags
    }

    pub fn param_size(&self) -> usize {
        self.params.size
    }

    pub fn lead_num(&self) -> usize {
        self.params.lead_num
    }

    pub fn opt_num(&self) -> usize {
        self.params.opt_num
    }

    pub fn opt_table(&self) -> &[usize] {
        &self.params.opt_table
    }

    pub fn local_table_size(&self) -> usize {
        self.local_table_size
    }

    pub fn stack_max(&self) -> usize {
        self.stack_max
    }

    pub fn builtin_inline(&self) -> bool {
        self.builtin_inline
    }

    /// The method-level unit; a method body is its own local unit.
    pub fn local_unit(&self) -> &BytecodeUnit {
        self.local_unit.as_deref().unwrap_or(self)
    }

    pub fn builtin(&self, index: usize) -> Option<&Builtin> {
        self.builtins.get(index)
    }

    pub fn compiled(&self) -> &CompiledUnit {
        &self.compiled
    }

    /// Count a call and return the new total, or `None` once the counter
    /// has saturated and the call was not counted.
    pub fn bump_call_count(&self) -> Option<u32> {
        self.call_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_add(1))
            .ok()
            .map(|prev| prev + 1)
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }
}

/// Call site flag bits.
pub mod call_flags {
    pub const ARGS_SPLAT: u32 = 1 << 0;
    pub const ARGS_BLOCKARG: u32 = 1 << 1;
    pub const FCALL: u32 = 1 << 2;
    pub const VCALL: u32 = 1 << 3;
    pub const KWARG: u32 = 1 << 4;
    pub const KW_SPLAT: u32 = 1 << 5;
    pub const TAILCALL: u32 = 1 << 6;
}

/// Static information about a call instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    argc: usize,
    method_id: u32,
    flags: u32,
    keywords: Vec<u32>,
}

impl CallSite {
    pub fn new(method_id: u32, argc: usize, flags: u32) -> Self {
        Self {
            argc,
            method_id,
            flags,
            keywords: Vec::new(),
        }
    }

    pub fn with_keywords(mut self, keywords: Vec<u32>) -> Self {
        self.flags |= call_flags::KWARG;
        self.keywords = keywords;
        self
    }

    pub fn argc(&self) -> usize {
        self.argc
    }

    pub fn method_id(&self) -> u32 {
        self.method_id
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn keyword_len(&self) -> usize {
        self.keywords.len()
    }

    pub fn keyword_at(&self, index: usize) -> Option<u32> {
        self.keywords.get(index).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_round_trip_through_words() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::from_word(op as u64), Some(op));
        }
        assert_eq!(Opcode::from_word(99), None);
    }

    #[test]
    fn test_assembler_lays_out_operands() {
        let words = Assembler::new()
            .emit(Opcode::GetLocal, &[3, 1])
            .emit(Opcode::Leave, &[])
            .finish();
        assert_eq!(words, vec![Opcode::GetLocal as u64, 3, 1, Opcode::Leave as u64]);
    }

    #[test]
    #[should_panic(expected = "wrong operand count")]
    fn test_assembler_rejects_bad_operands() {
        Assembler::new().emit(Opcode::Jump, &[]);
    }

    #[test]
    fn test_local_unit_defaults_to_self() {
        let method = Arc::new(BytecodeUnit::new("m", vec![]));
        let block = BytecodeUnit::new("block in m", vec![]).with_local_unit(method.clone());
        assert_eq!(method.local_unit().name(), "m");
        assert_eq!(block.local_unit().name(), "m");
    }

    #[test]
    fn test_call_site_keywords() {
        let cs = CallSite::new(12, 2, call_flags::FCALL).with_keywords(vec![5, 6]);
        assert_eq!(cs.keyword_len(), 2);
        assert_eq!(cs.keyword_at(1), Some(6));
        assert_eq!(cs.keyword_at(2), None);
        assert_ne!(cs.flags() & call_flags::KWARG, 0);
        assert_ne!(cs.flags() & call_flags::FCALL, 0);
    }

    #[test]
    fn test_call_counter() {
        let unit = BytecodeUnit::new("f", vec![]);
        assert_eq!(unit.bump_call_count(), Some(1));
        assert_eq!(unit.bump_call_count(), Some(2));
        assert_eq!(unit.call_count(), 2);
    }

    #[test]
    fn test_call_counter_saturates() {
        let unit = BytecodeUnit::new("f", vec![]);
        unit.call_count.store(u32::MAX - 1, Ordering::Relaxed);
        assert_eq!(unit.bump_call_count(), Some(u32::MAX));
        assert_eq!(unit.bump_call_count(), None);
        assert_eq!(unit.call_count(), u32::MAX);
    }
}

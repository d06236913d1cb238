//! Method entries: what a method table lookup resolves to.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::Value;
use super::bytecode::BytecodeUnit;

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Private,
    Protected,
}

/// A native method. `argc` is -1 for variadic functions.
#[derive(Debug, Clone, Copy)]
pub struct CFunc {
    pub argc: i32,
    pub func: fn(Value, &[Value]) -> Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizedKind {
    Send,
    Call,
    BlockCall,
    StructRef(usize),
    StructSet(usize),
}

#[derive(Debug, Clone)]
pub enum MethodDef {
    Iseq(Arc<BytecodeUnit>),
    CFunc(CFunc),
    /// Reads the named instance variable.
    AttrReader(u32),
    /// Writes the named instance variable.
    AttrWriter(u32),
    Bmethod,
    Optimized(OptimizedKind),
    Undefined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefType {
    Iseq,
    CFunc,
    AttrReader,
    AttrWriter,
    Bmethod,
    Optimized,
    Undefined,
}

#[derive(Debug)]
pub struct MethodEntry {
    called_id: u32,
    original_id: u32,
    owner: u32,
    visibility: Visibility,
    def: MethodDef,
    serial: u64,
}

impl MethodEntry {
    /// Create an entry with a fresh serial.
    pub fn new(called_id: u32, owner: u32, visibility: Visibility, def: MethodDef) -> Self {
        Self {
            called_id,
            original_id: called_id,
            owner,
            visibility,
            def,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Mark this entry as an alias of `original_id`.
    pub fn aliasing(mut self, original_id: u32) -> Self {
        self.original_id = original_id;
        self
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn def(&self) -> &MethodDef {
        &self.def
    }

    pub fn def_type(&self) -> DefType {
        match &self.def {
            MethodDef::Iseq(_) => DefType::Iseq,
            MethodDef::CFunc(_) => DefType::CFunc,
            MethodDef::AttrReader(_) => DefType::AttrReader,
            MethodDef::AttrWriter(_) => DefType::AttrWriter,
            MethodDef::Bmethod => DefType::Bmethod,
            MethodDef::Optimized(_) => DefType::Optimized,
            MethodDef::Undefined => DefType::Undefined,
        }
    }

    pub fn cfunc(&self) -> Option<&CFunc> {
        match &self.def {
            MethodDef::CFunc(cfunc) => Some(cfunc),
            _ => None,
        }
    }

    pub fn attr_id(&self) -> Option<u32> {
        match self.def {
            MethodDef::AttrReader(id) | MethodDef::AttrWriter(id) => Some(id),
            _ => None,
        }
    }

    pub fn optimized(&self) -> Option<OptimizedKind> {
        match self.def {
            MethodDef::Optimized(kind) => Some(kind),
            _ => None,
        }
    }

    pub fn unit(&self) -> Option<&Arc<BytecodeUnit>> {
        match &self.def {
            MethodDef::Iseq(unit) => Some(unit),
            _ => None,
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn original_id(&self) -> u32 {
        self.original_id
    }

    pub fn owner(&self) -> u32 {
        self.owner
    }

    pub fn called_id(&self) -> u32 {
        self.called_id
    }
}

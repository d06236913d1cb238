//! Control frames and local environments.

use std::sync::Arc;

use super::Value;
use super::bytecode::BytecodeUnit;

/// A local variable environment. Blocks chain to their defining scope.
#[derive(Debug)]
pub struct Env {
    locals: Vec<Value>,
    parent: Option<Arc<Env>>,
}

impl Env {
    pub fn new(locals: Vec<Value>, parent: Option<Arc<Env>>) -> Arc<Self> {
        Arc::new(Self { locals, parent })
    }

    pub fn local(&self, index: usize) -> Option<Value> {
        self.locals.get(index).copied()
    }

    pub fn locals(&self) -> &[Value] {
        &self.locals
    }

    pub fn parent(&self) -> Option<&Arc<Env>> {
        self.parent.as_ref()
    }
}

/// A control frame.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Word offset of the next instruction.
    pub pc: usize,
    /// Value stack depth.
    pub sp: usize,
    pub self_value: Value,
    pub unit: Arc<BytecodeUnit>,
    pub ep: Arc<Env>,
}

impl Frame {
    pub fn new(unit: Arc<BytecodeUnit>, self_value: Value, ep: Arc<Env>) -> Self {
        Self {
            pc: 0,
            sp: 0,
            self_value,
            unit,
            ep,
        }
    }

    /// The environment `level` scopes out; level 0 is the frame's own.
    pub fn ep_at_level(&self, level: usize) -> Option<&Arc<Env>> {
        let mut ep = &self.ep;
        for _ in 0..level {
            ep = ep.parent()?;
        }
        Some(ep)
    }
}

/// The frame stack of one mutator thread.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    frames: Vec<Frame>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<Frame> {
        self.frames.pop()
    }

    /// The innermost frame.
    pub fn current(&self) -> Option<&Frame> {
        self.frames.last()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}

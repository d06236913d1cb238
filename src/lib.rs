//! jitcore - coordination layer between a moving collector and a JIT.
//!
//! This library provides the pieces a VM needs so compiled code and a
//! relocating heap can coexist:
//! - Growable heap buffers that are copied safely while the collector moves
//!   objects ([`gc::buffer`])
//! - W^X code memory, instruction-cache flushes and a safepoint barrier
//!   ([`jit`])
//! - Process roots and the write barrier for raw stores ([`gc`])
//! - Read-only views of bytecode, frames and method entries ([`vm`])

#[cfg(not(unix))]
compile_error!("jitcore needs a Unix virtual-memory API (mmap/mprotect)");

pub mod config;
pub mod error;
pub mod gc;
pub mod jit;
pub mod vm;

// Re-export commonly used types
pub use config::{JitMode, RuntimeConfig};
pub use error::{ConfigError, HeapError, JitError, MemoryError};
pub use jit::{CodeGenerator, GeneratedCode, Jit, LockDepth, SafepointCoordinator};
pub use vm::{BytecodeUnit, Heap, ObjRef, Value};

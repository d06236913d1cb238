pub mod bytecode;
pub mod frame;
pub mod heap;
pub mod method;
mod value;

pub use bytecode::{BytecodeUnit, CallSite, Opcode};
pub use frame::{Env, ExecutionContext, Frame};
pub use heap::{Heap, HeapObject, ObjRef, ObjectKind};
pub use method::MethodEntry;
pub use value::Value;

//! Glue between the moving collector and code outside it.

pub mod barrier;
pub mod buffer;
pub mod roots;

pub use barrier::WriteBarrier;
pub use roots::{RootSet, for_each_managed_object};

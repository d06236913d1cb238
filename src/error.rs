//! Error types shared across the crate.
//!
//! Recoverable failures are plain `Result` errors. Conditions the runtime
//! cannot continue from go through [`fatal`], which logs and aborts.

use thiserror::Error;

/// Errors from the code memory manager.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("invalid code memory size: {0} bytes")]
    InvalidSize(usize),
    #[error("code region exhausted: need {needed} bytes, {available} available")]
    OutOfCodeMemory { needed: usize, available: usize },
    #[error("failed to change page protection at {addr:#x} ({size} bytes): {reason}")]
    ProtectionFailed {
        addr: usize,
        size: usize,
        reason: String,
    },
    #[error("page size {0} is unusable")]
    BadPageSize(i64),
}

/// Errors from the managed heap.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeapError {
    #[error("out of memory: requested {requested} bytes with {allocated} of {limit} in use")]
    OutOfMemory {
        requested: usize,
        allocated: usize,
        limit: usize,
    },
    #[error("stale or freed object reference {0}")]
    InvalidRef(u32),
    #[error("object {0} has no backing buffer")]
    NoBuffer(u32),
    #[error("write of {len} bytes at offset {offset} exceeds capacity {capacity}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },
}

/// Errors from the JIT driver.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum JitError {
    #[error("JIT is disabled")]
    Disabled,
    #[error("code generator declined to compile `{0}`")]
    CompileFailed(String),
    #[error("`{0}` already has an installed entry point")]
    AlreadyInstalled(String),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Errors from runtime configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("unknown option `{0}`")]
    UnknownOption(String),
    #[error("invalid value `{value}` for option `{name}`")]
    InvalidValue { name: String, value: String },
}

/// Report an unrecoverable runtime bug and abort the process.
///
/// Code memory is load-bearing once compiled code has been installed, so
/// there is no unwinding path back to a consistent state.
#[cold]
pub fn fatal(msg: &str) -> ! {
    tracing::error!(target: "jitcore", "fatal: {msg}");
    eprintln!("jitcore: fatal: {msg}");
    std::process::abort()
}

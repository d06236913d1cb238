//! Runtime configuration types.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// JIT compilation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitMode {
    /// JIT disabled, interpreter only
    Off,
    /// JIT enabled (compile hot units)
    On,
    /// Automatic: JIT enabled if supported on this platform
    #[default]
    Auto,
}

impl JitMode {
    /// Whether this mode results in an active JIT on the current host.
    pub fn is_enabled(self) -> bool {
        match self {
            JitMode::Off => false,
            JitMode::On => true,
            JitMode::Auto => cfg!(all(
                unix,
                any(target_arch = "x86_64", target_arch = "aarch64")
            )),
        }
    }
}

/// Runtime configuration for the JIT and the managed heap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub jit_mode: JitMode,
    /// Number of calls after which a unit is compiled. 1 compiles on first call.
    pub jit_threshold: u32,
    /// Size of the executable memory block to reserve, in MiB.
    pub exec_mem_size: usize,
    /// Maximum number of compiled versions per unit.
    pub max_versions: usize,
    pub greedy_versioning: bool,
    pub no_type_prop: bool,
    /// Collect JIT statistics.
    pub gen_stats: bool,
    pub trace_jit: bool,
    /// Whether GC is enabled (default: true)
    pub gc_enabled: bool,
    /// Run a full collection on every allocation.
    pub gc_stress: bool,
    /// Hard limit on heap size in bytes (None = unlimited)
    pub heap_limit: Option<usize>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            jit_mode: JitMode::Auto,
            jit_threshold: 10,
            exec_mem_size: 256,
            max_versions: 4,
            greedy_versioning: false,
            no_type_prop: false,
            gen_stats: false,
            trace_jit: false,
            gc_enabled: true,
            gc_stress: false,
            heap_limit: None,
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from TOML text. Missing keys keep their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would leave the JIT unable to compile anything.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jit_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                name: "jit_threshold".to_string(),
                value: "0".to_string(),
            });
        }
        if !exec_mem_size_is_valid(self.exec_mem_size) {
            return Err(ConfigError::InvalidValue {
                name: "exec_mem_size".to_string(),
                value: self.exec_mem_size.to_string(),
            });
        }
        Ok(())
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply a single command-line style option such as `--jit-exec-mem-size=64`
    /// or `--jit-stats`. Boolean options may omit the value.
    pub fn parse_option(&mut self, option: &str) -> Result<(), ConfigError> {
        let body = option
            .strip_prefix("--jit-")
            .or_else(|| option.strip_prefix("--gc-"))
            .ok_or_else(|| ConfigError::UnknownOption(option.to_string()))?;
        let (name, value) = match body.split_once('=') {
            Some((name, value)) => (name, Some(value)),
            None => (body, None),
        };

        let invalid = || ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.unwrap_or_default().to_string(),
        };
        let number = |value: Option<&str>| -> Result<usize, ConfigError> {
            value.and_then(|v| v.parse().ok()).ok_or_else(invalid)
        };
        let flag = |value: Option<&str>| -> Result<bool, ConfigError> {
            match value {
                None | Some("true") | Some("1") => Ok(true),
                Some("false") | Some("0") => Ok(false),
                Some(_) => Err(invalid()),
            }
        };

        match name {
            "exec-mem-size" => {
                let size = number(value)?;
                if !exec_mem_size_is_valid(size) {
                    return Err(invalid());
                }
                self.exec_mem_size = size;
            }
            "call-threshold" => {
                let threshold = number(value)?;
                self.jit_threshold = u32::try_from(threshold)
                    .ok()
                    .filter(|t| *t > 0)
                    .ok_or_else(invalid)?;
            }
            "max-versions" => self.max_versions = number(value)?,
            "greedy-versioning" => self.greedy_versioning = flag(value)?,
            "no-type-prop" => self.no_type_prop = flag(value)?,
            "stats" => self.gen_stats = flag(value)?,
            "trace" => self.trace_jit = flag(value)?,
            "mode" => {
                self.jit_mode = match value {
                    Some("on") => JitMode::On,
                    Some("off") => JitMode::Off,
                    Some("auto") => JitMode::Auto,
                    _ => return Err(invalid()),
                }
            }
            "stress" => self.gc_stress = flag(value)?,
            "heap-limit" => self.heap_limit = Some(number(value)?),
            _ => return Err(ConfigError::UnknownOption(option.to_string())),
        }
        Ok(())
    }

    /// Size of the code region to reserve, in bytes.
    pub fn exec_mem_bytes(&self) -> usize {
        self.exec_mem_size.saturating_mul(MIB)
    }
}

const MIB: usize = 1024 * 1024;

fn exec_mem_size_is_valid(size: usize) -> bool {
    size > 0 && size.checked_mul(MIB).is_some()
}

//! # Engine Configuration
//!
//! Loaded once at startup from TOML. Every field has a default, so an empty
//! file (or no file) is a valid configuration.
//!
//! ```toml
//! max_instances_per_emitter = 250000
//! dump_particle_data = false
//!
//! [vm]
//! max_input_registers = 100
//!
//! [gpu]
//! thread_group_size = 64
//! readback_latency_frames = 2
//! ```

use std::fs;
use std::path::Path;

use ember_gpu::BatcherConfig;
use ember_vm::RegisterLimits;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration load failure.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("config file error: {0}")]
    Io(#[from] std::io::Error),
    /// The TOML did not parse into [`EngineConfig`].
    #[error("config parse error: {0}")]
    Parse(String),
    /// A value parsed but is unusable.
    #[error("config validation error: {0}")]
    Invalid(String),
}

/// Result alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Top-level engine settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-emitter instance ceiling; spawns that would exceed it are dropped.
    pub max_instances_per_emitter: usize,
    /// Event cap for handlers that do not set their own.
    pub max_events_per_frame: usize,
    /// Log particle buffers after each script run.
    pub dump_particle_data: bool,
    /// Interpreter limits.
    pub vm: VmConfig,
    /// Compute dispatch settings.
    pub gpu: GpuConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_instances_per_emitter: 1_000_000,
            max_events_per_frame: 64,
            dump_particle_data: false,
            vm: VmConfig::default(),
            gpu: GpuConfig::default(),
        }
    }
}

/// `[vm]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Input registers one execution may map.
    pub max_input_registers: usize,
    /// Output registers one execution may map.
    pub max_output_registers: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            max_input_registers: ember_core::DEFAULT_MAX_INPUT_REGISTERS,
            max_output_registers: ember_core::DEFAULT_MAX_OUTPUT_REGISTERS,
        }
    }
}

/// `[gpu]` section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuConfig {
    /// Threads per dispatched group.
    pub thread_group_size: usize,
    /// Hardware cap on groups per dispatch.
    pub max_thread_groups: usize,
    /// Frames before a count readback lands on the software device.
    pub readback_latency_frames: u64,
}

impl Default for GpuConfig {
    fn default() -> Self {
        let batcher = BatcherConfig::default();
        Self {
            thread_group_size: batcher.thread_group_size,
            max_thread_groups: batcher.max_thread_groups,
            readback_latency_frames: 1,
        }
    }
}

impl EngineConfig {
    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Io`] when the file cannot be read, otherwise see
    /// [`EngineConfig::from_toml_str`].
    pub fn load<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parses TOML text. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] on malformed TOML, [`ConfigError::Invalid`]
    /// when a value is out of range.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values no emitter can run with.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Invalid`] naming the first bad field.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.gpu.thread_group_size == 0 {
            return Err(ConfigError::Invalid("gpu.thread_group_size must be > 0".into()));
        }
        if self.gpu.max_thread_groups == 0 {
            return Err(ConfigError::Invalid("gpu.max_thread_groups must be > 0".into()));
        }
        Ok(())
    }

    /// Register limits for CPU execution contexts.
    #[must_use]
    pub const fn register_limits(&self) -> RegisterLimits {
        RegisterLimits {
            max_inputs: self.vm.max_input_registers,
            max_outputs: self.vm.max_output_registers,
        }
    }

    /// Batcher settings.
    #[must_use]
    pub const fn batcher_config(&self) -> BatcherConfig {
        BatcherConfig {
            thread_group_size: self.gpu.thread_group_size,
            max_thread_groups: self.gpu.max_thread_groups,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_is_default() {
        let config = EngineConfig::from_toml_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.max_instances_per_emitter, 1_000_000);
        assert_eq!(config.gpu.max_thread_groups, 65_535);
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config = EngineConfig::from_toml_str(
            r"
            max_instances_per_emitter = 500
            [gpu]
            readback_latency_frames = 3
            ",
        )
        .unwrap();
        assert_eq!(config.max_instances_per_emitter, 500);
        assert_eq!(config.gpu.readback_latency_frames, 3);
        assert_eq!(config.gpu.thread_group_size, 64);
        assert_eq!(config.vm.max_input_registers, 100);
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let result = EngineConfig::from_toml_str("max_instances_per_emitter = \"many\"");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_zero_group_size_is_invalid() {
        let result = EngineConfig::from_toml_str("[gpu]\nthread_group_size = 0");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = EngineConfig::load("/nonexistent/ember.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}

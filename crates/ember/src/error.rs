//! # Emitter Error Types
//!
//! Emitters never return errors from `tick`. Fatal problems disable the
//! emitter and are kept as a [`DisableReason`] the caller can poll.

use ember_gpu::GpuError;
use ember_vm::ExecutionError;
use thiserror::Error;

/// Why an emitter was disabled.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DisableReason {
    /// The emitter is switched off in its properties.
    #[error("emitter is not enabled")]
    NotEnabled,

    /// A required program is absent.
    #[error("missing {0} script")]
    MissingScript(&'static str),

    /// A program has not compiled successfully.
    #[error("{script} script '{name}' is not ready to run")]
    ScriptNotReady {
        /// Which script.
        script: &'static str,
        /// Program name.
        name: String,
    },

    /// The spawn program reads particle attributes, which are uninitialized
    /// during spawn.
    #[error("spawn script '{0}' reads attribute data")]
    SpawnReadsAttributes(String),

    /// The spawn or update program declares no attributes.
    #[error("spawn or update script has no attributes")]
    NoAttributes,

    /// A program's attribute list differs from the particle layout.
    #[error("{script} script '{name}' does not match the particle layout")]
    LayoutMismatch {
        /// Which script.
        script: &'static str,
        /// Program name.
        name: String,
    },

    /// A GPU emitter was created without a compute queue.
    #[error("GPU emitter has no compute queue")]
    NoComputeQueue,

    /// A CPU context failed to bind or tick.
    #[error("execution context failed: {0}")]
    Execution(#[from] ExecutionError),

    /// The GPU kernel could not be bound or ticked.
    #[error("compute context failed: {0}")]
    Compute(#[from] GpuError),
}

/// Error from an explicit emitter operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EmitterError {
    /// The emitter is disabled.
    #[error("emitter '{name}' is disabled: {reason}")]
    Disabled {
        /// Emitter name.
        name: String,
        /// Why.
        reason: DisableReason,
    },

    /// A parameter write was rejected.
    #[error("parameter error: {0}")]
    Parameter(#[from] ember_core::ParameterError),
}

/// Result alias for emitter operations.
pub type EmitterResult<T> = Result<T, EmitterError>;

//! # GPU Error Types

use ember_core::IndexBufferHandle;
use ember_vm::ExecutionError;
use thiserror::Error;

/// Errors raised while binding or dispatching compute work.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GpuError {
    /// Kernel missing, pending or failed.
    #[error("GPU kernel unavailable: {0}")]
    KernelUnavailable(String),

    /// Program is not a compute kernel.
    #[error("program {0} is not a GPU compute kernel")]
    NotAKernel(String),

    /// Index buffer handle unknown to the device.
    #[error("unknown index buffer {0:?}")]
    UnknownIndexBuffer(IndexBufferHandle),

    /// The kernel's register reach exceeds what the data set maps.
    #[error("kernel {kernel} does not fit the register table: {reason}")]
    RegisterOverflow {
        /// Kernel name.
        kernel: String,
        /// Why mapping failed.
        reason: String,
    },

    /// Binding the kernel's external functions failed.
    #[error(transparent)]
    Binding(#[from] ExecutionError),
}

/// Result type for GPU operations.
pub type GpuResult<T> = Result<T, GpuError>;

//! # Execution Error Types
//!
//! Failures raised while binding or validating a program. Register-table
//! overflow is not an error here: it skips one call and is reported as
//! [`crate::ExecuteOutcome::Skipped`].

use thiserror::Error;

use crate::program::CompileStatus;

/// Errors that can occur while preparing a program for execution.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    /// The program has not finished compiling, or failed to.
    #[error("program {name} is not runnable: {status:?}")]
    ProgramNotReady {
        /// Program name.
        name: String,
        /// Compile status at bind time.
        status: CompileStatus,
    },

    /// No program has been bound to the context.
    #[error("execution context has no program")]
    NoProgram,

    /// The program targets a different simulation path.
    #[error("program {0} cannot run on this simulation target")]
    WrongTarget(String),

    /// An instruction refers to something the program does not declare.
    #[error("invalid instruction {index} in {program}: {reason}")]
    InvalidInstruction {
        /// Program name.
        program: String,
        /// Instruction index.
        index: usize,
        /// What is wrong with it.
        reason: String,
    },

    /// A called interface is not bound in the parameter store.
    #[error("data interface {0} is not bound")]
    MissingDataInterface(String),

    /// The bound interface does not provide a called function.
    #[error("data interface {interface} does not provide {function}")]
    UnresolvedFunction {
        /// Interface parameter name.
        interface: String,
        /// Function name.
        function: String,
    },

    /// Resolved function count differs from the program's declaration.
    #[error("function table mismatch: expected {expected}, resolved {resolved}")]
    FunctionTableMismatch {
        /// Declared count.
        expected: usize,
        /// Resolved count.
        resolved: usize,
    },
}

/// Result type for execution setup.
pub type ExecResult<T> = Result<T, ExecutionError>;

//! # EMBER VM
//!
//! Register-based interpreter for particle scripts and the CPU execution
//! context that drives it.
//!
//! ## Architecture Rules
//!
//! 1. **Bind once, call by index** - external functions resolve by name at
//!    tick time into a flat table; bytecode calls table slots
//! 2. **Read previous, write current** - input registers map last frame's
//!    columns, output registers this frame's
//! 3. **Never grow on update** - an execution may kill instances, never add them
//! 4. **Skip, don't fail** - a call that cannot be mapped is skipped whole
//!
//! ## Example
//!
//! ```rust,ignore
//! use ember_vm::{DataSetWindow, ExecutionContext};
//!
//! let mut context = ExecutionContext::new();
//! context.init(update_program, SimTarget::Cpu)?;
//! context.tick(owner)?;
//! context.execute(data.prev_num_instances(), &mut [DataSetWindow::main(&mut data)]);
//! context.post_tick();
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod bytecode;
pub mod context;
pub mod error;
pub mod interpreter;
pub mod program;

pub use bytecode::{BinaryOp, IntOp, Op, Operand, UnaryOp};
pub use context::{
    resolve_function_table, ContextState, DataSetWindow, ExecuteOutcome, ExecutionContext,
    RegisterLimits,
};
pub use error::{ExecResult, ExecutionError};
pub use interpreter::Interpreter;
pub use program::{CompileStatus, EventExecutionMode, Program, ProgramBuilder, ScriptKind};

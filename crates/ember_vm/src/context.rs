//! # CPU Execution Context
//!
//! Binds one program to its parameter store and resolved function table,
//! and runs it over data set windows.
//!
//! ## State Machine
//!
//! ```text
//! Uninitialized --init--> Ready --tick--> Binding --execute--> Executing
//!                           ^                ^                     |
//!                           |                +---------------------+
//!                           +------------post_tick-- PostTick
//! ```
//!
//! `init` refuses programs that are not compiled. `tick` fails (without
//! touching any buffer) when the function table cannot be resolved; the
//! owner treats that as fatal. `execute` never fails: a call whose
//! registers do not fit is skipped.

use std::sync::Arc;

use ember_core::{
    DataSet, ExternalFunction, InstanceId, ParameterStore, RegisterTable, SimTarget,
    DEFAULT_MAX_INPUT_REGISTERS, DEFAULT_MAX_OUTPUT_REGISTERS,
};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::{ExecResult, ExecutionError};
use crate::interpreter::Interpreter;
use crate::program::{Program, ScriptKind};

/// Lifecycle of an execution context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ContextState {
    /// No program bound.
    Uninitialized,
    /// Bound and idle.
    Ready,
    /// Ticked this frame; functions and parameters are current.
    Binding,
    /// Inside `execute`.
    Executing,
    /// Frame finished.
    PostTick,
}

/// One data set mapped into an execution.
pub struct DataSetWindow<'a> {
    /// Data set to read from `previous` and write to `current`.
    pub data_set: &'a mut DataSet,
    /// First instance of the window.
    pub start_instance: usize,
    /// Allocate `start_instance + num_instances` before mapping.
    pub allocate: bool,
    /// Set the live count to `start_instance + written` afterwards.
    pub update_instance_count: bool,
}

impl<'a> DataSetWindow<'a> {
    /// Window over the whole data set that allocates and updates the count.
    pub fn main(data_set: &'a mut DataSet) -> Self {
        Self {
            data_set,
            start_instance: 0,
            allocate: true,
            update_instance_count: true,
        }
    }

    /// Read-only window starting at `start_instance`.
    pub fn read_only(data_set: &'a mut DataSet, start_instance: usize) -> Self {
        Self {
            data_set,
            start_instance,
            allocate: false,
            update_instance_count: false,
        }
    }
}

/// Result of one `execute` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecuteOutcome {
    /// The interpreter ran.
    Executed {
        /// Instances written to the first window.
        instances_written: usize,
    },
    /// The call was skipped; buffers are unchanged.
    Skipped,
}

/// Register limits for one execution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegisterLimits {
    /// Maximum input registers.
    pub max_inputs: usize,
    /// Maximum output registers.
    pub max_outputs: usize,
}

impl Default for RegisterLimits {
    fn default() -> Self {
        Self {
            max_inputs: DEFAULT_MAX_INPUT_REGISTERS,
            max_outputs: DEFAULT_MAX_OUTPUT_REGISTERS,
        }
    }
}

/// Runs one program on the CPU.
pub struct ExecutionContext {
    program: Option<Arc<Program>>,
    parameters: ParameterStore,
    function_table: Vec<ExternalFunction>,
    state: ContextState,
    limits: RegisterLimits,
    rng: ChaCha8Rng,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    /// Creates an unbound context with default register limits.
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: None,
            parameters: ParameterStore::new(),
            function_table: Vec::new(),
            state: ContextState::Uninitialized,
            limits: RegisterLimits::default(),
            rng: ChaCha8Rng::seed_from_u64(0),
        }
    }

    /// Sets the register limits.
    #[must_use]
    pub fn with_limits(mut self, limits: RegisterLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Reseeds the random stream used by the `Random` instruction.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = ChaCha8Rng::seed_from_u64(seed);
        self
    }

    /// Binds `program` and rebuilds the parameter store from its layout.
    ///
    /// # Errors
    ///
    /// The program is not compiled or fails validation, or it is a GPU
    /// kernel bound to a CPU context. The context then stays
    /// [`ContextState::Uninitialized`].
    pub fn init(&mut self, program: Arc<Program>, target: SimTarget) -> ExecResult<()> {
        self.state = ContextState::Uninitialized;
        self.program = None;
        self.function_table.clear();

        program.validate()?;
        let gpu_kernel = program.kind() == ScriptKind::GpuCompute;
        if gpu_kernel != (target == SimTarget::Gpu) {
            return Err(ExecutionError::WrongTarget(program.name().to_string()));
        }

        self.parameters = ParameterStore::from_layout(
            program.parameters(),
            program.data_interfaces(),
            program.interpolated_parameters(),
        );
        self.parameters.mark_interfaces_dirty();
        self.program = Some(program);
        self.state = ContextState::Ready;
        Ok(())
    }

    /// Current state.
    #[inline]
    #[must_use]
    pub const fn state(&self) -> ContextState {
        self.state
    }

    /// Bound program.
    #[inline]
    #[must_use]
    pub fn program(&self) -> Option<&Arc<Program>> {
        self.program.as_ref()
    }

    /// Parameter store.
    #[inline]
    #[must_use]
    pub fn parameters(&self) -> &ParameterStore {
        &self.parameters
    }

    /// Mutable parameter store.
    #[inline]
    pub fn parameters_mut(&mut self) -> &mut ParameterStore {
        &mut self.parameters
    }

    /// Resolved external functions.
    #[inline]
    #[must_use]
    pub fn function_table_len(&self) -> usize {
        self.function_table.len()
    }

    /// Per-frame binding step.
    ///
    /// Rebuilds the function table when interfaces changed, then ticks the
    /// parameter store.
    ///
    /// # Errors
    ///
    /// No program is bound, or the function table cannot be resolved. No
    /// buffer or parameter is modified on failure.
    pub fn tick(&mut self, owner: InstanceId) -> ExecResult<()> {
        if self.program.is_none() {
            return Err(ExecutionError::NoProgram);
        }
        if self.parameters.interfaces_dirty() {
            self.rebuild_function_table(owner)?;
        }
        self.parameters.tick();
        self.state = ContextState::Binding;
        Ok(())
    }

    /// Resolves every external function against the bound interfaces.
    ///
    /// # Errors
    ///
    /// See [`resolve_function_table`]. The old table is kept.
    pub fn rebuild_function_table(&mut self, owner: InstanceId) -> ExecResult<()> {
        let program = self.program.as_ref().ok_or(ExecutionError::NoProgram)?;
        self.function_table = resolve_function_table(program, &self.parameters, owner)?;
        self.parameters.clear_interfaces_dirty();
        Ok(())
    }

    /// Runs the program over `num_instances` instances.
    ///
    /// Windows are mapped in order: window 0's registers come first. When
    /// the mapped registers overflow the limits, or the bytecode reaches
    /// past them, the call is skipped and no buffer changes.
    pub fn execute(&mut self, num_instances: usize, windows: &mut [DataSetWindow<'_>]) -> ExecuteOutcome {
        let Some(program) = self.program.clone() else {
            return ExecuteOutcome::Skipped;
        };
        if self.state == ContextState::Uninitialized {
            return ExecuteOutcome::Skipped;
        }

        for window in windows.iter_mut() {
            if window.allocate {
                window.data_set.allocate(window.start_instance + num_instances);
            }
        }

        let num_windows = windows.len();
        self.state = ContextState::Executing;
        let written = {
            let mut table = RegisterTable::new(self.limits.max_inputs, self.limits.max_outputs);
            for window in windows.iter_mut() {
                let start = window.start_instance;
                if let Err(err) = window.data_set.append_to_register_table(&mut table, start) {
                    tracing::warn!("skipping {}: {}", program.name(), err);
                    self.state = ContextState::Binding;
                    return ExecuteOutcome::Skipped;
                }
            }

            let mut interpreter = Interpreter::new(&program);
            if !interpreter.fits(&table) {
                tracing::warn!(
                    "skipping {}: bytecode reaches {} inputs / {} outputs, {} / {} mapped",
                    program.name(),
                    program.input_registers(),
                    program.output_registers(),
                    table.num_inputs(),
                    table.num_outputs()
                );
                self.state = ContextState::Binding;
                return ExecuteOutcome::Skipped;
            }
            interpreter.run(
                &mut table,
                &self.parameters,
                &self.function_table,
                &mut self.rng,
                num_instances,
                num_windows,
            )
        };

        for (window, &count) in windows.iter_mut().zip(&written) {
            if window.update_instance_count {
                let count = count.min(num_instances);
                window.data_set.set_num_instances(window.start_instance + count);
            }
        }

        self.state = ContextState::Binding;
        ExecuteOutcome::Executed {
            instances_written: written.first().copied().unwrap_or(0),
        }
    }

    /// End-of-frame step: parameter interpolation snapshot.
    pub fn post_tick(&mut self) {
        if self.state == ContextState::Uninitialized {
            return;
        }
        self.parameters.post_tick();
        self.state = ContextState::PostTick;
    }
}

/// Resolves `program`'s external functions by name against the interfaces
/// bound in `parameters`, in declaration order.
///
/// # Errors
///
/// An interface is unbound, a function is unsupported, or fewer interfaces
/// are bound than the program declares.
pub fn resolve_function_table(
    program: &Program,
    parameters: &ParameterStore,
    owner: InstanceId,
) -> ExecResult<Vec<ExternalFunction>> {
    let mut table = Vec::with_capacity(program.external_functions().len());
    for signature in program.external_functions() {
        let interface = parameters
            .interface(&signature.interface)
            .ok_or_else(|| ExecutionError::MissingDataInterface(signature.interface.clone()))?;
        let function = interface.bind_function(signature, owner).ok_or_else(|| {
            ExecutionError::UnresolvedFunction {
                interface: signature.interface.clone(),
                function: signature.name.clone(),
            }
        })?;
        table.push(function);
    }

    let bound = program
        .data_interfaces()
        .iter()
        .filter(|name| parameters.interface(name).is_some())
        .count();
    if bound != program.data_interfaces().len() {
        return Err(ExecutionError::FunctionTableMismatch {
            expected: program.data_interfaces().len(),
            resolved: bound,
        });
    }
    Ok(table)
}

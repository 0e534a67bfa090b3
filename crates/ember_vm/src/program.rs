//! # Compiled Programs
//!
//! A program is what the authoring side hands over: the attributes it
//! touches, the parameters and external functions it needs, and its
//! bytecode. The core never compiles anything; it only validates that a
//! program can be bound.

use ember_core::{Attribute, FunctionSignature, ParameterDecl};

use crate::bytecode::{Op, Operand};
use crate::error::{ExecResult, ExecutionError};

/// How an event handler maps events onto particles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventExecutionMode {
    /// Run over the whole population once per event.
    EveryParticle,
    /// Run over the particles spawned for each event.
    SpawnedParticles,
    /// Run on one particle named by the event.
    SingleParticle,
}

/// Role of a program within an emitter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScriptKind {
    /// Initializes newly spawned particles.
    Spawn,
    /// Advances existing particles; may kill, never adds.
    Update,
    /// Reacts to events from another emitter.
    Event(EventExecutionMode),
    /// Combined spawn + update kernel for the GPU path.
    GpuCompute,
}

/// Compilation state reported by the authoring side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompileStatus {
    /// Ready to run.
    Compiled,
    /// Still compiling.
    Pending,
    /// Compilation failed.
    Failed,
}

/// A compiled, immutable program.
#[derive(Clone, Debug, PartialEq)]
pub struct Program {
    name: String,
    kind: ScriptKind,
    status: CompileStatus,
    attributes: Vec<Attribute>,
    parameters: Vec<ParameterDecl>,
    data_interfaces: Vec<String>,
    external_functions: Vec<FunctionSignature>,
    interpolated_parameters: bool,
    num_temps: usize,
    bytecode: Vec<Op>,
    input_registers: usize,
    output_registers: usize,
    reads_attributes: bool,
    acquires: Vec<u8>,
}

impl Program {
    /// Starts building a program.
    #[must_use]
    pub fn builder(name: impl Into<String>, kind: ScriptKind) -> ProgramBuilder {
        ProgramBuilder {
            name: name.into(),
            kind,
            status: CompileStatus::Compiled,
            attributes: Vec::new(),
            parameters: Vec::new(),
            data_interfaces: Vec::new(),
            external_functions: Vec::new(),
            interpolated_parameters: false,
            num_temps: 0,
            bytecode: Vec::new(),
        }
    }

    /// Program name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Program role.
    #[inline]
    #[must_use]
    pub const fn kind(&self) -> ScriptKind {
        self.kind
    }

    /// Compile status.
    #[inline]
    #[must_use]
    pub const fn status(&self) -> CompileStatus {
        self.status
    }

    /// Whether the program finished compiling successfully.
    #[inline]
    #[must_use]
    pub fn is_compiled(&self) -> bool {
        self.status == CompileStatus::Compiled
    }

    /// Attributes read and written, in register order.
    #[inline]
    #[must_use]
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Declared parameters, in block order.
    #[inline]
    #[must_use]
    pub fn parameters(&self) -> &[ParameterDecl] {
        &self.parameters
    }

    /// Declared data interface parameter names.
    #[inline]
    #[must_use]
    pub fn data_interfaces(&self) -> &[String] {
        &self.data_interfaces
    }

    /// External calls, in table order.
    #[inline]
    #[must_use]
    pub fn external_functions(&self) -> &[FunctionSignature] {
        &self.external_functions
    }

    /// Whether the program reads last frame's parameters.
    #[inline]
    #[must_use]
    pub const fn interpolated_parameters(&self) -> bool {
        self.interpolated_parameters
    }

    /// Temporaries needed per instance.
    #[inline]
    #[must_use]
    pub const fn num_temps(&self) -> usize {
        self.num_temps
    }

    /// Instructions.
    #[inline]
    #[must_use]
    pub fn bytecode(&self) -> &[Op] {
        &self.bytecode
    }

    /// Input registers the bytecode reaches (highest index + 1).
    #[inline]
    #[must_use]
    pub const fn input_registers(&self) -> usize {
        self.input_registers
    }

    /// Output registers the bytecode reaches (highest index + 1).
    #[inline]
    #[must_use]
    pub const fn output_registers(&self) -> usize {
        self.output_registers
    }

    /// Whether any instruction reads an input register.
    #[inline]
    #[must_use]
    pub const fn reads_attributes(&self) -> bool {
        self.reads_attributes
    }

    /// Window indices whose written count comes from `AcquireIndex`.
    #[inline]
    #[must_use]
    pub fn acquired_data_sets(&self) -> &[u8] {
        &self.acquires
    }

    /// Size of the parameter block the layout produces.
    #[must_use]
    pub fn parameter_block_size(&self) -> usize {
        self.parameters.iter().map(|p| p.value_type.size_bytes()).sum()
    }

    /// Whether the program is compiled and internally consistent.
    ///
    /// # Errors
    ///
    /// [`ExecutionError::ProgramNotReady`] when not compiled, or
    /// [`ExecutionError::InvalidInstruction`] for the first bad instruction.
    pub fn validate(&self) -> ExecResult<()> {
        if !self.is_compiled() {
            return Err(ExecutionError::ProgramNotReady {
                name: self.name.clone(),
                status: self.status,
            });
        }

        let block_size = self.parameter_block_size();
        for (index, op) in self.bytecode.iter().enumerate() {
            let invalid = |reason: String| ExecutionError::InvalidInstruction {
                program: self.name.clone(),
                index,
                reason,
            };

            for operand in op.operands() {
                match operand {
                    Operand::Temp(t) if usize::from(t) >= self.num_temps => {
                        return Err(invalid(format!("temporary {t} out of range")));
                    }
                    Operand::Param(offset) | Operand::PrevParam(offset)
                        if offset as usize + ember_core::WORD_SIZE > block_size =>
                    {
                        return Err(invalid(format!("parameter offset {offset} out of range")));
                    }
                    _ => {}
                }
            }
            if let Some(t) = op.destinations().find(|t| usize::from(*t) >= self.num_temps) {
                return Err(invalid(format!("temporary {t} out of range")));
            }

            if let Op::CallExternal { function, args, dst } = op {
                let Some(signature) = self.external_functions.get(usize::from(*function)) else {
                    return Err(invalid(format!("function {function} not declared")));
                };
                if args.len() != signature.num_inputs || dst.len() != signature.num_outputs {
                    return Err(invalid(format!(
                        "{} takes {} inputs and {} outputs",
                        signature.name, signature.num_inputs, signature.num_outputs
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Builder for [`Program`].
#[derive(Clone, Debug)]
pub struct ProgramBuilder {
    name: String,
    kind: ScriptKind,
    status: CompileStatus,
    attributes: Vec<Attribute>,
    parameters: Vec<ParameterDecl>,
    data_interfaces: Vec<String>,
    external_functions: Vec<FunctionSignature>,
    interpolated_parameters: bool,
    num_temps: usize,
    bytecode: Vec<Op>,
}

impl ProgramBuilder {
    /// Sets the compile status (defaults to compiled).
    #[must_use]
    pub fn status(mut self, status: CompileStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the attribute list.
    #[must_use]
    pub fn attributes(mut self, attributes: Vec<Attribute>) -> Self {
        self.attributes = attributes;
        self
    }

    /// Declares a parameter.
    #[must_use]
    pub fn parameter(mut self, decl: ParameterDecl) -> Self {
        self.parameters.push(decl);
        self
    }

    /// Declares a data interface parameter.
    #[must_use]
    pub fn data_interface(mut self, name: impl Into<String>) -> Self {
        self.data_interfaces.push(name.into());
        self
    }

    /// Declares an external function.
    #[must_use]
    pub fn function(mut self, signature: FunctionSignature) -> Self {
        self.external_functions.push(signature);
        self
    }

    /// Marks the program as reading last frame's parameters.
    #[must_use]
    pub fn interpolated(mut self, interpolated: bool) -> Self {
        self.interpolated_parameters = interpolated;
        self
    }

    /// Sets the number of temporaries.
    #[must_use]
    pub fn temps(mut self, num_temps: usize) -> Self {
        self.num_temps = num_temps;
        self
    }

    /// Appends instructions.
    #[must_use]
    pub fn ops(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        self.bytecode.extend(ops);
        self
    }

    /// Finishes the program and derives its register usage.
    #[must_use]
    pub fn build(self) -> Program {
        let mut input_registers = 0;
        let mut output_registers = 0;
        let mut reads_attributes = false;
        let mut acquires = Vec::new();

        for op in &self.bytecode {
            for operand in op.operands() {
                if let Operand::Input(r) | Operand::InputNoAdvance(r) = operand {
                    input_registers = input_registers.max(usize::from(r) + 1);
                    reads_attributes = true;
                }
            }
            match op {
                Op::Output { register, .. } => {
                    output_registers = output_registers.max(usize::from(*register) + 1);
                }
                Op::AcquireIndex { data_set, .. } if !acquires.contains(data_set) => {
                    acquires.push(*data_set);
                }
                _ => {}
            }
        }

        Program {
            name: self.name,
            kind: self.kind,
            status: self.status,
            attributes: self.attributes,
            parameters: self.parameters,
            data_interfaces: self.data_interfaces,
            external_functions: self.external_functions,
            interpolated_parameters: self.interpolated_parameters,
            num_temps: self.num_temps,
            bytecode: self.bytecode,
            input_registers,
            output_registers,
            reads_attributes,
            acquires,
        }
    }
}

//! # Interpreter
//!
//! Runs a program's bytecode over a range of instances.
//!
//! ## Execution Model
//!
//! - Instances are processed one at a time, instructions in order
//! - Temporaries are cleared per instance
//! - Reads outside a register's mapped range yield 0
//! - Writes outside a register's mapped range are dropped
//!
//! Callers check register reach before running (see
//! [`Interpreter::fits`]); after that the loop cannot fail.

use std::ops::Range;

use ember_core::{ExternalFunction, ParameterStore, RegisterTable};
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::bytecode::{BinaryOp, IntOp, Op, Operand, UnaryOp};
use crate::program::Program;

/// Per-call interpreter state.
pub struct Interpreter<'p> {
    program: &'p Program,
    temps: Vec<u32>,
    args: Vec<u32>,
    results: Vec<u32>,
    /// Slots reserved per window by `AcquireIndex`.
    acquired: Vec<usize>,
}

impl<'p> Interpreter<'p> {
    /// Prepares to run `program`.
    #[must_use]
    pub fn new(program: &'p Program) -> Self {
        Self {
            program,
            temps: vec![0; program.num_temps()],
            args: Vec::with_capacity(8),
            results: Vec::with_capacity(8),
            acquired: Vec::new(),
        }
    }

    /// Whether every register the bytecode touches is mapped in `table`.
    #[must_use]
    pub fn fits(&self, table: &RegisterTable<'_>) -> bool {
        self.program.input_registers() <= table.num_inputs()
            && self.program.output_registers() <= table.num_outputs()
    }

    /// Runs the program over `num_instances` instances.
    ///
    /// Returns the written instance count of each of the `num_windows`
    /// mapped data sets: the number of `AcquireIndex` slots for windows the
    /// program compacts into, `num_instances` otherwise.
    pub fn run(
        &mut self,
        table: &mut RegisterTable<'_>,
        parameters: &ParameterStore,
        functions: &[ExternalFunction],
        rng: &mut ChaCha8Rng,
        num_instances: usize,
        num_windows: usize,
    ) -> Vec<usize> {
        self.begin(num_windows);
        self.run_range(table, parameters, functions, rng, 0..num_instances);
        self.written(num_instances)
    }

    /// Clears compaction counters for a new call over `num_windows` windows.
    pub fn begin(&mut self, num_windows: usize) {
        self.acquired.clear();
        self.acquired.resize(num_windows, 0);
    }

    /// Runs the program over one contiguous slice of instances.
    ///
    /// Compaction counters carry over between slices of the same call, so a
    /// strided dispatch can be replayed slice by slice.
    pub fn run_range(
        &mut self,
        table: &mut RegisterTable<'_>,
        parameters: &ParameterStore,
        functions: &[ExternalFunction],
        rng: &mut ChaCha8Rng,
        instances: Range<usize>,
    ) {
        let program = self.program;
        for instance in instances {
            self.temps.fill(0);
            for op in program.bytecode() {
                self.step(op, instance, table, parameters, functions, rng);
            }
        }
    }

    /// Written instance count per window after `num_instances` were run.
    #[must_use]
    pub fn written(&self, num_instances: usize) -> Vec<usize> {
        let program = self.program;
        (0..self.acquired.len())
            .map(|window| {
                let compacted = u8::try_from(window)
                    .map(|w| program.acquired_data_sets().contains(&w))
                    .unwrap_or(false);
                if compacted {
                    self.acquired[window]
                } else {
                    num_instances
                }
            })
            .collect()
    }

    fn step(
        &mut self,
        op: &Op,
        instance: usize,
        table: &mut RegisterTable<'_>,
        parameters: &ParameterStore,
        functions: &[ExternalFunction],
        rng: &mut ChaCha8Rng,
    ) {
        match op {
            Op::Binary { op, a, b, dst } => {
                let a = f32::from_bits(self.fetch(*a, instance, table, parameters));
                let b = f32::from_bits(self.fetch(*b, instance, table, parameters));
                let word = match op {
                    BinaryOp::Add => (a + b).to_bits(),
                    BinaryOp::Sub => (a - b).to_bits(),
                    BinaryOp::Mul => (a * b).to_bits(),
                    BinaryOp::Div => (a / b).to_bits(),
                    BinaryOp::Min => a.min(b).to_bits(),
                    BinaryOp::Max => a.max(b).to_bits(),
                    BinaryOp::Less => u32::from(a < b),
                    BinaryOp::Greater => u32::from(a > b),
                };
                self.store(*dst, word);
            }
            Op::Unary { op, a, dst } => {
                let word = self.fetch(*a, instance, table, parameters);
                let value = f32::from_bits(word);
                let word = match op {
                    UnaryOp::Neg => (-value).to_bits(),
                    UnaryOp::Abs => value.abs().to_bits(),
                    UnaryOp::Sqrt => value.sqrt().to_bits(),
                    #[allow(clippy::cast_possible_truncation)]
                    UnaryOp::ToInt => bytemuck::cast(value as i32),
                    #[allow(clippy::cast_precision_loss)]
                    UnaryOp::ToFloat => (bytemuck::cast::<u32, i32>(word) as f32).to_bits(),
                };
                self.store(*dst, word);
            }
            Op::Int { op, a, b, dst } => {
                let a: i32 = bytemuck::cast(self.fetch(*a, instance, table, parameters));
                let b: i32 = bytemuck::cast(self.fetch(*b, instance, table, parameters));
                let value = match op {
                    IntOp::Add => a.wrapping_add(b),
                    IntOp::Sub => a.wrapping_sub(b),
                    IntOp::Mul => a.wrapping_mul(b),
                    IntOp::Equal => i32::from(a == b),
                    IntOp::Less => i32::from(a < b),
                    IntOp::And => a & b,
                };
                self.store(*dst, bytemuck::cast(value));
            }
            Op::Select { cond, a, b, dst } => {
                let pick = if self.fetch(*cond, instance, table, parameters) != 0 {
                    *a
                } else {
                    *b
                };
                let word = self.fetch(pick, instance, table, parameters);
                self.store(*dst, word);
            }
            Op::Random { dst } => {
                let value: f32 = rng.gen();
                self.store(*dst, value.to_bits());
            }
            Op::ExecIndex { dst } => {
                self.store(*dst, bytemuck::cast(to_i32(instance)));
            }
            Op::AcquireIndex { data_set, keep, dst } => {
                let keep = self.fetch(*keep, instance, table, parameters) != 0;
                let slot = match self.acquired.get_mut(usize::from(*data_set)) {
                    Some(next) if keep => {
                        let slot = to_i32(*next);
                        *next += 1;
                        slot
                    }
                    _ => -1,
                };
                self.store(*dst, bytemuck::cast(slot));
            }
            Op::Output { register, index, value } => {
                let slot = match index {
                    Some(index) => {
                        let slot: i32 = bytemuck::cast(self.fetch(*index, instance, table, parameters));
                        match usize::try_from(slot) {
                            Ok(slot) => slot,
                            Err(_) => return,
                        }
                    }
                    None => instance,
                };
                let word = self.fetch(*value, instance, table, parameters);
                if let Some(target) = table
                    .output_mut(usize::from(*register))
                    .and_then(|column| column.get_mut(slot))
                {
                    *target = word;
                }
            }
            Op::CallExternal { function, args, dst } => {
                let Some(callee) = functions.get(usize::from(*function)) else {
                    return;
                };
                let mut inputs = std::mem::take(&mut self.args);
                inputs.clear();
                for arg in args {
                    inputs.push(self.fetch(*arg, instance, table, parameters));
                }
                let mut outputs = std::mem::take(&mut self.results);
                outputs.clear();
                outputs.resize(dst.len(), 0);

                callee(&inputs, &mut outputs);

                for (t, word) in dst.iter().zip(&outputs) {
                    self.store(*t, *word);
                }
                self.args = inputs;
                self.results = outputs;
            }
            Op::AcquireId { id, tag } => {
                let (acquired, acquire_tag) = table
                    .ids_mut()
                    .map_or((-1, 0), |ids| (ids.acquire().unwrap_or(-1), ids.acquire_tag()));
                self.store(*id, bytemuck::cast(acquired));
                self.store(*tag, bytemuck::cast(acquire_tag));
            }
            Op::UpdateId { id, index } => {
                let id: i32 = bytemuck::cast(self.fetch(*id, instance, table, parameters));
                let index: i32 = bytemuck::cast(self.fetch(*index, instance, table, parameters));
                if let Some(ids) = table.ids_mut() {
                    ids.update(id, index);
                }
            }
        }
    }

    fn fetch(
        &self,
        operand: Operand,
        instance: usize,
        table: &RegisterTable<'_>,
        parameters: &ParameterStore,
    ) -> u32 {
        match operand {
            Operand::Input(r) => read_register(table, r, instance),
            Operand::InputNoAdvance(r) => read_register(table, r, 0),
            Operand::Param(offset) => parameters.read_word(offset as usize),
            Operand::PrevParam(offset) => parameters.read_previous_word(offset as usize),
            Operand::Temp(t) => self.temps.get(usize::from(t)).copied().unwrap_or(0),
            Operand::Float(value) => value.to_bits(),
            Operand::Int(value) => bytemuck::cast(value),
        }
    }

    #[inline]
    fn store(&mut self, temp: u16, word: u32) {
        if let Some(slot) = self.temps.get_mut(usize::from(temp)) {
            *slot = word;
        }
    }
}

fn read_register(table: &RegisterTable<'_>, register: u16, element: usize) -> u32 {
    table
        .input(usize::from(register))
        .and_then(|column| column.get(element))
        .copied()
        .unwrap_or(0)
}

fn to_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

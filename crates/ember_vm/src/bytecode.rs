//! # Bytecode
//!
//! Instruction set of the particle interpreter.
//!
//! Every value is one 32-bit word. Float instructions reinterpret words as
//! `f32`, integer instructions as `i32`. Comparisons produce integer
//! booleans (`1`/`0`).
//!
//! Instructions run once per instance, in order. Temporaries are scratch
//! words reset for each instance.

/// Where an instruction reads a word from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Operand {
    /// Input register, element at the current instance.
    Input(u16),
    /// Input register, first element of the window, for every instance.
    ///
    /// Event handlers read their event payload this way.
    InputNoAdvance(u16),
    /// Parameter word at a byte offset of this frame's block.
    Param(u32),
    /// Parameter word at a byte offset of last frame's block.
    PrevParam(u32),
    /// Temporary register.
    Temp(u16),
    /// Float literal.
    Float(f32),
    /// Integer literal.
    Int(i32),
}

/// Binary float operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    /// `a + b`
    Add,
    /// `a - b`
    Sub,
    /// `a * b`
    Mul,
    /// `a / b`
    Div,
    /// `min(a, b)`
    Min,
    /// `max(a, b)`
    Max,
    /// `a < b` as an integer boolean.
    Less,
    /// `a > b` as an integer boolean.
    Greater,
}

/// Unary float operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    /// `-a`
    Neg,
    /// `|a|`
    Abs,
    /// `sqrt(a)`
    Sqrt,
    /// Float to integer, truncating.
    ToInt,
    /// Integer to float.
    ToFloat,
}

/// Binary integer operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntOp {
    /// Wrapping `a + b`
    Add,
    /// Wrapping `a - b`
    Sub,
    /// Wrapping `a * b`
    Mul,
    /// `a == b` as an integer boolean.
    Equal,
    /// `a < b` as an integer boolean.
    Less,
    /// Bitwise and.
    And,
}

/// One interpreter instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum Op {
    /// Float binary operation into a temporary.
    Binary {
        /// Operation.
        op: BinaryOp,
        /// Left operand.
        a: Operand,
        /// Right operand.
        b: Operand,
        /// Destination temporary.
        dst: u16,
    },
    /// Float unary operation into a temporary.
    Unary {
        /// Operation.
        op: UnaryOp,
        /// Operand.
        a: Operand,
        /// Destination temporary.
        dst: u16,
    },
    /// Integer binary operation into a temporary.
    Int {
        /// Operation.
        op: IntOp,
        /// Left operand.
        a: Operand,
        /// Right operand.
        b: Operand,
        /// Destination temporary.
        dst: u16,
    },
    /// `dst = cond != 0 ? a : b`
    Select {
        /// Integer condition.
        cond: Operand,
        /// Value when true.
        a: Operand,
        /// Value when false.
        b: Operand,
        /// Destination temporary.
        dst: u16,
    },
    /// Uniform random float in `[0, 1)`.
    Random {
        /// Destination temporary.
        dst: u16,
    },
    /// Index of the instance within this call, as an integer.
    ExecIndex {
        /// Destination temporary.
        dst: u16,
    },
    /// Reserves the next output slot of a data set when `keep` is non-zero.
    ///
    /// Writes the slot index, or -1 for a killed instance. The number of
    /// slots reserved becomes the data set's written count.
    AcquireIndex {
        /// Window index of the data set.
        data_set: u8,
        /// Integer keep flag.
        keep: Operand,
        /// Destination temporary.
        dst: u16,
    },
    /// Writes a word to an output register.
    Output {
        /// Output register.
        register: u16,
        /// Slot to write, from `AcquireIndex`. `None` writes at the
        /// instance index. Negative slots are dropped.
        index: Option<Operand>,
        /// Value to write.
        value: Operand,
    },
    /// Calls an entry of the resolved function table.
    CallExternal {
        /// Index into the program's external function list.
        function: u16,
        /// Argument words.
        args: Vec<Operand>,
        /// Destination temporaries, one per output word.
        dst: Vec<u16>,
    },
    /// Takes a persistent ID from the free list.
    AcquireId {
        /// Destination temporary for the ID (-1 when exhausted).
        id: u16,
        /// Destination temporary for the acquire tag.
        tag: u16,
    },
    /// Records where a persistent ID lives; a negative index frees it.
    UpdateId {
        /// Persistent ID.
        id: Operand,
        /// Instance slot, usually from `AcquireIndex`.
        index: Operand,
    },
}

impl Op {
    /// Operands this instruction reads.
    pub fn operands(&self) -> impl Iterator<Item = Operand> + '_ {
        let fixed: [Option<Operand>; 3] = match self {
            Self::Binary { a, b, .. } | Self::Int { a, b, .. } => [Some(*a), Some(*b), None],
            Self::Unary { a, .. } => [Some(*a), None, None],
            Self::Select { cond, a, b, .. } => [Some(*cond), Some(*a), Some(*b)],
            Self::AcquireIndex { keep, .. } => [Some(*keep), None, None],
            Self::Output { index, value, .. } => [*index, Some(*value), None],
            Self::UpdateId { id, index } => [Some(*id), Some(*index), None],
            Self::Random { .. }
            | Self::ExecIndex { .. }
            | Self::AcquireId { .. }
            | Self::CallExternal { .. } => [None, None, None],
        };
        let args: &[Operand] = match self {
            Self::CallExternal { args, .. } => args,
            _ => &[],
        };
        fixed.into_iter().flatten().chain(args.iter().copied())
    }

    /// Temporaries this instruction writes.
    pub fn destinations(&self) -> impl Iterator<Item = u16> + '_ {
        let fixed: [Option<u16>; 2] = match self {
            Self::Binary { dst, .. }
            | Self::Unary { dst, .. }
            | Self::Int { dst, .. }
            | Self::Select { dst, .. }
            | Self::Random { dst }
            | Self::ExecIndex { dst }
            | Self::AcquireIndex { dst, .. } => [Some(*dst), None],
            Self::AcquireId { id, tag } => [Some(*id), Some(*tag)],
            Self::Output { .. } | Self::CallExternal { .. } | Self::UpdateId { .. } => [None, None],
        };
        let dst: &[u16] = match self {
            Self::CallExternal { dst, .. } => dst,
            _ => &[],
        };
        fixed.into_iter().flatten().chain(dst.iter().copied())
    }
}

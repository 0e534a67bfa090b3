//! # Register Table
//!
//! Flat list of column slices an execution reads and writes. Data sets
//! append themselves in window order: for each data set, its `previous`
//! columns become input registers and its `current` columns become output
//! registers, both offset to the window's start instance.

use crate::ids::PersistentIds;

/// Input/output registers for one interpreter call.
pub struct RegisterTable<'a> {
    inputs: Vec<&'a [u32]>,
    outputs: Vec<&'a mut [u32]>,
    ids: Option<&'a mut PersistentIds>,
    max_inputs: usize,
    max_outputs: usize,
}

impl<'a> RegisterTable<'a> {
    /// Creates an empty table with register limits.
    #[must_use]
    pub fn new(max_inputs: usize, max_outputs: usize) -> Self {
        Self {
            inputs: Vec::with_capacity(max_inputs.min(64)),
            outputs: Vec::with_capacity(max_outputs.min(64)),
            ids: None,
            max_inputs,
            max_outputs,
        }
    }

    /// Mapped input registers.
    #[inline]
    #[must_use]
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Mapped output registers.
    #[inline]
    #[must_use]
    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Input register limit.
    #[inline]
    #[must_use]
    pub const fn max_inputs(&self) -> usize {
        self.max_inputs
    }

    /// Output register limit.
    #[inline]
    #[must_use]
    pub const fn max_outputs(&self) -> usize {
        self.max_outputs
    }

    /// Input register `register`.
    #[inline]
    #[must_use]
    pub fn input(&self, register: usize) -> Option<&[u32]> {
        self.inputs.get(register).copied()
    }

    /// Output register `register`.
    #[inline]
    pub fn output_mut(&mut self, register: usize) -> Option<&mut [u32]> {
        self.outputs.get_mut(register).map(|slice| &mut **slice)
    }

    /// Persistent IDs of the first mapped data set that has them.
    #[inline]
    pub fn ids_mut(&mut self) -> Option<&mut PersistentIds> {
        self.ids.as_deref_mut()
    }

    pub(crate) fn push_input(&mut self, column: &'a [u32]) {
        self.inputs.push(column);
    }

    pub(crate) fn push_output(&mut self, column: &'a mut [u32]) {
        self.outputs.push(column);
    }

    pub(crate) fn offer_ids(&mut self, ids: Option<&'a mut PersistentIds>) {
        if self.ids.is_none() {
            self.ids = ids;
        }
    }
}

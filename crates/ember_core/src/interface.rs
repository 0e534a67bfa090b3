//! # Data Interfaces
//!
//! External resources a program calls without the core knowing what they
//! are. A program names each function it calls; at bind time the owning
//! context asks the interface for a callable and stores it in a flat table.
//! Execution then calls by table index only.

use std::sync::Arc;

/// Identity of the system instance that owns an emitter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct InstanceId(pub u64);

/// One external call declared by a program.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FunctionSignature {
    /// Parameter-store name of the interface providing the function.
    pub interface: String,
    /// Function name within the interface.
    pub name: String,
    /// Input words per instance.
    pub num_inputs: usize,
    /// Output words per instance.
    pub num_outputs: usize,
}

impl FunctionSignature {
    /// Creates a signature.
    #[must_use]
    pub fn new(
        interface: impl Into<String>,
        name: impl Into<String>,
        num_inputs: usize,
        num_outputs: usize,
    ) -> Self {
        Self {
            interface: interface.into(),
            name: name.into(),
            num_inputs,
            num_outputs,
        }
    }
}

/// Resolved external function: reads `inputs` words, fills `outputs` words.
pub type ExternalFunction = Arc<dyn Fn(&[u32], &mut [u32]) + Send + Sync>;

/// A named resource exposing functions to programs.
pub trait DataInterface: Send + Sync {
    /// Human-readable type name for diagnostics.
    fn type_name(&self) -> &str;

    /// Returns a callable for `signature`, or `None` when unsupported.
    ///
    /// `owner` identifies the instance the function is bound for, so
    /// interfaces with per-instance state can capture it.
    fn bind_function(&self, signature: &FunctionSignature, owner: InstanceId) -> Option<ExternalFunction>;
}

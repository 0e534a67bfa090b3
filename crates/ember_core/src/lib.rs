//! # EMBER Core
//!
//! Data model shared by every simulation path:
//! - Columnar, typed attribute buffers (one column per component)
//! - Double-buffered data sets (`previous` is last frame's `current`)
//! - Parameter stores bound to shared upstream tables
//!
//! ## Architecture Rules
//!
//! 1. **Names resolve once** - attribute and parameter names become slot indices at bind time
//! 2. **Allocate before write** - no path writes past a buffer's capacity
//! 3. **One tick per frame** - a data set is promoted exactly once per frame
//!
//! ## Example
//!
//! ```rust,ignore
//! use ember_core::{Attribute, DataSet, DataSetLayout, SimTarget, ValueType};
//!
//! let layout = DataSetLayout::new(vec![Attribute::new("Position", ValueType::Vec3)]);
//! let mut data = DataSet::new("Particles", layout.into(), SimTarget::Cpu, false);
//! data.tick();
//! data.allocate(1024);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod attribute;
pub mod bounds;
pub mod buffer;
pub mod dataset;
pub mod error;
pub mod ids;
pub mod interface;
pub mod parameters;
pub mod registers;

pub use attribute::{Attribute, AttributeAccessor, DataSetLayout, ValueType};
pub use bounds::Bounds;
pub use buffer::AttributeBuffer;
pub use dataset::{DataSet, DataSetId, IndexBufferHandle, SharedDataSet, SimTarget};
pub use error::{DataSetError, DataSetResult, ParameterError, ParameterResult};
pub use ids::PersistentIds;
pub use interface::{DataInterface, ExternalFunction, FunctionSignature, InstanceId};
pub use parameters::{ParameterBinding, ParameterDecl, ParameterStore, SharedParameters};
pub use registers::RegisterTable;

/// Default upper bound on input registers a single execution may map.
pub const DEFAULT_MAX_INPUT_REGISTERS: usize = 100;

/// Default upper bound on output registers a single execution may map.
pub const DEFAULT_MAX_OUTPUT_REGISTERS: usize = 100;

/// Size in bytes of one register word.
pub const WORD_SIZE: usize = 4;

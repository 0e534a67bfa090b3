//! # EMBER GPU
//!
//! Batched compute dispatch for GPU-simulated emitters.
//!
//! ## Architecture Rules
//!
//! 1. **Queue, never execute** - emitters stage and queue a
//!    [`ComputeContext`]; only [`Batcher::dispatch`] runs it
//! 2. **Two queues, one owner each** - the producer fills one slot while
//!    the consumer drains the other
//! 3. **Never wait on the device** - instance counts come back through a
//!    polled readback; until then the host count overestimates
//! 4. **Release behind fences** - index buffers outlive their emitter until
//!    the device is done with them
//!
//! ## Example
//!
//! ```rust,ignore
//! use ember_gpu::{Batcher, BatcherConfig, ComputeContext, ComputeFrame, SoftwareDevice};
//!
//! let batcher = Batcher::new(Arc::new(SoftwareDevice::new(1)), BatcherConfig::default());
//! let context = Arc::new(ComputeContext::new(kernel, data_set, owner)?);
//!
//! // Producer timeline
//! context.tick()?;
//! context.stage(ComputeFrame { spawn_rate_instances: 4, ..ComputeFrame::default() });
//! batcher.queue(&context);
//!
//! // Consumer timeline
//! batcher.dispatch();
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod batcher;
pub mod context;
pub mod device;
pub mod error;
pub mod release;

pub use batcher::{
    Batcher, BatcherConfig, ComputeQueue, INTERP_SPAWN_START_PARAM, SPAWN_GROUP_PARAM,
    SPAWN_INTERVAL_PARAM,
};
pub use context::{ComputeContext, ComputeFrame};
pub use device::{
    DispatchGrid, Fence, GpuDevice, KernelDispatch, Readback, SoftwareDevice, COUNT_SLOT,
    EXECUTION_COUNT_PARAM, INDEX_BUFFER_SLOTS,
};
pub use error::{GpuError, GpuResult};
pub use release::DeferredReleaseQueue;

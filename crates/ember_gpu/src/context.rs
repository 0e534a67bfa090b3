//! # Compute Context
//!
//! One emitter's GPU simulation. The producer timeline binds and stages it
//! each frame; the batcher dispatches it later on the consumer timeline.
//!
//! ## Locking
//!
//! ```text
//! producer:  binding ──> (released) ──> frame
//! consumer:  frame ──> binding ──> (released) ──> resolve ──> data set
//! ```
//!
//! No two locks are held in opposite orders.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ember_core::{ExternalFunction, InstanceId, ParameterStore, SharedDataSet};
use ember_vm::{resolve_function_table, CompileStatus, Program, ScriptKind};
use parking_lot::Mutex;

use crate::device::{Fence, Readback};
use crate::error::{GpuError, GpuResult};

/// Spawn inputs staged for one dispatch.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ComputeFrame {
    /// Instances spawned by time-based spawning.
    pub spawn_rate_instances: usize,
    /// Instances spawned by events.
    pub event_spawn_total: usize,
    /// Seconds between spawns of the first spawn info.
    pub spawn_interval: f32,
    /// Offset of the first spawn within the frame.
    pub interp_spawn_start_dt: f32,
    /// Spawn group of the first spawn info.
    pub spawn_group: i32,
    /// Padded parameter snapshot; filled by [`ComputeContext::stage`].
    pub parameters: Vec<u8>,
}

impl ComputeFrame {
    /// Instances spawned this frame.
    #[inline]
    #[must_use]
    pub const fn spawned(&self) -> usize {
        self.spawn_rate_instances + self.event_spawn_total
    }
}

struct KernelBinding {
    parameters: ParameterStore,
    functions: Vec<ExternalFunction>,
}

/// Consumer-side readback bookkeeping.
pub(crate) struct ResolveState {
    pub(crate) accumulated_spawn_count: usize,
    pub(crate) readback: Option<Readback>,
    pub(crate) last_fence: Option<Fence>,
    /// Device constant block, laid out like the kernel's parameters.
    pub(crate) constants: ParameterStore,
    pub(crate) retired: bool,
}

/// A queued GPU simulation.
pub struct ComputeContext {
    kernel: Arc<Program>,
    data_set: SharedDataSet,
    owner: InstanceId,
    pending_execution: AtomicBool,
    binding: Mutex<KernelBinding>,
    frame: Mutex<ComputeFrame>,
    pub(crate) resolve: Mutex<ResolveState>,
}

impl std::fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeContext")
            .field("kernel", &self.kernel.name())
            .field("owner", &self.owner)
            .field("pending_execution", &self.is_pending())
            .finish_non_exhaustive()
    }
}

impl ComputeContext {
    /// Binds `kernel` to the data set it simulates.
    ///
    /// # Errors
    ///
    /// The program is not a compute kernel, is not compiled, or fails
    /// validation.
    pub fn new(kernel: Arc<Program>, data_set: SharedDataSet, owner: InstanceId) -> GpuResult<Self> {
        if kernel.kind() != ScriptKind::GpuCompute {
            return Err(GpuError::NotAKernel(kernel.name().to_string()));
        }
        if kernel.status() != CompileStatus::Compiled {
            return Err(GpuError::KernelUnavailable(kernel.name().to_string()));
        }
        kernel.validate()?;

        let layout = || {
            ParameterStore::from_layout(
                kernel.parameters(),
                kernel.data_interfaces(),
                kernel.interpolated_parameters(),
            )
        };
        let mut parameters = layout();
        parameters.mark_interfaces_dirty();
        let constants = layout();

        Ok(Self {
            data_set,
            owner,
            pending_execution: AtomicBool::new(false),
            binding: Mutex::new(KernelBinding {
                parameters,
                functions: Vec::new(),
            }),
            frame: Mutex::new(ComputeFrame::default()),
            resolve: Mutex::new(ResolveState {
                accumulated_spawn_count: 0,
                readback: None,
                last_fence: None,
                constants,
                retired: false,
            }),
            kernel,
        })
    }

    /// Bound kernel.
    #[inline]
    #[must_use]
    pub fn kernel(&self) -> &Arc<Program> {
        &self.kernel
    }

    /// Simulated data set.
    #[inline]
    #[must_use]
    pub fn data_set(&self) -> &SharedDataSet {
        &self.data_set
    }

    /// Owning instance.
    #[inline]
    #[must_use]
    pub const fn owner(&self) -> InstanceId {
        self.owner
    }

    /// True from queueing until the batcher drains this context.
    #[inline]
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.pending_execution.load(Ordering::Acquire)
    }

    /// Sets `pending_execution`, returning the previous value.
    #[inline]
    pub(crate) fn mark_pending(&self) -> bool {
        self.pending_execution.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn clear_pending(&self) {
        self.pending_execution.store(false, Ordering::Release);
    }

    /// Whether the context was retired from its batcher.
    #[must_use]
    pub fn is_retired(&self) -> bool {
        self.resolve.lock().retired
    }

    /// Runs `f` on the producer-side parameter store.
    pub fn with_parameters<R>(&self, f: impl FnOnce(&mut ParameterStore) -> R) -> R {
        f(&mut self.binding.lock().parameters)
    }

    /// Per-frame binding step: resolves functions when interfaces changed,
    /// then ticks the parameter store.
    ///
    /// # Errors
    ///
    /// Function resolution failed. Parameters are left untouched.
    pub fn tick(&self) -> GpuResult<()> {
        let mut binding = self.binding.lock();
        if binding.parameters.interfaces_dirty() {
            binding.functions = resolve_function_table(&self.kernel, &binding.parameters, self.owner)?;
            binding.parameters.clear_interfaces_dirty();
        }
        binding.parameters.tick();
        Ok(())
    }

    /// End-of-frame interpolation snapshot.
    pub fn post_tick(&self) {
        self.binding.lock().parameters.post_tick();
    }

    /// Stages this frame's spawn inputs with a padded parameter snapshot.
    pub fn stage(&self, mut frame: ComputeFrame) {
        frame.parameters = self.binding.lock().parameters.padded_current();
        *self.frame.lock() = frame;
    }

    /// Currently staged frame.
    #[must_use]
    pub fn staged(&self) -> ComputeFrame {
        self.frame.lock().clone()
    }

    /// Resolved external functions.
    pub(crate) fn functions(&self) -> Vec<ExternalFunction> {
        self.binding.lock().functions.clone()
    }

    /// Spawns added since the in-flight readback was issued.
    #[must_use]
    pub fn accumulated_spawn_count(&self) -> usize {
        self.resolve.lock().accumulated_spawn_count
    }

    /// Whether a count readback is in flight.
    #[must_use]
    pub fn readback_in_flight(&self) -> bool {
        self.resolve.lock().readback.is_some()
    }

    /// Fence of the most recent dispatch or readback.
    #[must_use]
    pub fn last_fence(&self) -> Option<Fence> {
        self.resolve.lock().last_fence
    }
}

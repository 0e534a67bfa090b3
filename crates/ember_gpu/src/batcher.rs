//! # Batcher
//!
//! Hands GPU simulation work from the producer timeline to the consumer
//! timeline.
//!
//! ## Double-Buffered Queue
//!
//! ```text
//!   producer (frame N)            consumer (frame N-1)
//!         │                              │
//!         ▼                              ▼
//!   queues[cur] ◄── queue()      dispatch(): cur ^= 1,
//!                                drain queues[old] ──► tick_single()
//! ```
//!
//! The producer only ever pushes into `queues[cur]`; `dispatch` flips `cur`
//! while holding the old slot's lock, then drains it. `queue` re-reads `cur`
//! once it holds a slot, so a push never lands in a slot already drained.
//!
//! ## Count Readback
//!
//! The true instance count lives in the data set's index buffer on the
//! device. The host assumes every spawned instance survives until a
//! readback proves otherwise, so its count never undercounts.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ember_core::{DataSet, IndexBufferHandle};
use parking_lot::Mutex;

use crate::context::{ComputeContext, ResolveState};
use crate::device::{DispatchGrid, GpuDevice, KernelDispatch, COUNT_SLOT, INDEX_BUFFER_SLOTS};
use crate::error::GpuResult;
use crate::release::DeferredReleaseQueue;

/// Seconds between spawns, filled from the staged frame.
pub const SPAWN_INTERVAL_PARAM: &str = "Emitter.SpawnInterval";
/// Offset of the first spawn within the frame.
pub const INTERP_SPAWN_START_PARAM: &str = "Emitter.InterpSpawnStartDt";
/// Spawn group of the staged spawn info.
pub const SPAWN_GROUP_PARAM: &str = "Emitter.SpawnGroup";

/// Thread group limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BatcherConfig {
    /// Threads per group.
    pub thread_group_size: usize,
    /// Maximum groups per dispatch.
    pub max_thread_groups: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            thread_group_size: 64,
            max_thread_groups: 65_535,
        }
    }
}

/// Producer-side view of a batcher.
///
/// Emitters hold an `Arc<dyn ComputeQueue>` so they do not carry the
/// device type.
pub trait ComputeQueue: Send + Sync {
    /// Queues `context` for the next dispatch; `false` if already queued.
    fn queue(&self, context: &Arc<ComputeContext>) -> bool;

    /// Withdraws `context` for good.
    fn retire(&self, context: &Arc<ComputeContext>);
}

impl<D: GpuDevice> ComputeQueue for Batcher<D> {
    fn queue(&self, context: &Arc<ComputeContext>) -> bool {
        Batcher::queue(self, context)
    }

    fn retire(&self, context: &Arc<ComputeContext>) {
        Batcher::retire(self, context);
    }
}

/// Collects queued compute contexts and dispatches them once per frame.
pub struct Batcher<D: GpuDevice> {
    device: Arc<D>,
    config: BatcherConfig,
    queues: [Mutex<Vec<Arc<ComputeContext>>>; 2],
    cur_queue_index: AtomicUsize,
    releases: Mutex<DeferredReleaseQueue<IndexBufferHandle>>,
}

impl<D: GpuDevice> Batcher<D> {
    /// Creates a batcher over `device`.
    #[must_use]
    pub fn new(device: Arc<D>, config: BatcherConfig) -> Self {
        Self {
            device,
            config,
            queues: [Mutex::new(Vec::new()), Mutex::new(Vec::new())],
            cur_queue_index: AtomicUsize::new(0),
            releases: Mutex::new(DeferredReleaseQueue::new()),
        }
    }

    /// Backing device.
    #[inline]
    #[must_use]
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    /// Thread group limits.
    #[inline]
    #[must_use]
    pub const fn config(&self) -> BatcherConfig {
        self.config
    }

    /// Index of the queue the producer fills.
    #[inline]
    #[must_use]
    pub fn cur_queue_index(&self) -> usize {
        self.cur_queue_index.load(Ordering::Acquire)
    }

    /// Contexts waiting in the producer queue.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queues[self.cur_queue_index()].lock().len()
    }

    /// Index buffers waiting on a fence before release.
    #[must_use]
    pub fn pending_releases(&self) -> usize {
        self.releases.lock().len()
    }

    /// Queues `context` for the next dispatch.
    ///
    /// Returns `false` if it was already queued and not yet drained.
    pub fn queue(&self, context: &Arc<ComputeContext>) -> bool {
        if context.is_retired() || context.mark_pending() {
            return false;
        }
        // `dispatch` flips the index while holding the old slot's lock;
        // re-check after locking so the push lands in the producer slot.
        loop {
            let index = self.cur_queue_index();
            let mut queue = self.queues[index].lock();
            if index == self.cur_queue_index() {
                queue.push(Arc::clone(context));
                return true;
            }
        }
    }

    /// Consumer step: flips the queues, then simulates every context of
    /// the queue the producer just finished.
    ///
    /// Returns the number of contexts dispatched.
    pub fn dispatch(&self) -> usize {
        let contexts = {
            let current = self.cur_queue_index();
            let mut queue = self.queues[current].lock();
            self.cur_queue_index.store(current ^ 1, Ordering::Release);
            std::mem::take(&mut *queue)
        };

        let mut dispatched = 0;
        for context in &contexts {
            match self.tick_single(context) {
                Ok(true) => dispatched += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::error!("GPU simulation of {:?} failed: {}", context.owner(), err);
                }
            }
            context.clear_pending();
        }

        self.device.end_frame();
        self.release_completed();
        dispatched
    }

    /// Simulates one context: tick, allocate, dispatch, resolve the count.
    ///
    /// Returns `false` for retired contexts.
    ///
    /// # Errors
    ///
    /// The device rejected the dispatch or readback. A rejected dispatch
    /// leaves the data set as it was before the call.
    pub fn tick_single(&self, context: &ComputeContext) -> GpuResult<bool> {
        let frame = context.staged();
        let functions = context.functions();

        let mut resolve = context.resolve.lock();
        if resolve.retired {
            return Ok(false);
        }
        let mut data_set = context.data_set().lock();

        let handle = match data_set.index_buffer() {
            Some(handle) => handle,
            None => {
                let handle = self.device.allocate_index_buffer();
                data_set.set_index_buffer(Some(handle));
                handle
            }
        };

        self.device.clear_index_slot(handle, COUNT_SLOT)?;

        data_set.tick();
        let spawned = frame.spawned();
        let update_count = data_set.prev_num_instances();
        let new_count = update_count + spawned;
        // One scratch slot past the end for redirected writes.
        data_set.allocate(new_count + 1);

        let constants = &mut resolve.constants;
        constants.load_current(&frame.parameters);
        constants.write_f32(constants.binding(SPAWN_INTERVAL_PARAM), frame.spawn_interval);
        constants.write_f32(constants.binding(INTERP_SPAWN_START_PARAM), frame.interp_spawn_start_dt);
        constants.write_i32(constants.binding(SPAWN_GROUP_PARAM), frame.spawn_group);

        let grid = DispatchGrid::for_instances(
            new_count,
            self.config.thread_group_size,
            self.config.max_thread_groups,
        );
        let dispatched = self.device.dispatch(KernelDispatch {
            kernel: context.kernel(),
            constants,
            functions: &functions,
            data_set: &mut data_set,
            index_buffer: handle,
            update_count,
            spawn_count: spawned,
            grid,
        });
        let fence = match dispatched {
            Ok(fence) => fence,
            Err(err) => {
                data_set.rewind_tick();
                return Err(err);
            }
        };
        resolve.last_fence = Some(fence);

        data_set.set_num_instances(new_count);
        self.resolve_dataset_writes(&mut resolve, &mut data_set, handle, spawned)?;
        Ok(true)
    }

    /// Folds a landed readback into the data set's count.
    ///
    /// Spawns accumulate until a readback lands; the count then becomes the
    /// device's survivors plus everything spawned since the copy was
    /// issued. A readback still in flight leaves the provisional count.
    fn resolve_dataset_writes(
        &self,
        state: &mut ResolveState,
        data_set: &mut DataSet,
        handle: IndexBufferHandle,
        spawned: usize,
    ) -> GpuResult<()> {
        state.accumulated_spawn_count += spawned;

        if let Some(readback) = &state.readback {
            let Some(words) = readback.try_take() else {
                return Ok(());
            };
            if let Some(survivors) = words.get(COUNT_SLOT) {
                let count = *survivors as usize + state.accumulated_spawn_count;
                tracing::debug!(
                    "{}: readback {} survivors, count {} -> {}",
                    data_set.name(),
                    survivors,
                    data_set.num_instances(),
                    count
                );
                data_set.set_num_instances(count);
            }
        }

        // The copy below already counts this frame's spawns.
        let readback = self.device.start_readback(handle, 0..INDEX_BUFFER_SLOTS)?;
        state.accumulated_spawn_count = 0;
        state.last_fence = Some(readback.fence());
        state.readback = Some(readback);
        Ok(())
    }

    /// Removes `context` from both queues and releases its index buffer
    /// once its last fence completes. In-flight results are discarded.
    pub fn retire(&self, context: &Arc<ComputeContext>) {
        for queue in &self.queues {
            queue.lock().retain(|queued| !Arc::ptr_eq(queued, context));
        }
        context.clear_pending();

        let last_fence = {
            let mut resolve = context.resolve.lock();
            resolve.retired = true;
            resolve.readback = None;
            resolve.accumulated_spawn_count = 0;
            resolve.last_fence
        };

        let Some(handle) = context.data_set().lock().index_buffer() else {
            return;
        };
        context.data_set().lock().set_index_buffer(None);

        match last_fence {
            Some(fence) if !self.device.is_fence_complete(fence) => {
                self.releases.lock().push(fence, handle);
            }
            _ => self.device.release_index_buffer(handle),
        }
    }

    fn release_completed(&self) {
        let released = self
            .releases
            .lock()
            .drain_completed(|fence| self.device.is_fence_complete(fence));
        for handle in released {
            self.device.release_index_buffer(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ComputeFrame;
    use crate::device::SoftwareDevice;
    use crate::error::GpuError;
    use ember_core::{Attribute, DataSetLayout, InstanceId, SharedDataSet, SimTarget, ValueType};
    use ember_vm::{Op, Operand, Program, ScriptKind};

    fn layout() -> Arc<DataSetLayout> {
        Arc::new(DataSetLayout::new(vec![Attribute::new("Index", ValueType::Int)]))
    }

    /// Writes each instance's execution index; never kills.
    fn index_kernel() -> Arc<Program> {
        Arc::new(
            Program::builder("kernel", ScriptKind::GpuCompute)
                .attributes(layout().attributes().to_vec())
                .temps(1)
                .ops([
                    Op::ExecIndex { dst: 0 },
                    Op::Output {
                        register: 0,
                        index: None,
                        value: Operand::Temp(0),
                    },
                ])
                .build(),
        )
    }

    fn context() -> Arc<ComputeContext> {
        let data_set: SharedDataSet =
            DataSet::new("particles", layout(), SimTarget::Gpu, false).into_shared();
        let context = ComputeContext::new(index_kernel(), data_set, InstanceId(7)).unwrap();
        context.tick().unwrap();
        Arc::new(context)
    }

    fn batcher(latency: u64, config: BatcherConfig) -> Batcher<SoftwareDevice> {
        Batcher::new(Arc::new(SoftwareDevice::new(latency)), config)
    }

    #[test]
    fn test_queue_twice_drains_once() {
        let batcher = batcher(1, BatcherConfig::default());
        let context = context();

        assert!(batcher.queue(&context));
        assert!(!batcher.queue(&context));
        assert!(context.is_pending());
        assert_eq!(batcher.queued(), 1);

        assert_eq!(batcher.dispatch(), 1);
        assert!(!context.is_pending());
        assert_eq!(batcher.device().dispatch_count(), 1);
        assert_eq!(batcher.dispatch(), 0);
    }

    #[test]
    fn test_dispatch_flips_queue_index() {
        let batcher = batcher(1, BatcherConfig::default());
        let before = batcher.cur_queue_index();
        batcher.queue(&context());
        batcher.dispatch();
        assert_eq!(batcher.cur_queue_index(), before ^ 1);
        assert_eq!(batcher.queued(), 0);
    }

    #[test]
    fn test_clamped_grid_covers_every_instance() {
        let batcher = batcher(
            0,
            BatcherConfig {
                thread_group_size: 4,
                max_thread_groups: 2,
            },
        );
        let context = context();
        context.stage(ComputeFrame {
            spawn_rate_instances: 50,
            ..ComputeFrame::default()
        });
        batcher.queue(&context);
        batcher.dispatch();

        let data_set = context.data_set().lock();
        assert_eq!(data_set.num_instances(), 50);
        let indices = data_set.current().int_column(0).unwrap();
        assert!(indices.iter().enumerate().all(|(i, v)| *v as usize == i));
        assert!(data_set.capacity() >= 51);
    }

    #[test]
    fn test_retire_defers_index_buffer_release() {
        let batcher = batcher(2, BatcherConfig::default());
        let context = context();
        context.stage(ComputeFrame {
            spawn_rate_instances: 3,
            ..ComputeFrame::default()
        });
        batcher.queue(&context);
        batcher.dispatch();
        assert_eq!(batcher.device().index_buffer_count(), 1);

        batcher.queue(&context);
        batcher.retire(&context);
        assert!(context.is_retired());
        assert!(!context.is_pending());
        assert_eq!(batcher.queued(), 0);
        assert_eq!(batcher.pending_releases(), 1);
        assert_eq!(batcher.device().index_buffer_count(), 1);

        batcher.dispatch();
        assert_eq!(batcher.pending_releases(), 0);
        assert_eq!(batcher.device().index_buffer_count(), 0);
        assert!(!batcher.queue(&context));
    }

    /// Seeds `count` live instances whose index column holds `100 + i`.
    fn seed(context: &ComputeContext, count: usize) {
        let mut data_set = context.data_set().lock();
        data_set.allocate(count);
        for i in 0..count {
            data_set.current_mut().write_i32(0, i, 100 + i as i32);
        }
        data_set.set_num_instances(count);
    }

    fn seeded_values(context: &ComputeContext) -> Vec<i32> {
        let data_set = context.data_set().lock();
        let count = data_set.num_instances();
        data_set.current().int_column(0).unwrap()[..count].to_vec()
    }

    #[test]
    fn test_unknown_index_buffer_keeps_population() {
        let batcher = batcher(1, BatcherConfig::default());
        let context = context();
        seed(&context, 10);
        context
            .data_set()
            .lock()
            .set_index_buffer(Some(IndexBufferHandle(999)));

        assert_eq!(
            batcher.tick_single(&context),
            Err(GpuError::UnknownIndexBuffer(IndexBufferHandle(999)))
        );
        assert_eq!(context.data_set().lock().num_instances(), 10);
        assert_eq!(seeded_values(&context), (100..110).collect::<Vec<_>>());

        // Failures through `dispatch` are logged and lose nothing either.
        batcher.queue(&context);
        assert_eq!(batcher.dispatch(), 0);
        assert_eq!(context.data_set().lock().num_instances(), 10);
    }

    #[test]
    fn test_rejected_kernel_keeps_population() {
        let batcher = batcher(1, BatcherConfig::default());
        // Writes a second register the data set does not map.
        let kernel = Arc::new(
            Program::builder("wide", ScriptKind::GpuCompute)
                .attributes(vec![
                    Attribute::new("Index", ValueType::Int),
                    Attribute::new("Extra", ValueType::Int),
                ])
                .ops([Op::Output {
                    register: 1,
                    index: None,
                    value: Operand::Int(1),
                }])
                .build(),
        );
        let data_set: SharedDataSet =
            DataSet::new("particles", layout(), SimTarget::Gpu, false).into_shared();
        let context = ComputeContext::new(kernel, data_set, InstanceId(8)).unwrap();
        context.tick().unwrap();
        seed(&context, 10);

        let err = batcher.tick_single(&context).unwrap_err();
        assert!(matches!(err, GpuError::RegisterOverflow { .. }), "{err:?}");
        assert_eq!(context.data_set().lock().num_instances(), 10);
        assert_eq!(seeded_values(&context), (100..110).collect::<Vec<_>>());
        assert_eq!(batcher.device().dispatch_count(), 0);
    }

    #[test]
    fn test_queue_after_dispatch_lands_in_new_slot() {
        let batcher = batcher(1, BatcherConfig::default());
        let first = context();
        let second = context();

        batcher.queue(&first);
        batcher.dispatch();
        assert!(batcher.queue(&second));

        let slot = batcher.cur_queue_index();
        assert_eq!(batcher.queues[slot].lock().len(), 1);
        assert!(batcher.queues[slot ^ 1].lock().is_empty());
        assert_eq!(batcher.dispatch(), 1);
        assert!(!second.is_pending());
    }
}

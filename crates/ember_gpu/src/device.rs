//! # Device Abstraction
//!
//! The two hardware operations the simulation needs, behind a trait:
//! dispatch a kernel over a data set, and copy index buffer words back to
//! the host asynchronously. Both return a [`Fence`] that the device reports
//! as complete some frames later.
//!
//! [`SoftwareDevice`] implements the trait on the host. It runs kernels
//! through the interpreter with the same grid-stride shape a compute
//! dispatch uses, and delivers readbacks over a channel after a fixed
//! frame latency.

use std::collections::{BTreeMap, HashMap};
use std::ops::Range;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use ember_core::{DataSet, ExternalFunction, IndexBufferHandle, ParameterStore, RegisterTable};
use ember_vm::{Interpreter, Program};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::error::{GpuError, GpuResult};

/// Words in an index buffer.
pub const INDEX_BUFFER_SLOTS: usize = 2;

/// Index buffer slot holding the post-simulation instance count.
pub const COUNT_SLOT: usize = 1;

/// Parameter the device fills with the number of carried-over instances.
pub const EXECUTION_COUNT_PARAM: &str = "Engine.ExecutionCount";

/// Completion token for submitted device work.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fence(pub u64);

/// Thread group layout of one dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchGrid {
    /// Threads per group.
    pub group_width: usize,
    /// Groups launched.
    pub group_count: usize,
}

impl DispatchGrid {
    /// Grid for `num_instances`, clamped to `max_groups` groups.
    ///
    /// Clamped grids stride: thread `t` handles `t`, `t + threads`, ...
    #[must_use]
    pub fn for_instances(num_instances: usize, group_width: usize, max_groups: usize) -> Self {
        let group_width = group_width.max(1);
        Self {
            group_width,
            group_count: num_instances.div_ceil(group_width).min(max_groups.max(1)),
        }
    }

    /// Threads launched.
    #[inline]
    #[must_use]
    pub const fn threads(&self) -> usize {
        self.group_width * self.group_count
    }

    /// Instance ranges covered by each stride of the grid, in order.
    pub fn strides(&self, num_instances: usize) -> impl Iterator<Item = Range<usize>> {
        let threads = self.threads().max(1);
        (0..num_instances.div_ceil(threads))
            .map(move |pass| pass * threads..((pass + 1) * threads).min(num_instances))
    }
}

/// Everything a kernel dispatch reads and writes.
pub struct KernelDispatch<'a> {
    /// Compiled kernel.
    pub kernel: &'a Program,
    /// Constant block uploaded with the dispatch.
    pub constants: &'a mut ParameterStore,
    /// Resolved external functions, in kernel declaration order.
    pub functions: &'a [ExternalFunction],
    /// Simulated data set, already ticked and allocated.
    pub data_set: &'a mut DataSet,
    /// Counter block of `data_set`.
    pub index_buffer: IndexBufferHandle,
    /// Host estimate of the instances carried over from last frame.
    pub update_count: usize,
    /// Instances spawned this frame.
    pub spawn_count: usize,
    /// Thread group layout.
    pub grid: DispatchGrid,
}

/// Asynchronous copy of index buffer words to the host.
#[derive(Debug)]
pub struct Readback {
    fence: Fence,
    receiver: Receiver<Vec<u32>>,
}

impl Readback {
    /// Wraps a receiver that yields the copied words once.
    #[must_use]
    pub fn new(fence: Fence, receiver: Receiver<Vec<u32>>) -> Self {
        Self { fence, receiver }
    }

    /// Fence signalled when the copy lands.
    #[inline]
    #[must_use]
    pub const fn fence(&self) -> Fence {
        self.fence
    }

    /// Takes the copied words if they have landed. Never blocks.
    ///
    /// A device that dropped the copy yields an empty block.
    pub fn try_take(&self) -> Option<Vec<u32>> {
        match self.receiver.try_recv() {
            Ok(words) => Some(words),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Vec::new()),
        }
    }
}

/// Hardware compute backend.
pub trait GpuDevice: Send + Sync {
    /// Allocates a zeroed index buffer.
    fn allocate_index_buffer(&self) -> IndexBufferHandle;

    /// Frees an index buffer. Unknown handles are ignored.
    fn release_index_buffer(&self, handle: IndexBufferHandle);

    /// Zeroes one index buffer slot.
    ///
    /// # Errors
    ///
    /// [`GpuError::UnknownIndexBuffer`].
    fn clear_index_slot(&self, handle: IndexBufferHandle, slot: usize) -> GpuResult<()>;

    /// Runs a kernel over `update_count + spawn_count` instances, writing the
    /// surviving count to [`COUNT_SLOT`] of the index buffer.
    ///
    /// # Errors
    ///
    /// Unknown index buffer, or the kernel cannot be mapped onto the data set.
    fn dispatch(&self, work: KernelDispatch<'_>) -> GpuResult<Fence>;

    /// Starts copying `slots` of an index buffer to the host.
    ///
    /// # Errors
    ///
    /// [`GpuError::UnknownIndexBuffer`].
    fn start_readback(&self, handle: IndexBufferHandle, slots: Range<usize>) -> GpuResult<Readback>;

    /// Whether the work behind `fence` has finished.
    fn is_fence_complete(&self, fence: Fence) -> bool;

    /// Submits the frame's work.
    fn end_frame(&self);
}

#[derive(Debug)]
struct IndexBuffer {
    slots: [u32; INDEX_BUFFER_SLOTS],
    /// Survivors of the last dispatch; the device-side live count.
    live: Option<usize>,
}

struct PendingCopy {
    ready_frame: u64,
    words: Vec<u32>,
    sender: Sender<Vec<u32>>,
}

struct DeviceState {
    frame: u64,
    next_fence: u64,
    next_buffer: u64,
    index_buffers: HashMap<IndexBufferHandle, IndexBuffer>,
    /// Fence id -> frame at which it completes.
    fences: BTreeMap<u64, u64>,
    copies: Vec<PendingCopy>,
    rng: ChaCha8Rng,
    dispatches: u64,
}

impl DeviceState {
    fn fence(&mut self, ready_frame: u64) -> Fence {
        let fence = Fence(self.next_fence);
        self.next_fence += 1;
        self.fences.insert(fence.0, ready_frame);
        fence
    }
}

/// Host implementation of [`GpuDevice`].
///
/// Dispatches complete at the end of the frame they were issued in.
/// Readbacks land `readback_latency_frames` frames after they start;
/// a latency of 0 lands immediately, though its fence still signals at
/// frame end.
pub struct SoftwareDevice {
    readback_latency_frames: u64,
    state: Mutex<DeviceState>,
}

impl SoftwareDevice {
    /// Creates a device with the given readback latency.
    #[must_use]
    pub fn new(readback_latency_frames: u64) -> Self {
        Self::with_seed(readback_latency_frames, 0)
    }

    /// Creates a device whose kernels draw random numbers from `seed`.
    #[must_use]
    pub fn with_seed(readback_latency_frames: u64, seed: u64) -> Self {
        Self {
            readback_latency_frames,
            state: Mutex::new(DeviceState {
                frame: 0,
                next_fence: 0,
                next_buffer: 1,
                index_buffers: HashMap::new(),
                fences: BTreeMap::new(),
                copies: Vec::new(),
                rng: ChaCha8Rng::seed_from_u64(seed),
                dispatches: 0,
            }),
        }
    }

    /// Readback latency in frames.
    #[inline]
    #[must_use]
    pub const fn readback_latency_frames(&self) -> u64 {
        self.readback_latency_frames
    }

    /// Frames submitted so far.
    #[must_use]
    pub fn frame(&self) -> u64 {
        self.state.lock().frame
    }

    /// Kernel dispatches issued so far.
    #[must_use]
    pub fn dispatch_count(&self) -> u64 {
        self.state.lock().dispatches
    }

    /// Live index buffers.
    #[must_use]
    pub fn index_buffer_count(&self) -> usize {
        self.state.lock().index_buffers.len()
    }

    /// Reads a slot directly, bypassing readback latency.
    #[must_use]
    pub fn index_slot(&self, handle: IndexBufferHandle, slot: usize) -> Option<u32> {
        self.state
            .lock()
            .index_buffers
            .get(&handle)
            .and_then(|buffer| buffer.slots.get(slot).copied())
    }
}

impl Default for SoftwareDevice {
    fn default() -> Self {
        Self::new(1)
    }
}

impl GpuDevice for SoftwareDevice {
    fn allocate_index_buffer(&self) -> IndexBufferHandle {
        let mut state = self.state.lock();
        let handle = IndexBufferHandle(state.next_buffer);
        state.next_buffer += 1;
        state.index_buffers.insert(
            handle,
            IndexBuffer {
                slots: [0; INDEX_BUFFER_SLOTS],
                live: None,
            },
        );
        handle
    }

    fn release_index_buffer(&self, handle: IndexBufferHandle) {
        self.state.lock().index_buffers.remove(&handle);
    }

    fn clear_index_slot(&self, handle: IndexBufferHandle, slot: usize) -> GpuResult<()> {
        let mut state = self.state.lock();
        let buffer = state
            .index_buffers
            .get_mut(&handle)
            .ok_or(GpuError::UnknownIndexBuffer(handle))?;
        if let Some(word) = buffer.slots.get_mut(slot) {
            *word = 0;
        }
        Ok(())
    }

    fn dispatch(&self, work: KernelDispatch<'_>) -> GpuResult<Fence> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let buffer = state
            .index_buffers
            .get_mut(&work.index_buffer)
            .ok_or(GpuError::UnknownIndexBuffer(work.index_buffer))?;

        // The host estimate never undercounts; the device knows the truth.
        let update_count = buffer
            .live
            .map_or(work.update_count, |live| live.min(work.update_count));
        let num_instances = update_count + work.spawn_count;
        let binding = work.constants.binding(EXECUTION_COUNT_PARAM);
        work.constants
            .write_i32(binding, i32::try_from(update_count).unwrap_or(i32::MAX));

        let kernel = work.kernel;
        let registers = work.data_set.layout().num_components();
        let written = {
            let mut table = RegisterTable::new(registers, registers);
            work.data_set
                .append_to_register_table(&mut table, 0)
                .map_err(|err| GpuError::RegisterOverflow {
                    kernel: kernel.name().to_string(),
                    reason: err.to_string(),
                })?;

            let mut interpreter = Interpreter::new(kernel);
            if !interpreter.fits(&table) {
                return Err(GpuError::RegisterOverflow {
                    kernel: kernel.name().to_string(),
                    reason: format!(
                        "reaches {} inputs / {} outputs, {} mapped",
                        kernel.input_registers(),
                        kernel.output_registers(),
                        registers
                    ),
                });
            }

            interpreter.begin(1);
            for stride in work.grid.strides(num_instances) {
                interpreter.run_range(&mut table, work.constants, work.functions, &mut state.rng, stride);
            }
            interpreter.written(num_instances).first().copied().unwrap_or(0)
        };

        buffer.slots[COUNT_SLOT] = u32::try_from(written).unwrap_or(u32::MAX);
        buffer.live = Some(written);
        state.dispatches += 1;

        let ready = state.frame + 1;
        Ok(state.fence(ready))
    }

    fn start_readback(&self, handle: IndexBufferHandle, slots: Range<usize>) -> GpuResult<Readback> {
        let mut state = self.state.lock();
        let buffer = state
            .index_buffers
            .get(&handle)
            .ok_or(GpuError::UnknownIndexBuffer(handle))?;
        let words: Vec<u32> = slots.filter_map(|slot| buffer.slots.get(slot).copied()).collect();

        let ready_frame = state.frame + self.readback_latency_frames;
        // Copies are ordered after the frame's dispatches.
        let at = ready_frame.max(state.frame + 1);
        let fence = state.fence(at);
        let (sender, receiver) = crossbeam_channel::bounded(1);
        if self.readback_latency_frames == 0 {
            if sender.send(words).is_err() {
                tracing::trace!("readback {:?} dropped before delivery", fence);
            }
        } else {
            state.copies.push(PendingCopy {
                ready_frame,
                words,
                sender,
            });
        }
        Ok(Readback::new(fence, receiver))
    }

    fn is_fence_complete(&self, fence: Fence) -> bool {
        let state = self.state.lock();
        match state.fences.get(&fence.0) {
            Some(ready_frame) => *ready_frame <= state.frame,
            None => fence.0 < state.next_fence,
        }
    }

    fn end_frame(&self) {
        let mut state = self.state.lock();
        state.frame += 1;
        let frame = state.frame;

        let (landed, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.copies)
            .into_iter()
            .partition(|copy| copy.ready_frame <= frame);
        state.copies = waiting;
        for copy in landed {
            if copy.sender.send(copy.words).is_err() {
                tracing::trace!("readback receiver gone at frame {}", frame);
            }
        }

        state.fences.retain(|_, ready_frame| *ready_frame > frame);
    }
}

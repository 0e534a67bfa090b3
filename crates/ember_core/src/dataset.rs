//! # Double-Buffered Data Set
//!
//! A data set owns two attribute buffers. Each frame `tick()` promotes
//! `current` to `previous` so scripts read last frame's state and write
//! this frame's without aliasing.
//!
//! ```text
//! Frame N:      read PREVIOUS (A)  ->  write CURRENT (B)
//! tick()        swap roles
//! Frame N+1:    read PREVIOUS (B)  ->  write CURRENT (A)
//! ```
//!
//! `tick()` must run once per frame, before the first write to `current`
//! and after every reader of the old `current` has finished. Calling it
//! twice in one frame discards the frame that was just written.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::attribute::DataSetLayout;
use crate::buffer::AttributeBuffer;
use crate::error::{DataSetError, DataSetResult};
use crate::ids::PersistentIds;
use crate::registers::RegisterTable;

/// Global counter for data set IDs.
static NEXT_DATA_SET_ID: AtomicU32 = AtomicU32::new(1);

/// Data set shared between emitters (event payloads) or timelines (GPU).
pub type SharedDataSet = Arc<Mutex<DataSet>>;

/// Where a data set is simulated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SimTarget {
    /// Interpreted on the host.
    Cpu,
    /// Dispatched to a compute device.
    Gpu,
}

/// Unique data set identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DataSetId(pub u32);

/// Device-side counter block owned by a GPU data set.
///
/// Slot 1 holds the surviving instance count written by the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IndexBufferHandle(pub u64);

/// Current/previous attribute buffers plus optional persistent IDs.
#[derive(Debug)]
pub struct DataSet {
    id: DataSetId,
    name: String,
    layout: Arc<DataSetLayout>,
    target: SimTarget,
    buffers: [AttributeBuffer; 2],
    /// Index of the current buffer in `buffers`.
    current: usize,
    ids: Option<PersistentIds>,
    index_buffer: Option<IndexBufferHandle>,
}

impl DataSet {
    /// Creates an empty data set.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        layout: Arc<DataSetLayout>,
        target: SimTarget,
        persistent_ids: bool,
    ) -> Self {
        let components = layout.num_components();
        Self {
            id: DataSetId(NEXT_DATA_SET_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            layout,
            target,
            buffers: [AttributeBuffer::new(components), AttributeBuffer::new(components)],
            current: 0,
            ids: persistent_ids.then(PersistentIds::new),
            index_buffer: None,
        }
    }

    /// Wraps the data set for sharing.
    #[must_use]
    pub fn into_shared(self) -> SharedDataSet {
        Arc::new(Mutex::new(self))
    }

    /// Unique ID.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> DataSetId {
        self.id
    }

    /// Debug name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Attribute layout.
    #[inline]
    #[must_use]
    pub fn layout(&self) -> &Arc<DataSetLayout> {
        &self.layout
    }

    /// Simulation target.
    #[inline]
    #[must_use]
    pub const fn sim_target(&self) -> SimTarget {
        self.target
    }

    /// Buffer being written this frame.
    #[inline]
    #[must_use]
    pub fn current(&self) -> &AttributeBuffer {
        &self.buffers[self.current]
    }

    /// Mutable buffer being written this frame.
    #[inline]
    pub fn current_mut(&mut self) -> &mut AttributeBuffer {
        &mut self.buffers[self.current]
    }

    /// Last frame's buffer.
    #[inline]
    #[must_use]
    pub fn previous(&self) -> &AttributeBuffer {
        &self.buffers[self.current ^ 1]
    }

    /// Live instances in `current`.
    #[inline]
    #[must_use]
    pub fn num_instances(&self) -> usize {
        self.current().num_instances()
    }

    /// Live instances in `previous`.
    #[inline]
    #[must_use]
    pub fn prev_num_instances(&self) -> usize {
        self.previous().num_instances()
    }

    /// Allocated instances in `current`.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.current().capacity()
    }

    /// Grows `current` to at least `num_instances` and, when enabled, the
    /// persistent ID table with it.
    pub fn allocate(&mut self, num_instances: usize) {
        self.current_mut().allocate(num_instances);
        if let Some(ids) = self.ids.as_mut() {
            ids.grow(num_instances);
        }
    }

    /// Sets the live count of `current`, clamped to its capacity.
    #[inline]
    pub fn set_num_instances(&mut self, num_instances: usize) {
        self.current_mut().set_num_instances(num_instances);
    }

    /// Promotes `current` to `previous`.
    ///
    /// Afterwards `previous` is exactly the buffer `current` was, and the
    /// new `current` holds no live instances.
    pub fn tick(&mut self) {
        self.current ^= 1;
        self.current_mut().reset();
        if let Some(ids) = self.ids.as_mut() {
            ids.tick();
        }
    }

    /// Copies the live contents of `current` over `previous`.
    ///
    /// Event handlers use this so the next script pass reads the effect of
    /// the previous one.
    pub fn copy_cur_to_prev(&mut self) {
        let (previous, current) = split_buffers(&mut self.buffers, self.current);
        previous.copy_from(current);
    }

    /// Undoes a [`tick`](Self::tick) whose frame never ran.
    ///
    /// The buffer that was `current` before the tick becomes `current`
    /// again with its contents and count. Last frame's ID table is not
    /// kept.
    pub fn rewind_tick(&mut self) {
        self.current ^= 1;
        if let Some(ids) = self.ids.as_mut() {
            ids.rewind();
        }
    }

    /// Clears both buffers and the persistent IDs.
    pub fn reset_buffers(&mut self) {
        for buffer in &mut self.buffers {
            buffer.reset();
        }
        if let Some(ids) = self.ids.as_mut() {
            ids.reset();
        }
    }

    /// Clears only `current`.
    pub fn reset_current_buffers(&mut self) {
        self.current_mut().reset();
    }

    /// Whether persistent IDs are tracked.
    #[inline]
    #[must_use]
    pub const fn has_persistent_ids(&self) -> bool {
        self.ids.is_some()
    }

    /// Persistent ID table, when enabled.
    #[inline]
    #[must_use]
    pub fn ids(&self) -> Option<&PersistentIds> {
        self.ids.as_ref()
    }

    /// Highest persistent ID in use this frame, -1 when none.
    #[must_use]
    pub fn max_used_id(&self) -> i32 {
        self.ids.as_ref().map_or(-1, PersistentIds::max_used_id)
    }

    /// Stamps IDs acquired from now on with `tag`.
    pub fn set_id_acquire_tag(&mut self, tag: i32) {
        if let Some(ids) = self.ids.as_mut() {
            ids.set_acquire_tag(tag);
        }
    }

    /// Device counter block, once the dispatcher has created one.
    #[inline]
    #[must_use]
    pub const fn index_buffer(&self) -> Option<IndexBufferHandle> {
        self.index_buffer
    }

    /// Attaches or detaches the device counter block.
    #[inline]
    pub fn set_index_buffer(&mut self, handle: Option<IndexBufferHandle>) {
        self.index_buffer = handle;
    }

    /// Bytes held by both buffers.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.buffers.iter().map(AttributeBuffer::size_bytes).sum()
    }

    /// Appends this data set's columns to `table`, offset by `start`.
    ///
    /// `previous` columns become inputs and `current` columns become
    /// outputs. Nothing is appended when either side would overflow.
    ///
    /// # Errors
    ///
    /// [`DataSetError::RegisterOverflow`] when the table cannot take every
    /// column of this layout.
    pub fn append_to_register_table<'a>(
        &'a mut self,
        table: &mut RegisterTable<'a>,
        start: usize,
    ) -> DataSetResult<()> {
        let registers = self.layout.num_components();
        let inputs = table.num_inputs() + registers;
        if inputs > table.max_inputs() {
            return Err(DataSetError::RegisterOverflow {
                kind: "input",
                required: inputs,
                max: table.max_inputs(),
            });
        }
        let outputs = table.num_outputs() + registers;
        if outputs > table.max_outputs() {
            return Err(DataSetError::RegisterOverflow {
                kind: "output",
                required: outputs,
                max: table.max_outputs(),
            });
        }

        let Self {
            buffers, current, ids, ..
        } = self;
        let (previous, current) = split_buffers(buffers, *current);

        for column in previous.columns() {
            table.push_input(&column[start.min(column.len())..]);
        }
        for column in current.columns_mut() {
            let from = start.min(column.len());
            table.push_output(&mut column[from..]);
        }
        table.offer_ids(ids.as_mut());
        Ok(())
    }

    /// Logs live instances `start..start + count` of `current`.
    pub fn dump(&self, start: usize, count: usize, label: &str) {
        let buffer = self.current();
        let end = (start + count).min(buffer.num_instances());
        tracing::debug!(
            "{} [{}] {} instances ({}..{})",
            label,
            self.name,
            buffer.num_instances(),
            start,
            end
        );
        for instance in start..end {
            let mut row = String::new();
            for (slot, attribute) in self.layout.attributes().iter().enumerate() {
                let Some(first) = self.layout.first_component(slot) else {
                    continue;
                };
                row.push_str(&attribute.name);
                row.push('=');
                for component in 0..attribute.value_type.components() {
                    if component > 0 {
                        row.push(',');
                    }
                    let value = if attribute.value_type.is_integer() {
                        buffer.read_i32(first + component, instance).map(|v| v.to_string())
                    } else {
                        buffer.read_f32(first + component, instance).map(|v| v.to_string())
                    };
                    row.push_str(value.as_deref().unwrap_or("?"));
                }
                row.push(' ');
            }
            tracing::debug!("  {}: {}", instance, row.trim_end());
        }
    }
}

/// Splits the pair into (`previous`, `current`).
fn split_buffers(
    buffers: &mut [AttributeBuffer; 2],
    current: usize,
) -> (&mut AttributeBuffer, &mut AttributeBuffer) {
    let (first, second) = buffers.split_at_mut(1);
    if current == 0 {
        (&mut second[0], &mut first[0])
    } else {
        (&mut first[0], &mut second[0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{Attribute, ValueType};

    fn layout() -> Arc<DataSetLayout> {
        Arc::new(DataSetLayout::new(vec![
            Attribute::new("Position", ValueType::Vec3),
            Attribute::new("Id", ValueType::Int),
        ]))
    }

    fn fill(data: &mut DataSet, count: usize, base: f32) {
        data.allocate(count);
        for i in 0..count {
            data.current_mut().write_f32(0, i, base + i as f32);
        }
        data.set_num_instances(count);
    }

    #[test]
    fn test_tick_promotes_current() {
        let mut data = DataSet::new("test", layout(), SimTarget::Cpu, false);
        fill(&mut data, 4, 10.0);
        let before = data.current().clone();

        data.tick();
        assert_eq!(data.previous(), &before);
        assert_eq!(data.num_instances(), 0);
        assert_eq!(data.prev_num_instances(), 4);
    }

    #[test]
    fn test_double_buffer_over_many_frames() {
        let mut data = DataSet::new("test", layout(), SimTarget::Cpu, false);
        let mut last: Option<AttributeBuffer> = None;
        for frame in 0..6 {
            data.tick();
            if let Some(expected) = &last {
                assert_eq!(data.previous(), expected);
            }
            fill(&mut data, frame + 1, frame as f32 * 100.0);
            last = Some(data.current().clone());
        }
    }

    #[test]
    fn test_copy_cur_to_prev() {
        let mut data = DataSet::new("test", layout(), SimTarget::Cpu, false);
        fill(&mut data, 5, 100.0);
        data.tick();
        fill(&mut data, 3, 1.0);
        data.copy_cur_to_prev();

        assert_eq!(data.prev_num_instances(), 3);
        assert_eq!(data.previous().read_f32(0, 0), Some(1.0));
        assert_eq!(data.previous().read_f32(0, 2), Some(3.0));
        // `current` is the source and stays as written.
        assert_eq!(data.num_instances(), 3);
        assert_eq!(data.current().read_f32(0, 1), Some(2.0));
    }

    #[test]
    fn test_rewind_tick_restores_current() {
        let mut data = DataSet::new("test", layout(), SimTarget::Cpu, true);
        fill(&mut data, 4, 10.0);
        data.ids.as_mut().unwrap().update(2, 1);
        let before = data.current().clone();

        data.tick();
        data.allocate(9);
        data.rewind_tick();

        assert_eq!(data.current(), &before);
        assert_eq!(data.num_instances(), 4);
        assert_eq!(data.ids().and_then(|ids| ids.index_of(2)), Some(1));
        assert_eq!(data.max_used_id(), 2);
    }

    #[test]
    fn test_allocate_grows_ids() {
        let mut data = DataSet::new("test", layout(), SimTarget::Cpu, true);
        assert_eq!(data.max_used_id(), -1);
        data.allocate(16);
        assert_eq!(data.ids().map(PersistentIds::len), Some(16));
        assert_eq!(data.ids().map(PersistentIds::free_count), Some(16));
    }

    #[test]
    fn test_register_table_append() {
        let mut data = DataSet::new("test", layout(), SimTarget::Cpu, false);
        fill(&mut data, 2, 0.0);
        data.tick();
        data.allocate(2);

        let mut table = RegisterTable::new(8, 8);
        data.append_to_register_table(&mut table, 1).unwrap();
        assert_eq!(table.num_inputs(), 4);
        assert_eq!(table.num_outputs(), 4);
        assert_eq!(table.input(0).map(|c| f32::from_bits(c[0])), Some(1.0));
    }

    #[test]
    fn test_register_table_overflow() {
        let mut data = DataSet::new("test", layout(), SimTarget::Cpu, false);
        data.allocate(1);
        let mut table = RegisterTable::new(3, 8);
        let err = data.append_to_register_table(&mut table, 0).unwrap_err();
        assert_eq!(
            err,
            DataSetError::RegisterOverflow {
                kind: "input",
                required: 4,
                max: 3
            }
        );
        assert_eq!(table.num_inputs(), 0);
    }

    #[test]
    fn test_reset_buffers() {
        let mut data = DataSet::new("test", layout(), SimTarget::Cpu, true);
        fill(&mut data, 5, 0.0);
        data.tick();
        fill(&mut data, 2, 0.0);
        data.reset_buffers();
        assert_eq!(data.num_instances(), 0);
        assert_eq!(data.prev_num_instances(), 0);
        assert_eq!(data.ids().map(PersistentIds::len), Some(0));
    }
}

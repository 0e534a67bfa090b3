//! # Attribute Buffer
//!
//! Columnar per-instance storage. Each component of each attribute is one
//! dense column of 32-bit words, so the interpreter can map a column
//! straight into a register without reshaping.
//!
//! Capacity only grows; `allocate` never hands back memory.

/// Typed, columnar block of per-instance values.
///
/// Invariant: `num_instances <= capacity` and every column is exactly
/// `capacity` words long.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AttributeBuffer {
    /// One column per component.
    columns: Vec<Vec<u32>>,
    /// Live instances.
    num_instances: usize,
    /// Allocated instances per column.
    capacity: usize,
}

impl AttributeBuffer {
    /// Creates an empty buffer with `num_components` columns.
    #[must_use]
    pub fn new(num_components: usize) -> Self {
        Self {
            columns: vec![Vec::new(); num_components],
            num_instances: 0,
            capacity: 0,
        }
    }

    /// Number of component columns.
    #[inline]
    #[must_use]
    pub fn num_components(&self) -> usize {
        self.columns.len()
    }

    /// Live instance count.
    #[inline]
    #[must_use]
    pub const fn num_instances(&self) -> usize {
        self.num_instances
    }

    /// Allocated instance count.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Grows every column to hold at least `capacity` instances.
    ///
    /// Existing values are kept. Smaller requests are ignored.
    pub fn allocate(&mut self, capacity: usize) {
        if capacity <= self.capacity {
            return;
        }
        for column in &mut self.columns {
            column.resize(capacity, 0);
        }
        self.capacity = capacity;
    }

    /// Sets the live count, clamped to capacity.
    pub fn set_num_instances(&mut self, num_instances: usize) {
        debug_assert!(
            num_instances <= self.capacity,
            "instance count {num_instances} exceeds capacity {}",
            self.capacity
        );
        self.num_instances = num_instances.min(self.capacity);
    }

    /// Drops every live instance. Capacity is kept.
    pub fn reset(&mut self) {
        self.num_instances = 0;
    }

    /// Full column (all `capacity` words).
    #[inline]
    #[must_use]
    pub fn column(&self, component: usize) -> Option<&[u32]> {
        self.columns.get(component).map(Vec::as_slice)
    }

    /// Mutable full column.
    #[inline]
    pub fn column_mut(&mut self, component: usize) -> Option<&mut [u32]> {
        self.columns.get_mut(component).map(Vec::as_mut_slice)
    }

    /// Live part of a float column.
    #[must_use]
    pub fn float_column(&self, component: usize) -> Option<&[f32]> {
        let column = self.columns.get(component)?;
        Some(bytemuck::cast_slice(&column[..self.num_instances]))
    }

    /// Live part of an integer column.
    #[must_use]
    pub fn int_column(&self, component: usize) -> Option<&[i32]> {
        let column = self.columns.get(component)?;
        Some(bytemuck::cast_slice(&column[..self.num_instances]))
    }

    /// Reads a float from a live instance.
    #[inline]
    #[must_use]
    pub fn read_f32(&self, component: usize, instance: usize) -> Option<f32> {
        self.read_word(component, instance).map(f32::from_bits)
    }

    /// Reads an integer from a live instance.
    #[inline]
    #[must_use]
    pub fn read_i32(&self, component: usize, instance: usize) -> Option<i32> {
        self.read_word(component, instance).map(|word| bytemuck::cast(word))
    }

    /// Writes a float into any allocated slot. Returns false when out of range.
    #[inline]
    pub fn write_f32(&mut self, component: usize, instance: usize, value: f32) -> bool {
        self.write_word(component, instance, value.to_bits())
    }

    /// Writes an integer into any allocated slot. Returns false when out of range.
    #[inline]
    pub fn write_i32(&mut self, component: usize, instance: usize, value: i32) -> bool {
        self.write_word(component, instance, bytemuck::cast(value))
    }

    /// Copies `other`'s live instances into this buffer.
    ///
    /// Both buffers must share a component count; extra columns on either
    /// side are left untouched.
    pub fn copy_from(&mut self, other: &Self) {
        let count = other.num_instances;
        self.allocate(count);
        for (dst, src) in self.columns.iter_mut().zip(&other.columns) {
            dst[..count].copy_from_slice(&src[..count]);
        }
        self.num_instances = count;
    }

    /// Bytes held by all columns.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.columns.len() * self.capacity * crate::WORD_SIZE
    }

    /// All columns, full capacity.
    #[inline]
    #[must_use]
    pub fn columns(&self) -> &[Vec<u32>] {
        &self.columns
    }

    /// All columns, mutable.
    #[inline]
    pub fn columns_mut(&mut self) -> &mut [Vec<u32>] {
        &mut self.columns
    }

    fn read_word(&self, component: usize, instance: usize) -> Option<u32> {
        if instance >= self.num_instances {
            return None;
        }
        self.columns.get(component)?.get(instance).copied()
    }

    fn write_word(&mut self, component: usize, instance: usize, word: u32) -> bool {
        match self.columns.get_mut(component).and_then(|c| c.get_mut(instance)) {
            Some(slot) => {
                *slot = word;
                true
            }
            None => false,
        }
    }
}

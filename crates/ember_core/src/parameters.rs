//! # Parameter Store
//!
//! Flat byte block of named values a program reads uniformly across all
//! instances, plus the data interfaces it calls into.
//!
//! ## Binding
//!
//! A store can bind to any number of shared upstream stores (system- or
//! world-level constants). Binding resolves matching names to byte ranges
//! once; every `tick()` then pulls those ranges in. One upstream store can
//! feed many contexts at once and counts its binders.
//!
//! ## Interpolation
//!
//! Programs that sub-step spawns read both this frame's and last frame's
//! values. For those stores `tick()` and `post_tick()` snapshot `current`
//! into `previous`; for every other store they leave `previous` alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::attribute::ValueType;
use crate::error::{ParameterError, ParameterResult};
use crate::interface::DataInterface;
use crate::WORD_SIZE;

/// Declared parameter of a program.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ParameterDecl {
    /// Parameter name, e.g. `Emitter.SpawnInterval`.
    pub name: String,
    /// Value type.
    pub value_type: ValueType,
}

impl ParameterDecl {
    /// Creates a declaration.
    #[must_use]
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
        }
    }
}

/// Pre-resolved location of one parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParameterBinding {
    /// Byte offset into the parameter block.
    pub offset: usize,
    /// Value type at that offset.
    pub value_type: ValueType,
}

struct SourceBinding {
    source: Arc<SharedParameters>,
    /// (source offset, destination offset, length) byte ranges.
    copies: Vec<(usize, usize, usize)>,
    /// (source slot, destination slot) interface pairs.
    interfaces: Vec<(usize, usize)>,
}

/// Named parameter block with current/previous snapshots.
#[derive(Default)]
pub struct ParameterStore {
    decls: Vec<ParameterDecl>,
    slots: HashMap<String, ParameterBinding>,
    current: Vec<u8>,
    previous: Vec<u8>,
    interface_names: Vec<String>,
    interfaces: Vec<Option<Arc<dyn DataInterface>>>,
    interpolated: bool,
    interfaces_dirty: bool,
    sources: Vec<SourceBinding>,
}

impl std::fmt::Debug for ParameterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParameterStore")
            .field("parameters", &self.decls)
            .field("interfaces", &self.interface_names)
            .field("interpolated", &self.interpolated)
            .field("interfaces_dirty", &self.interfaces_dirty)
            .field("sources", &self.sources.len())
            .finish_non_exhaustive()
    }
}

impl ParameterStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store laid out for a program.
    #[must_use]
    pub fn from_layout(parameters: &[ParameterDecl], interfaces: &[String], interpolated: bool) -> Self {
        let mut store = Self::new();
        for decl in parameters {
            store.add_parameter(decl.clone());
        }
        for name in interfaces {
            store.add_interface(name.clone());
        }
        store.interpolated = interpolated;
        store
    }

    /// Declares a parameter and returns its binding.
    ///
    /// Re-declaring a name returns the existing binding.
    pub fn add_parameter(&mut self, decl: ParameterDecl) -> ParameterBinding {
        if let Some(binding) = self.slots.get(&decl.name) {
            return *binding;
        }
        let binding = ParameterBinding {
            offset: self.current.len(),
            value_type: decl.value_type,
        };
        let size = decl.value_type.size_bytes();
        self.current.resize(binding.offset + size, 0);
        self.previous.resize(binding.offset + size, 0);
        self.slots.insert(decl.name.clone(), binding);
        self.decls.push(decl);
        binding
    }

    /// Declares a data interface slot and returns its index.
    pub fn add_interface(&mut self, name: impl Into<String>) -> usize {
        let name = name.into();
        if let Some(index) = self.interface_index(&name) {
            return index;
        }
        self.interface_names.push(name);
        self.interfaces.push(None);
        self.interfaces_dirty = true;
        self.interfaces.len() - 1
    }

    /// Declared parameters.
    #[inline]
    #[must_use]
    pub fn parameters(&self) -> &[ParameterDecl] {
        &self.decls
    }

    /// Declared interface names, in slot order.
    #[inline]
    #[must_use]
    pub fn interface_names(&self) -> &[String] {
        &self.interface_names
    }

    /// Resolves a parameter name once.
    #[inline]
    #[must_use]
    pub fn binding(&self, name: &str) -> Option<ParameterBinding> {
        self.slots.get(name).copied()
    }

    /// Whether `tick`/`post_tick` snapshot `current` into `previous`.
    #[inline]
    #[must_use]
    pub const fn is_interpolated(&self) -> bool {
        self.interpolated
    }

    /// Enables or disables interpolation snapshots.
    #[inline]
    pub fn set_interpolated(&mut self, interpolated: bool) {
        self.interpolated = interpolated;
    }

    /// This frame's parameter bytes.
    #[inline]
    #[must_use]
    pub fn current_bytes(&self) -> &[u8] {
        &self.current
    }

    /// Last frame's parameter bytes.
    #[inline]
    #[must_use]
    pub fn previous_bytes(&self) -> &[u8] {
        &self.previous
    }

    /// Copy of `current` padded to a 16-byte multiple for device upload.
    #[must_use]
    pub fn padded_current(&self) -> Vec<u8> {
        let mut bytes = self.current.clone();
        bytes.resize(self.current.len().next_multiple_of(16), 0);
        bytes
    }

    /// Overwrites `current` with an uploaded block, ignoring padding and
    /// bytes past the layout.
    pub fn load_current(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(self.current.len());
        self.current[..len].copy_from_slice(&bytes[..len]);
    }

    /// Reads the 32-bit word at `offset` of `current`; 0 when out of range.
    #[inline]
    #[must_use]
    pub fn read_word(&self, offset: usize) -> u32 {
        read_word(&self.current, offset)
    }

    /// Reads the 32-bit word at `offset` of `previous`; 0 when out of range.
    #[inline]
    #[must_use]
    pub fn read_previous_word(&self, offset: usize) -> u32 {
        read_word(&self.previous, offset)
    }

    /// Writes a float through a pre-resolved binding. `None` is a no-op.
    #[inline]
    pub fn write_f32(&mut self, binding: Option<ParameterBinding>, value: f32) {
        if let Some(binding) = binding {
            write_word(&mut self.current, binding.offset, value.to_bits());
        }
    }

    /// Writes an integer through a pre-resolved binding. `None` is a no-op.
    #[inline]
    pub fn write_i32(&mut self, binding: Option<ParameterBinding>, value: i32) {
        if let Some(binding) = binding {
            write_word(&mut self.current, binding.offset, bytemuck::cast(value));
        }
    }

    /// Sets a float parameter by name.
    ///
    /// # Errors
    ///
    /// Unknown name, or the parameter is not a float.
    pub fn set_f32(&mut self, name: &str, value: f32) -> ParameterResult<()> {
        let binding = self.typed_binding(name, ValueType::Float)?;
        write_word(&mut self.current, binding.offset, value.to_bits());
        Ok(())
    }

    /// Sets an integer parameter by name.
    ///
    /// # Errors
    ///
    /// Unknown name, or the parameter is not an integer.
    pub fn set_i32(&mut self, name: &str, value: i32) -> ParameterResult<()> {
        let binding = self.typed_binding(name, ValueType::Int)?;
        write_word(&mut self.current, binding.offset, bytemuck::cast(value));
        Ok(())
    }

    /// Sets a three-component float parameter by name.
    ///
    /// # Errors
    ///
    /// Unknown name, or the parameter is not a `Vec3`.
    pub fn set_vec3(&mut self, name: &str, value: [f32; 3]) -> ParameterResult<()> {
        let binding = self.typed_binding(name, ValueType::Vec3)?;
        for (i, component) in value.iter().enumerate() {
            write_word(&mut self.current, binding.offset + i * WORD_SIZE, component.to_bits());
        }
        Ok(())
    }

    /// Reads a float parameter by name.
    ///
    /// # Errors
    ///
    /// Unknown name, or the parameter is not a float.
    pub fn get_f32(&self, name: &str) -> ParameterResult<f32> {
        let binding = self.typed_binding(name, ValueType::Float)?;
        Ok(f32::from_bits(self.read_word(binding.offset)))
    }

    /// Reads an integer parameter by name.
    ///
    /// # Errors
    ///
    /// Unknown name, or the parameter is not an integer.
    pub fn get_i32(&self, name: &str) -> ParameterResult<i32> {
        let binding = self.typed_binding(name, ValueType::Int)?;
        Ok(bytemuck::cast(self.read_word(binding.offset)))
    }

    /// Reads last frame's float parameter by name.
    ///
    /// # Errors
    ///
    /// Unknown name, or the parameter is not a float.
    pub fn get_previous_f32(&self, name: &str) -> ParameterResult<f32> {
        let binding = self.typed_binding(name, ValueType::Float)?;
        Ok(f32::from_bits(self.read_previous_word(binding.offset)))
    }

    /// Sets the interface in slot `name`.
    ///
    /// Replacing it with a different object marks interfaces dirty.
    ///
    /// # Errors
    ///
    /// [`ParameterError::UnknownInterface`] when no slot has that name.
    pub fn set_interface(&mut self, name: &str, interface: Arc<dyn DataInterface>) -> ParameterResult<()> {
        let index = self
            .interface_index(name)
            .ok_or_else(|| ParameterError::UnknownInterface(name.to_string()))?;
        if !same_interface(self.interfaces[index].as_ref(), Some(&interface)) {
            self.interfaces[index] = Some(interface);
            self.interfaces_dirty = true;
        }
        Ok(())
    }

    /// Interface currently bound to slot `name`.
    #[must_use]
    pub fn interface(&self, name: &str) -> Option<&Arc<dyn DataInterface>> {
        let index = self.interface_index(name)?;
        self.interfaces[index].as_ref()
    }

    /// Flags that some interface changed identity.
    #[inline]
    pub fn mark_interfaces_dirty(&mut self) {
        self.interfaces_dirty = true;
    }

    /// Whether the function table must be rebuilt.
    #[inline]
    #[must_use]
    pub const fn interfaces_dirty(&self) -> bool {
        self.interfaces_dirty
    }

    /// Called once the function table has been rebuilt.
    #[inline]
    pub fn clear_interfaces_dirty(&mut self) {
        self.interfaces_dirty = false;
    }

    /// Binds to a shared upstream store.
    ///
    /// Parameters and interfaces with matching names (and types) are copied
    /// from `source` on every `tick()`, starting now. Binding the same
    /// source twice is a no-op.
    pub fn bind(&mut self, source: &Arc<SharedParameters>) {
        if self.sources.iter().any(|b| Arc::ptr_eq(&b.source, source)) {
            return;
        }

        let binding = {
            let upstream = source.read();
            let copies = upstream
                .slots
                .iter()
                .filter_map(|(name, src)| {
                    let dst = self.slots.get(name)?;
                    (dst.value_type == src.value_type)
                        .then_some((src.offset, dst.offset, src.value_type.size_bytes()))
                })
                .collect();
            let interfaces = upstream
                .interface_names
                .iter()
                .enumerate()
                .filter_map(|(src, name)| Some((src, self.interface_index(name)?)))
                .collect();
            SourceBinding {
                source: Arc::clone(source),
                copies,
                interfaces,
            }
        };

        source.binders.fetch_add(1, Ordering::AcqRel);
        self.sources.push(binding);
        self.pull_from_sources();
    }

    /// Drops every upstream binding.
    pub fn unbind_from_source_stores(&mut self) {
        for binding in self.sources.drain(..) {
            binding.source.binders.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Number of bound upstream stores.
    #[inline]
    #[must_use]
    pub fn num_sources(&self) -> usize {
        self.sources.len()
    }

    /// Start-of-frame update: interpolation snapshot, then upstream pull.
    pub fn tick(&mut self) {
        if self.interpolated {
            self.copy_current_to_previous();
        }
        self.pull_from_sources();
    }

    /// End-of-frame interpolation snapshot.
    pub fn post_tick(&mut self) {
        if self.interpolated {
            self.copy_current_to_previous();
        }
    }

    /// Unconditionally copies `current` into `previous`.
    pub fn copy_current_to_previous(&mut self) {
        self.previous.clone_from(&self.current);
    }

    fn pull_from_sources(&mut self) {
        let Self {
            sources,
            current,
            interfaces,
            interfaces_dirty,
            ..
        } = self;

        for binding in sources.iter() {
            let upstream = binding.source.read();
            for &(src, dst, len) in &binding.copies {
                if let (Some(from), Some(to)) =
                    (upstream.current.get(src..src + len), current.get_mut(dst..dst + len))
                {
                    to.copy_from_slice(from);
                }
            }
            for &(src, dst) in &binding.interfaces {
                let incoming = upstream.interfaces.get(src).and_then(Option::as_ref);
                if !same_interface(interfaces[dst].as_ref(), incoming) {
                    interfaces[dst] = incoming.cloned();
                    *interfaces_dirty = true;
                }
            }
        }
    }

    fn interface_index(&self, name: &str) -> Option<usize> {
        self.interface_names.iter().position(|n| n == name)
    }

    fn typed_binding(&self, name: &str, expected: ValueType) -> ParameterResult<ParameterBinding> {
        let binding = self
            .binding(name)
            .ok_or_else(|| ParameterError::UnknownParameter(name.to_string()))?;
        let compatible = binding.value_type == expected
            || (expected == ValueType::Int && binding.value_type == ValueType::Bool);
        if !compatible {
            return Err(ParameterError::TypeMismatch {
                name: name.to_string(),
                expected,
                found: binding.value_type,
            });
        }
        Ok(binding)
    }
}

impl Drop for ParameterStore {
    fn drop(&mut self) {
        self.unbind_from_source_stores();
    }
}

/// Upstream parameter store shared by many contexts.
pub struct SharedParameters {
    store: RwLock<ParameterStore>,
    binders: AtomicUsize,
}

impl SharedParameters {
    /// Wraps `store` for sharing.
    #[must_use]
    pub fn new(store: ParameterStore) -> Arc<Self> {
        Arc::new(Self {
            store: RwLock::new(store),
            binders: AtomicUsize::new(0),
        })
    }

    /// Read access.
    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, ParameterStore> {
        self.store.read()
    }

    /// Write access.
    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, ParameterStore> {
        self.store.write()
    }

    /// Number of stores currently bound to this one.
    #[inline]
    #[must_use]
    pub fn binder_count(&self) -> usize {
        self.binders.load(Ordering::Acquire)
    }
}

fn read_word(bytes: &[u8], offset: usize) -> u32 {
    bytes
        .get(offset..offset + WORD_SIZE)
        .map_or(0, bytemuck::pod_read_unaligned::<u32>)
}

fn write_word(bytes: &mut [u8], offset: usize, word: u32) {
    if let Some(slot) = bytes.get_mut(offset..offset + WORD_SIZE) {
        slot.copy_from_slice(bytemuck::bytes_of(&word));
    }
}

fn same_interface(a: Option<&Arc<dyn DataInterface>>, b: Option<&Arc<dyn DataInterface>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => Arc::as_ptr(a).cast::<()>() == Arc::as_ptr(b).cast::<()>(),
        (None, None) => true,
        _ => false,
    }
}

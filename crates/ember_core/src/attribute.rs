//! # Attribute Layout
//!
//! Typed attribute declarations and the name-to-slot table a data set
//! builds once at creation. All per-instance access after that goes
//! through component indices.

use std::collections::HashMap;

use crate::buffer::AttributeBuffer;

/// Value type of an attribute or parameter.
///
/// Every component is one 32-bit word. Booleans are stored as integers
/// (`0` false, anything else true).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// Single float.
    Float,
    /// Two floats.
    Vec2,
    /// Three floats.
    Vec3,
    /// Four floats.
    Vec4,
    /// Signed 32-bit integer.
    Int,
    /// Boolean stored as an integer.
    Bool,
}

impl ValueType {
    /// Number of 32-bit components.
    #[inline]
    #[must_use]
    pub const fn components(self) -> usize {
        match self {
            Self::Float | Self::Int | Self::Bool => 1,
            Self::Vec2 => 2,
            Self::Vec3 => 3,
            Self::Vec4 => 4,
        }
    }

    /// Whether the components hold integers rather than floats.
    #[inline]
    #[must_use]
    pub const fn is_integer(self) -> bool {
        matches!(self, Self::Int | Self::Bool)
    }

    /// Size in bytes.
    #[inline]
    #[must_use]
    pub const fn size_bytes(self) -> usize {
        self.components() * crate::WORD_SIZE
    }
}

/// A named, typed per-instance attribute.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Attribute {
    /// Attribute name, e.g. `Position`.
    pub name: String,
    /// Value type.
    pub value_type: ValueType,
}

impl Attribute {
    /// Creates an attribute declaration.
    #[must_use]
    pub fn new(name: impl Into<String>, value_type: ValueType) -> Self {
        Self {
            name: name.into(),
            value_type,
        }
    }
}

/// Ordered attribute list plus the resolved name table.
///
/// Components are laid out attribute by attribute in declaration order,
/// so attribute `k` occupies columns
/// `first_component(k)..first_component(k) + components`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataSetLayout {
    attributes: Vec<Attribute>,
    first_component: Vec<usize>,
    index: HashMap<String, usize>,
    num_components: usize,
}

impl DataSetLayout {
    /// Builds a layout. Later duplicates of a name are ignored.
    #[must_use]
    pub fn new(attributes: Vec<Attribute>) -> Self {
        let mut kept = Vec::with_capacity(attributes.len());
        let mut first_component = Vec::with_capacity(attributes.len());
        let mut index = HashMap::with_capacity(attributes.len());
        let mut num_components = 0;

        for attribute in attributes {
            if index.contains_key(&attribute.name) {
                continue;
            }
            index.insert(attribute.name.clone(), kept.len());
            first_component.push(num_components);
            num_components += attribute.value_type.components();
            kept.push(attribute);
        }

        Self {
            attributes: kept,
            first_component,
            index,
            num_components,
        }
    }

    /// Attributes in declaration order.
    #[inline]
    #[must_use]
    pub fn attributes(&self) -> &[Attribute] {
        &self.attributes
    }

    /// Number of attributes.
    #[inline]
    #[must_use]
    pub fn num_attributes(&self) -> usize {
        self.attributes.len()
    }

    /// Total number of component columns.
    #[inline]
    #[must_use]
    pub const fn num_components(&self) -> usize {
        self.num_components
    }

    /// Slot index of a named attribute.
    #[inline]
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Whether the layout declares `name`.
    #[inline]
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// First component column of the attribute at `slot`.
    #[must_use]
    pub fn first_component(&self, slot: usize) -> Option<usize> {
        self.first_component.get(slot).copied()
    }

    /// Resolves an accessor for `name`, requiring the given type.
    #[must_use]
    pub fn accessor(&self, name: &str, value_type: ValueType) -> Option<AttributeAccessor> {
        let slot = self.index_of(name)?;
        let attribute = &self.attributes[slot];
        if attribute.value_type != value_type {
            return None;
        }
        Some(AttributeAccessor {
            first_component: self.first_component[slot],
            value_type,
        })
    }
}

/// Pre-resolved typed view of one attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttributeAccessor {
    /// First component column.
    pub first_component: usize,
    /// Attribute type.
    pub value_type: ValueType,
}

impl AttributeAccessor {
    /// Reads component `component` of `instance` as a float.
    #[inline]
    #[must_use]
    pub fn read_f32(&self, buffer: &AttributeBuffer, component: usize, instance: usize) -> Option<f32> {
        if component >= self.value_type.components() {
            return None;
        }
        buffer.read_f32(self.first_component + component, instance)
    }

    /// Reads the attribute as an integer.
    #[inline]
    #[must_use]
    pub fn read_i32(&self, buffer: &AttributeBuffer, instance: usize) -> Option<i32> {
        buffer.read_i32(self.first_component, instance)
    }

    /// Reads up to three float components; missing components are zero.
    #[must_use]
    pub fn read_vec3(&self, buffer: &AttributeBuffer, instance: usize) -> Option<[f32; 3]> {
        let mut out = [0.0; 3];
        let count = self.value_type.components().min(3);
        for (component, slot) in out.iter_mut().enumerate().take(count) {
            *slot = self.read_f32(buffer, component, instance)?;
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_layout() -> DataSetLayout {
        DataSetLayout::new(vec![
            Attribute::new("Position", ValueType::Vec3),
            Attribute::new("Age", ValueType::Float),
            Attribute::new("Alive", ValueType::Bool),
        ])
    }

    #[test]
    fn test_component_offsets() {
        let layout = sample_layout();
        assert_eq!(layout.num_components(), 5);
        assert_eq!(layout.first_component(0), Some(0));
        assert_eq!(layout.first_component(1), Some(3));
        assert_eq!(layout.first_component(2), Some(4));
    }

    #[test]
    fn test_duplicate_names_ignored() {
        let layout = DataSetLayout::new(vec![
            Attribute::new("Age", ValueType::Float),
            Attribute::new("Age", ValueType::Vec4),
        ]);
        assert_eq!(layout.num_attributes(), 1);
        assert_eq!(layout.num_components(), 1);
    }

    #[test]
    fn test_accessor_type_checked() {
        let layout = sample_layout();
        assert!(layout.accessor("Position", ValueType::Vec3).is_some());
        assert!(layout.accessor("Position", ValueType::Float).is_none());
        assert!(layout.accessor("Missing", ValueType::Float).is_none());
    }
}

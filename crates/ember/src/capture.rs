//! Debug capture of script outputs.

use ember_core::{DataSet, ParameterStore};

/// Which script produced a capture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ScriptUsage {
    /// Spawn program, every batch of the frame.
    Spawn,
    /// Update program.
    Update,
    /// Event handler at this index.
    Event(usize),
}

/// Snapshot of one script run: the instances it wrote and the parameters
/// it saw.
#[derive(Clone, Debug, PartialEq)]
pub struct ScriptCapture {
    /// Producing script.
    pub usage: ScriptUsage,
    /// Emitter tick count at capture time.
    pub tick: u64,
    /// First captured instance.
    pub start_instance: usize,
    /// Captured instance count.
    pub num_instances: usize,
    /// One column per component, `num_instances` words each.
    pub columns: Vec<Vec<u32>>,
    /// Parameter block as executed.
    pub parameters: Vec<u8>,
}

impl ScriptCapture {
    /// Copies `start..start + count` of `data`'s current buffer, clamped to
    /// the live range.
    #[must_use]
    pub fn record(
        usage: ScriptUsage,
        tick: u64,
        data: &DataSet,
        start: usize,
        count: usize,
        parameters: &ParameterStore,
    ) -> Self {
        let buffer = data.current();
        let start = start.min(buffer.num_instances());
        let end = (start + count).min(buffer.num_instances());
        let columns = buffer
            .columns()
            .iter()
            .map(|column| column.get(start..end).map_or_else(Vec::new, <[u32]>::to_vec))
            .collect();
        Self {
            usage,
            tick,
            start_instance: start,
            num_instances: end - start,
            columns,
            parameters: parameters.current_bytes().to_vec(),
        }
    }

    /// Float value of `component` for captured instance `instance`.
    #[must_use]
    pub fn read_f32(&self, component: usize, instance: usize) -> Option<f32> {
        self.columns
            .get(component)?
            .get(instance)
            .map(|word| f32::from_bits(*word))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{Attribute, DataSetLayout, SimTarget, ValueType};
    use std::sync::Arc;

    #[test]
    fn test_record_clamps_to_live_range() {
        let layout = Arc::new(DataSetLayout::new(vec![Attribute::new("Age", ValueType::Float)]));
        let mut data = DataSet::new("test", layout, SimTarget::Cpu, false);
        data.allocate(4);
        for i in 0..3 {
            data.current_mut().write_f32(0, i, i as f32);
        }
        data.set_num_instances(3);

        let capture = ScriptCapture::record(ScriptUsage::Update, 7, &data, 1, 10, &ParameterStore::new());
        assert_eq!(capture.start_instance, 1);
        assert_eq!(capture.num_instances, 2);
        assert_eq!(capture.read_f32(0, 1), Some(2.0));
        assert_eq!(capture.read_f32(0, 2), None);
    }
}

//! # Event Registry
//!
//! Event data sets are written by one emitter and read by others. The
//! registry maps `(emitter, event)` to the shared data set so readers can
//! find a generator by name.
//!
//! Producers tick before consumers within a frame. A consumer reads the
//! producer's `previous` buffer: last frame's events.

use std::collections::HashMap;
use std::sync::Arc;

use ember_core::{DataSet, DataSetLayout, SharedDataSet, SimTarget};
use parking_lot::RwLock;

/// Key of an event data set: generating emitter and event name.
pub type EventKey = (String, String);

/// Shared lookup of event data sets.
#[derive(Default)]
pub struct EventRegistry {
    sets: RwLock<HashMap<EventKey, SharedDataSet>>,
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("sets", &self.sets.read().len())
            .finish()
    }
}

impl EventRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the data set for `(emitter, event)`, creating it with
    /// `layout` on first use.
    ///
    /// An existing set is returned as is, whatever its layout.
    pub fn create(&self, emitter: &str, event: &str, layout: &Arc<DataSetLayout>) -> SharedDataSet {
        let key = (emitter.to_string(), event.to_string());
        if let Some(set) = self.sets.read().get(&key) {
            return Arc::clone(set);
        }
        let mut sets = self.sets.write();
        Arc::clone(sets.entry(key).or_insert_with(|| {
            DataSet::new(format!("{emitter}.{event}"), Arc::clone(layout), SimTarget::Cpu, false)
                .into_shared()
        }))
    }

    /// Looks up an existing event data set.
    #[must_use]
    pub fn get(&self, emitter: &str, event: &str) -> Option<SharedDataSet> {
        self.sets
            .read()
            .get(&(emitter.to_string(), event.to_string()))
            .cloned()
    }

    /// Drops every set generated by `emitter`. Readers holding a handle
    /// keep theirs alive.
    pub fn remove_emitter(&self, emitter: &str) -> usize {
        let mut sets = self.sets.write();
        let before = sets.len();
        sets.retain(|(owner, _), _| owner != emitter);
        before - sets.len()
    }

    /// Number of registered sets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sets.read().len()
    }

    /// Whether no set is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sets.read().is_empty()
    }
}

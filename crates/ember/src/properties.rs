//! # Emitter Properties
//!
//! Immutable description of an emitter: its programs, where it simulates,
//! which events it generates and which it handles. Instances share one
//! `Arc<EmitterProperties>`.

use std::sync::Arc;

use ember_core::{Bounds, DataSetLayout, SimTarget};
use ember_vm::{EventExecutionMode, Program};

use crate::spawn::SpawnRate;

/// Bounds GPU emitters report when none are configured.
pub const DEFAULT_FIXED_BOUNDS: Bounds = Bounds::new([-100.0; 3], [100.0; 3]);

/// An event data set written by the spawn or update program.
#[derive(Clone, Debug)]
pub struct EventGeneratorProps {
    /// Event name; the registry key is `(emitter name, event name)`.
    pub name: String,
    /// Payload layout.
    pub layout: Arc<DataSetLayout>,
}

impl EventGeneratorProps {
    /// Generator for `name` with payload `layout`.
    #[must_use]
    pub fn new(name: impl Into<String>, layout: Arc<DataSetLayout>) -> Self {
        Self {
            name: name.into(),
            layout,
        }
    }
}

/// A handler reacting to another emitter's events.
#[derive(Clone, Debug)]
pub struct EventHandlerProps {
    /// Handler program.
    pub script: Option<Arc<Program>>,
    /// How the program is run against events.
    pub mode: EventExecutionMode,
    /// Emitter generating the events.
    pub source_emitter: String,
    /// Event name on the source emitter.
    pub source_event: String,
    /// Events handled per frame. `None` takes the engine default, `Some(0)`
    /// handles every event.
    pub max_events_per_frame: Option<usize>,
    /// Instances spawned per event in [`EventExecutionMode::SpawnedParticles`].
    pub spawn_number: u32,
    /// Lower bound of the random spawn count.
    pub min_spawn_number: u32,
    /// Draw the spawn count from `[min_spawn_number, spawn_number]`.
    pub random_spawn_number: bool,
}

impl EventHandlerProps {
    /// Handler running `script` in `mode` against `source_emitter.source_event`.
    #[must_use]
    pub fn new(
        script: Arc<Program>,
        mode: EventExecutionMode,
        source_emitter: impl Into<String>,
        source_event: impl Into<String>,
    ) -> Self {
        Self {
            script: Some(script),
            mode,
            source_emitter: source_emitter.into(),
            source_event: source_event.into(),
            max_events_per_frame: None,
            spawn_number: 0,
            min_spawn_number: 0,
            random_spawn_number: false,
        }
    }

    /// Spawns `count` instances per event.
    #[must_use]
    pub const fn with_spawn_number(mut self, count: u32) -> Self {
        self.spawn_number = count;
        self
    }

    /// Spawns a random count in `[min, max]` per event.
    #[must_use]
    pub const fn with_random_spawn_number(mut self, min: u32, max: u32) -> Self {
        self.min_spawn_number = min;
        self.spawn_number = max;
        self.random_spawn_number = true;
        self
    }

    /// Caps events handled per frame; 0 is unlimited.
    #[must_use]
    pub const fn with_max_events_per_frame(mut self, max: usize) -> Self {
        self.max_events_per_frame = Some(max);
        self
    }
}

/// Everything an emitter instance is built from.
#[derive(Clone, Debug)]
pub struct EmitterProperties {
    /// Emitter name, unique within its system.
    pub name: String,
    /// Whether the emitter runs at all.
    pub enabled: bool,
    /// Interpreted or dispatched.
    pub sim_target: SimTarget,
    /// Initializes new instances.
    pub spawn_script: Option<Arc<Program>>,
    /// Advances existing instances.
    pub update_script: Option<Arc<Program>>,
    /// Combined spawn/update kernel for [`SimTarget::Gpu`].
    pub gpu_kernel: Option<Arc<Program>>,
    /// Event handlers, run after spawn in order.
    pub event_handlers: Vec<EventHandlerProps>,
    /// Events written by the spawn program.
    pub spawn_event_generators: Vec<EventGeneratorProps>,
    /// Events written by the update program.
    pub update_event_generators: Vec<EventGeneratorProps>,
    /// Time-based spawning.
    pub spawn_rates: Vec<SpawnRate>,
    /// Track persistent IDs for every instance.
    pub requires_persistent_ids: bool,
    /// Instances are simulated in component space.
    pub local_space: bool,
    /// Report these bounds instead of computing them.
    pub fixed_bounds: Option<Bounds>,
    /// Base extent of each renderer drawing this emitter.
    pub renderer_base_extents: Vec<[f32; 3]>,
}

impl EmitterProperties {
    /// CPU emitter running `spawn` and `update`.
    #[must_use]
    pub fn cpu(name: impl Into<String>, spawn: Arc<Program>, update: Arc<Program>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            sim_target: SimTarget::Cpu,
            spawn_script: Some(spawn),
            update_script: Some(update),
            gpu_kernel: None,
            event_handlers: Vec::new(),
            spawn_event_generators: Vec::new(),
            update_event_generators: Vec::new(),
            spawn_rates: Vec::new(),
            requires_persistent_ids: false,
            local_space: false,
            fixed_bounds: None,
            renderer_base_extents: Vec::new(),
        }
    }

    /// GPU emitter dispatching `kernel`; `spawn` and `update` still pass
    /// error checking and provide the layout.
    #[must_use]
    pub fn gpu(
        name: impl Into<String>,
        spawn: Arc<Program>,
        update: Arc<Program>,
        kernel: Arc<Program>,
    ) -> Self {
        Self {
            sim_target: SimTarget::Gpu,
            gpu_kernel: Some(kernel),
            ..Self::cpu(name, spawn, update)
        }
    }

    /// Adds a continuous spawn rate.
    #[must_use]
    pub fn with_spawn_rate(mut self, rate: SpawnRate) -> Self {
        self.spawn_rates.push(rate);
        self
    }

    /// Adds an event handler.
    #[must_use]
    pub fn with_event_handler(mut self, handler: EventHandlerProps) -> Self {
        self.event_handlers.push(handler);
        self
    }

    /// Bounds reported when computed bounds are unavailable.
    #[must_use]
    pub fn fixed_or_default_bounds(&self) -> Bounds {
        self.fixed_bounds.unwrap_or(DEFAULT_FIXED_BOUNDS)
    }

    /// Largest renderer base extent component, never below 0.0001.
    #[must_use]
    pub fn max_base_extent(&self) -> f32 {
        self.renderer_base_extents
            .iter()
            .flatten()
            .fold(0.0001_f32, |max, &extent| max.max(extent))
    }
}

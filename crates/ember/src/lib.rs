//! # EMBER
//!
//! Per-frame simulation of particle emitters. An [`EmitterInstance`] owns
//! one particle data set and runs its spawn, update and event programs
//! against it every frame, on the CPU interpreter or through a GPU
//! compute queue.
//!
//! ## Architecture Rules
//!
//! 1. **Tick never fails** - fatal problems disable the emitter and keep a
//!    [`DisableReason`]; everything else is logged
//! 2. **Disabled is terminal** - no state change leaves it
//! 3. **Events are last frame's** - handlers read the `previous` buffer of
//!    the generating emitter's event data set
//! 4. **The ceiling drops, never truncates** - a frame whose spawns would
//!    pass `max_instances_per_emitter` spawns nothing
//!
//! ## Example
//!
//! ```rust,ignore
//! use ember::{EmitterInstance, EmitterProperties, EngineConfig, EventRegistry, SpawnRate, StaticHost};
//!
//! let props = EmitterProperties::cpu("Sparks", spawn, update).with_spawn_rate(SpawnRate::new(10.0));
//! let host = StaticHost::new(1);
//! let mut emitter = EmitterInstance::new(Arc::new(props), &EngineConfig::default(), EventRegistry::new(), &host, None);
//!
//! emitter.pre_tick();
//! emitter.tick(0.1, &host);
//! assert_eq!(emitter.num_particles(), 1);
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod capture;
pub mod config;
pub mod emitter;
pub mod error;
pub mod events;
pub mod host;
pub mod properties;
pub mod spawn;

pub use capture::{ScriptCapture, ScriptUsage};
pub use config::{ConfigError, ConfigResult, EngineConfig, GpuConfig, VmConfig};
pub use emitter::{
    EmitterInstance, ExecutionState, DELTA_TIME_PARAM, EMITTER_AGE_PARAM, ID_ATTRIBUTE,
    PARTICLE_INDEX_ATTRIBUTE,
};
pub use error::{DisableReason, EmitterError, EmitterResult};
pub use events::{EventKey, EventRegistry};
pub use host::{HostInstance, StaticHost, TranslatedHost};
pub use properties::{EmitterProperties, EventGeneratorProps, EventHandlerProps, DEFAULT_FIXED_BOUNDS};
pub use spawn::{SpawnInfo, SpawnRate};

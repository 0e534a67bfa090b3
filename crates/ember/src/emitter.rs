//! # Emitter Instance
//!
//! One running emitter: its particle data set, one execution context per
//! program, and the per-frame tick that drives them.
//!
//! ## Frame
//!
//! ```text
//! pre_tick():  bind contexts ─> apply reset ─> data.tick()   (CPU)
//! tick(dt):    completion? ─> spawn counts ─> ceiling
//!                 ├── GPU: stage + queue ComputeContext, fixed bounds
//!                 └── CPU: update(prev) ─> spawn batches ─> event handlers
//!                          ─> bounds ─> post_tick
//! ```
//!
//! ## State
//!
//! ```text
//! Active ──> Inactive ──> (no instances left) ──> Complete
//!    │           ^
//!    └──> InactiveClear (buffers dropped next tick)
//!
//! any ──> Disabled   (terminal)
//! ```
//!
//! Failures never escape `tick`: a fatal one disables the emitter and is
//! kept as a [`DisableReason`]; the rest are logged and the frame goes on.

use std::sync::Arc;
use std::time::Instant;

use ember_core::{
    AttributeAccessor, Bounds, DataSet, InstanceId, ParameterBinding, ParameterStore,
    SharedDataSet, SimTarget, ValueType,
};
use ember_gpu::{
    ComputeContext, ComputeFrame, ComputeQueue, EXECUTION_COUNT_PARAM, INTERP_SPAWN_START_PARAM,
    SPAWN_GROUP_PARAM, SPAWN_INTERVAL_PARAM,
};
use ember_vm::{DataSetWindow, EventExecutionMode, ExecuteOutcome, ExecutionContext, Program};
use parking_lot::MutexGuard;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::capture::{ScriptCapture, ScriptUsage};
use crate::config::EngineConfig;
use crate::error::{DisableReason, EmitterError, EmitterResult};
use crate::events::EventRegistry;
use crate::host::HostInstance;
use crate::properties::{EmitterProperties, EventHandlerProps};
use crate::spawn::{SpawnInfo, SpawnRate};

/// Seconds since the emitter (re)started.
pub const EMITTER_AGE_PARAM: &str = "Emitter.Age";
/// Frame delta time.
pub const DELTA_TIME_PARAM: &str = "Engine.DeltaTime";
/// Payload attribute naming the target of a single-particle event.
pub const PARTICLE_INDEX_ATTRIBUTE: &str = "ParticleIndex";
/// Attribute that turns on persistent IDs.
pub const ID_ATTRIBUTE: &str = "ID";

const POSITION_ATTRIBUTE: &str = "Position";
const SPRITE_SIZE_ATTRIBUTE: &str = "SpriteSize";
const SCALE_ATTRIBUTE: &str = "Scale";
/// Expansion when no size attribute exists.
const DEFAULT_PARTICLE_SIZE: f32 = 50.0;

/// Lifecycle of an emitter instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ExecutionState {
    /// Spawning and updating.
    Active,
    /// Updating existing instances, no new spawns.
    Inactive,
    /// Drops every instance on the next tick, then becomes `Inactive`.
    InactiveClear,
    /// Finished; ticks are no-ops.
    Complete,
    /// Failed or switched off. Terminal.
    Disabled,
}

/// Engine-written parameters of one context, resolved once.
#[derive(Clone, Copy, Debug, Default)]
struct DirectBindings {
    age: Option<ParameterBinding>,
    delta_time: Option<ParameterBinding>,
    exec_count: Option<ParameterBinding>,
    spawn_interval: Option<ParameterBinding>,
    interp_spawn_start: Option<ParameterBinding>,
    spawn_group: Option<ParameterBinding>,
}

impl DirectBindings {
    fn resolve(store: &ParameterStore) -> Self {
        Self {
            age: store.binding(EMITTER_AGE_PARAM),
            delta_time: store.binding(DELTA_TIME_PARAM),
            exec_count: store.binding(EXECUTION_COUNT_PARAM),
            spawn_interval: store.binding(SPAWN_INTERVAL_PARAM),
            interp_spawn_start: store.binding(INTERP_SPAWN_START_PARAM),
            spawn_group: store.binding(SPAWN_GROUP_PARAM),
        }
    }

    fn write_frame(&self, store: &mut ParameterStore, age: f32, dt: f32) {
        store.write_f32(self.age, age);
        store.write_f32(self.delta_time, dt);
    }

    fn write_exec_count(&self, store: &mut ParameterStore, count: usize) {
        store.write_i32(self.exec_count, i32::try_from(count).unwrap_or(i32::MAX));
    }

    fn write_spawn(&self, store: &mut ParameterStore, info: &SpawnInfo) {
        self.write_exec_count(store, info.count);
        store.write_f32(self.spawn_interval, info.interval_dt);
        store.write_f32(self.interp_spawn_start, info.interp_start_dt);
        store.write_i32(self.spawn_group, info.spawn_group);
    }
}

/// A CPU context plus its direct bindings.
struct ScriptContext {
    context: ExecutionContext,
    bindings: DirectBindings,
}

impl ScriptContext {
    fn init(program: &Arc<Program>, config: &EngineConfig, seed: u64) -> Result<Self, DisableReason> {
        let mut context = ExecutionContext::new()
            .with_limits(config.register_limits())
            .with_seed(seed);
        context.init(Arc::clone(program), SimTarget::Cpu)?;
        let bindings = DirectBindings::resolve(context.parameters());
        Ok(Self { context, bindings })
    }
}

/// GPU simulation handle: the context and the queue that dispatches it.
struct GpuSimulation {
    context: Arc<ComputeContext>,
    queue: Arc<dyn ComputeQueue>,
    bindings: DirectBindings,
}

/// Spawns requested by one handler's events this frame.
#[derive(Clone, Copy, Debug)]
struct EventSpawn {
    event: usize,
    count: usize,
}

/// A spawned sub-batch an event handler runs over.
#[derive(Clone, Copy, Debug)]
struct SpawnedBatch {
    event: usize,
    start: usize,
    count: usize,
}

/// One running emitter.
pub struct EmitterInstance {
    props: Arc<EmitterProperties>,
    registry: Arc<EventRegistry>,
    owner: InstanceId,
    state: ExecutionState,
    disable_reason: Option<DisableReason>,

    max_instances: usize,
    default_max_events: usize,
    dump_particle_data: bool,

    data_set: SharedDataSet,
    spawn: Option<ScriptContext>,
    update: Option<ScriptContext>,
    events: Vec<ScriptContext>,
    gpu: Option<GpuSimulation>,
    spawn_event_sets: Vec<SharedDataSet>,
    update_event_sets: Vec<SharedDataSet>,

    spawn_rates: Vec<SpawnRate>,
    bursts: Vec<SpawnInfo>,

    position: Option<AttributeAccessor>,
    sprite_size: Option<AttributeAccessor>,
    scale: Option<AttributeAccessor>,

    age: f32,
    tick_count: u64,
    reset_pending: bool,
    bounds: Bounds,
    cpu_time_ms: f32,
    encountered_nans: bool,
    warned_bad_particle_index: bool,
    rng: ChaCha8Rng,
    captures: Vec<ScriptCapture>,
}

impl std::fmt::Debug for EmitterInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmitterInstance")
            .field("name", &self.props.name)
            .field("owner", &self.owner)
            .field("state", &self.state)
            .field("tick_count", &self.tick_count)
            .finish_non_exhaustive()
    }
}

impl EmitterInstance {
    /// Creates and initializes an instance of `props` owned by `host`.
    ///
    /// GPU emitters dispatch through `compute`. The instance comes back
    /// [`ExecutionState::Disabled`] if any program fails its checks; see
    /// [`EmitterInstance::disable_reason`].
    #[must_use]
    pub fn new(
        props: Arc<EmitterProperties>,
        config: &EngineConfig,
        registry: Arc<EventRegistry>,
        host: &dyn HostInstance,
        compute: Option<Arc<dyn ComputeQueue>>,
    ) -> Self {
        let owner = host.instance_id();
        let layout = Arc::new(ember_core::DataSetLayout::new(
            props
                .update_script
                .as_ref()
                .map(|program| program.attributes().to_vec())
                .unwrap_or_default(),
        ));
        let persistent_ids = props.requires_persistent_ids || layout.contains(ID_ATTRIBUTE);
        let data_set = DataSet::new(props.name.clone(), layout, props.sim_target, persistent_ids).into_shared();
        let spawn_rates = props.spawn_rates.clone();

        let mut instance = Self {
            rng: ChaCha8Rng::seed_from_u64(instance_seed(owner, &props.name)),
            props,
            registry,
            owner,
            state: ExecutionState::Active,
            disable_reason: None,
            max_instances: config.max_instances_per_emitter,
            default_max_events: config.max_events_per_frame,
            dump_particle_data: config.dump_particle_data,
            data_set,
            spawn: None,
            update: None,
            events: Vec::new(),
            gpu: None,
            spawn_event_sets: Vec::new(),
            update_event_sets: Vec::new(),
            spawn_rates,
            bursts: Vec::new(),
            position: None,
            sprite_size: None,
            scale: None,
            age: 0.0,
            tick_count: 0,
            reset_pending: false,
            bounds: Bounds::empty(),
            cpu_time_ms: 0.0,
            encountered_nans: false,
            warned_bad_particle_index: false,
            captures: Vec::new(),
        };
        instance.init(config, compute);
        instance
    }

    fn init(&mut self, config: &EngineConfig, compute: Option<Arc<dyn ComputeQueue>>) {
        if !self.props.enabled {
            self.disable(DisableReason::NotEnabled);
            return;
        }
        if let Err(reason) = self.check_for_errors() {
            self.disable(reason);
            return;
        }

        self.reset_simulation();

        let props = Arc::clone(&self.props);
        self.spawn_event_sets = props
            .spawn_event_generators
            .iter()
            .map(|generator| self.registry.create(&props.name, &generator.name, &generator.layout))
            .collect();
        self.update_event_sets = props
            .update_event_generators
            .iter()
            .map(|generator| self.registry.create(&props.name, &generator.name, &generator.layout))
            .collect();

        if let Err(reason) = self.init_contexts(config, compute) {
            self.disable(reason);
            return;
        }

        let data = self.data_set.lock();
        let layout = data.layout();
        self.position = layout.accessor(POSITION_ATTRIBUTE, ValueType::Vec3);
        self.sprite_size = layout.accessor(SPRITE_SIZE_ATTRIBUTE, ValueType::Vec2);
        self.scale = layout.accessor(SCALE_ATTRIBUTE, ValueType::Vec3);
    }

    fn init_contexts(
        &mut self,
        config: &EngineConfig,
        compute: Option<Arc<dyn ComputeQueue>>,
    ) -> Result<(), DisableReason> {
        let props = Arc::clone(&self.props);
        let seed = self.rng.gen::<u64>();

        if props.sim_target == SimTarget::Gpu {
            let kernel = props
                .gpu_kernel
                .as_ref()
                .ok_or(DisableReason::MissingScript("gpu compute"))?;
            let queue = compute.ok_or(DisableReason::NoComputeQueue)?;
            let context = ComputeContext::new(Arc::clone(kernel), Arc::clone(&self.data_set), self.owner)?;
            let bindings = context.with_parameters(|parameters| DirectBindings::resolve(parameters));
            self.gpu = Some(GpuSimulation {
                context: Arc::new(context),
                queue,
                bindings,
            });
            return Ok(());
        }

        let (Some(spawn), Some(update)) = (&props.spawn_script, &props.update_script) else {
            return Err(DisableReason::MissingScript("spawn or update"));
        };
        self.spawn = Some(ScriptContext::init(spawn, config, seed)?);
        self.update = Some(ScriptContext::init(update, config, seed.wrapping_add(1))?);
        self.events = props
            .event_handlers
            .iter()
            .zip(2_u64..)
            .map(|(handler, offset)| {
                let script = handler.script.as_ref().ok_or(DisableReason::MissingScript("event"))?;
                ScriptContext::init(script, config, seed.wrapping_add(offset))
            })
            .collect::<Result<Vec<_>, DisableReason>>()?;
        Ok(())
    }

    /// Checks every program the emitter needs before any state is built.
    ///
    /// # Errors
    ///
    /// The first problem found, as the reason to disable.
    pub fn check_for_errors(&self) -> Result<(), DisableReason> {
        let props = &self.props;
        let spawn = props
            .spawn_script
            .as_ref()
            .ok_or(DisableReason::MissingScript("spawn"))?;
        let update = props
            .update_script
            .as_ref()
            .ok_or(DisableReason::MissingScript("update"))?;

        ensure_compiled("spawn", spawn)?;
        ensure_compiled("update", update)?;
        if spawn.reads_attributes() {
            return Err(DisableReason::SpawnReadsAttributes(spawn.name().to_string()));
        }
        if spawn.attributes().is_empty() || update.attributes().is_empty() {
            return Err(DisableReason::NoAttributes);
        }
        ensure_layout("spawn", spawn, update)?;

        for handler in &props.event_handlers {
            let script = handler
                .script
                .as_ref()
                .ok_or(DisableReason::MissingScript("event"))?;
            ensure_compiled("event", script)?;
            ensure_layout("event", script, update)?;
        }

        if props.sim_target == SimTarget::Gpu {
            let kernel = props
                .gpu_kernel
                .as_ref()
                .ok_or(DisableReason::MissingScript("gpu compute"))?;
            ensure_compiled("gpu compute", kernel)?;
            ensure_layout("gpu compute", kernel, update)?;
        }
        Ok(())
    }

    // =========================================================================
    // STATE
    // =========================================================================

    /// Current state.
    #[inline]
    #[must_use]
    pub const fn execution_state(&self) -> ExecutionState {
        self.state
    }

    /// Changes state. Nothing leaves [`ExecutionState::Disabled`].
    pub fn set_execution_state(&mut self, state: ExecutionState) {
        if self.state == ExecutionState::Disabled {
            return;
        }
        self.state = state;
    }

    /// Whether the emitter is disabled.
    #[inline]
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.state == ExecutionState::Disabled
    }

    /// Whether the emitter is complete.
    #[inline]
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == ExecutionState::Complete
    }

    /// Why the emitter was disabled, if it was.
    #[must_use]
    pub const fn disable_reason(&self) -> Option<&DisableReason> {
        self.disable_reason.as_ref()
    }

    fn disable(&mut self, reason: DisableReason) {
        tracing::error!("emitter '{}' disabled: {}", self.props.name, reason);
        self.state = ExecutionState::Disabled;
        self.disable_reason = Some(reason);
    }

    /// Restarts the simulation: age and tick count go back to zero
    /// and the buffers are dropped on the next `pre_tick`. The emitter
    /// becomes [`ExecutionState::Active`] unless it is disabled.
    pub fn reset_simulation(&mut self) {
        self.reset_pending = true;
        self.age = 0.0;
        self.tick_count = 0;
        self.bounds = Bounds::empty();
        for rate in &mut self.spawn_rates {
            rate.reset();
        }
        self.bursts.clear();
        self.set_execution_state(ExecutionState::Active);
    }

    /// Marks the emitter complete when `force` is set; a complete emitter
    /// drops its instances.
    ///
    /// Returns whether the emitter is complete.
    pub fn handle_completion(&mut self, force: bool) -> bool {
        if force {
            self.set_execution_state(ExecutionState::Complete);
        }
        if !self.is_complete() {
            return false;
        }
        let mut data = self.data_set.lock();
        if data.num_instances() > 0 || data.prev_num_instances() > 0 {
            data.reset_buffers();
        }
        true
    }

    // =========================================================================
    // INPUTS
    // =========================================================================

    /// Spawns `count` instances at the start of the next tick.
    pub fn spawn_burst(&mut self, count: usize) {
        self.bursts.push(SpawnInfo::burst(count));
    }

    /// Queues a fully specified spawn batch for the next tick.
    pub fn push_spawn_info(&mut self, info: SpawnInfo) {
        self.bursts.push(info);
    }

    /// Sets a float parameter on every context that declares it.
    ///
    /// # Errors
    ///
    /// The emitter is disabled, no context declares `name`, or one
    /// declares it with another type.
    pub fn set_parameter_f32(&mut self, name: &str, value: f32) -> EmitterResult<()> {
        self.ensure_enabled()?;
        let mut found = false;
        for script in self.cpu_contexts_mut() {
            let parameters = script.context.parameters_mut();
            if parameters.binding(name).is_some() {
                parameters.set_f32(name, value)?;
                found = true;
            }
        }
        if let Some(gpu) = &self.gpu {
            gpu.context.with_parameters(|parameters| {
                if parameters.binding(name).is_some() {
                    found = true;
                    parameters.set_f32(name, value)
                } else {
                    Ok(())
                }
            })?;
        }
        if found {
            Ok(())
        } else {
            Err(EmitterError::Parameter(ember_core::ParameterError::UnknownParameter(
                name.to_string(),
            )))
        }
    }

    /// Binds a data interface on every context that declares it.
    ///
    /// Function tables are rebuilt on the next `pre_tick`.
    ///
    /// # Errors
    ///
    /// The emitter is disabled or no context declares `name`.
    pub fn set_data_interface(
        &mut self,
        name: &str,
        interface: &Arc<dyn ember_core::DataInterface>,
    ) -> EmitterResult<()> {
        self.ensure_enabled()?;
        let mut found = false;
        for script in self.cpu_contexts_mut() {
            if script.context.parameters_mut().set_interface(name, Arc::clone(interface)).is_ok() {
                found = true;
            }
        }
        if let Some(gpu) = &self.gpu {
            found |= gpu
                .context
                .with_parameters(|parameters| parameters.set_interface(name, Arc::clone(interface)))
                .is_ok();
        }
        if found {
            Ok(())
        } else {
            Err(EmitterError::Parameter(ember_core::ParameterError::UnknownInterface(
                name.to_string(),
            )))
        }
    }

    fn ensure_enabled(&self) -> EmitterResult<()> {
        match &self.disable_reason {
            Some(reason) => Err(EmitterError::Disabled {
                name: self.props.name.clone(),
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    fn cpu_contexts_mut(&mut self) -> impl Iterator<Item = &mut ScriptContext> {
        self.spawn
            .iter_mut()
            .chain(self.update.iter_mut())
            .chain(self.events.iter_mut())
    }

    // =========================================================================
    // FRAME
    // =========================================================================

    /// Start-of-frame step: binds contexts, applies a pending reset and, on
    /// the CPU path, promotes the data sets.
    pub fn pre_tick(&mut self) {
        if matches!(self.state, ExecutionState::Complete | ExecutionState::Disabled) {
            return;
        }

        if let Err(reason) = self.tick_contexts() {
            self.reset_simulation();
            self.disable(reason);
            return;
        }

        if self.tick_count == 0 {
            self.post_tick_contexts();
        }

        if self.reset_pending {
            self.data_set.lock().reset_buffers();
            for set in self.spawn_event_sets.iter().chain(&self.update_event_sets) {
                set.lock().reset_buffers();
            }
            self.reset_pending = false;
        }

        if self.props.sim_target == SimTarget::Cpu {
            self.data_set.lock().tick();
            for set in self.spawn_event_sets.iter().chain(&self.update_event_sets) {
                set.lock().tick();
            }
        }

        self.tick_count += 1;
        self.data_set
            .lock()
            .set_id_acquire_tag(i32::try_from(self.tick_count).unwrap_or(i32::MAX));
    }

    fn tick_contexts(&mut self) -> Result<(), DisableReason> {
        let owner = self.owner;
        for script in self.cpu_contexts_mut() {
            script.context.tick(owner)?;
        }
        if let Some(gpu) = &self.gpu {
            gpu.context.tick()?;
        }
        Ok(())
    }

    fn post_tick_contexts(&mut self) {
        for script in self.cpu_contexts_mut() {
            script.context.post_tick();
        }
        if let Some(gpu) = &self.gpu {
            gpu.context.post_tick();
        }
    }

    /// Advances the simulation by `dt` seconds.
    pub fn tick(&mut self, dt: f32, host: &dyn HostInstance) {
        let started = Instant::now();

        if self.handle_completion(false) {
            self.cpu_time_ms = 0.0;
            return;
        }
        if self.is_disabled() {
            return;
        }

        self.age += dt;

        if self.state == ExecutionState::InactiveClear {
            self.clear_buffers();
            self.state = ExecutionState::Inactive;
            return;
        }

        let orig_num = self.previous_count();
        if orig_num == 0 && self.state != ExecutionState::Active {
            self.data_set.lock().set_num_instances(0);
            if self.state == ExecutionState::Inactive {
                self.state = ExecutionState::Complete;
            }
            return;
        }

        self.write_frame_parameters(dt);

        let mut spawn_infos = self.collect_spawn_infos(dt);
        let event_sets = self.resolve_event_sets();
        let mut event_spawns = self.event_spawn_counts(&event_sets);

        let spawn_total: usize = spawn_infos.iter().map(|info| info.count).sum();
        let event_spawn_total: usize = event_spawns.iter().flatten().map(|spawn| spawn.count).sum();
        if orig_num + spawn_total + event_spawn_total > self.max_instances {
            tracing::warn!(
                "emitter '{}' would reach {} instances (limit {}); dropping this frame's spawns",
                self.props.name,
                orig_num + spawn_total + event_spawn_total,
                self.max_instances
            );
            spawn_infos.clear();
            event_spawns.iter_mut().for_each(Vec::clear);
        }

        if self.gpu.is_some() {
            self.tick_gpu(&spawn_infos, &event_spawns);
        } else {
            self.tick_cpu(dt, orig_num, &spawn_infos, &event_spawns, &event_sets, host);
        }

        self.cpu_time_ms = started.elapsed().as_secs_f32() * 1000.0;
    }

    /// Live instances carried into this frame.
    ///
    /// CPU data sets were promoted by `pre_tick`, so this is the previous
    /// count. GPU data sets are promoted at dispatch, so this frame has not
    /// touched them yet and their current count is still last frame's.
    fn previous_count(&self) -> usize {
        let data = self.data_set.lock();
        match self.props.sim_target {
            SimTarget::Cpu => data.prev_num_instances(),
            SimTarget::Gpu => data.num_instances(),
        }
    }

    fn clear_buffers(&self) {
        self.data_set.lock().reset_buffers();
        for set in self.spawn_event_sets.iter().chain(&self.update_event_sets) {
            set.lock().reset_buffers();
        }
    }

    fn write_frame_parameters(&mut self, dt: f32) {
        let age = self.age;
        for script in self.cpu_contexts_mut() {
            script.bindings.write_frame(script.context.parameters_mut(), age, dt);
        }
        if let Some(gpu) = &self.gpu {
            let bindings = gpu.bindings;
            gpu.context
                .with_parameters(|parameters| bindings.write_frame(parameters, age, dt));
        }
    }

    /// Time-based spawns; only an active emitter spawns.
    fn collect_spawn_infos(&mut self, dt: f32) -> Vec<SpawnInfo> {
        let bursts = std::mem::take(&mut self.bursts);
        if self.state != ExecutionState::Active {
            return Vec::new();
        }
        self.spawn_rates
            .iter_mut()
            .map(|rate| rate.advance(dt))
            .chain(bursts)
            .filter(|info| info.count > 0)
            .collect()
    }

    fn resolve_event_sets(&self) -> Vec<Option<SharedDataSet>> {
        self.props
            .event_handlers
            .iter()
            .map(|handler| self.registry.get(&handler.source_emitter, &handler.source_event))
            .collect()
    }

    fn events_to_process(&self, handler: &EventHandlerProps, set: &DataSet) -> usize {
        let available = set.prev_num_instances();
        match handler.max_events_per_frame.unwrap_or(self.default_max_events) {
            0 => available,
            max => available.min(max),
        }
    }

    /// Per-handler spawn requests of `SpawnedParticles` handlers.
    fn event_spawn_counts(&mut self, event_sets: &[Option<SharedDataSet>]) -> Vec<Vec<EventSpawn>> {
        let props = Arc::clone(&self.props);
        props
            .event_handlers
            .iter()
            .zip(event_sets)
            .map(|(handler, set)| {
                let mut spawns = Vec::new();
                let Some(set) = set else {
                    return spawns;
                };
                if handler.mode != EventExecutionMode::SpawnedParticles {
                    return spawns;
                }
                let num_events = self.events_to_process(handler, &set.lock());
                let random = handler.random_spawn_number && handler.min_spawn_number < handler.spawn_number;
                for event in 0..num_events {
                    let count = if random {
                        self.rng.gen_range(handler.min_spawn_number..=handler.spawn_number)
                    } else {
                        handler.spawn_number
                    };
                    if self.state == ExecutionState::Active && count > 0 {
                        spawns.push(EventSpawn {
                            event,
                            count: count as usize,
                        });
                    }
                }
                spawns
            })
            .collect()
    }

    fn tick_gpu(&mut self, spawn_infos: &[SpawnInfo], event_spawns: &[Vec<EventSpawn>]) {
        let Some(gpu) = &self.gpu else {
            return;
        };

        if spawn_infos.len() > 1 {
            tracing::warn!(
                "GPU emitter '{}' has {} spawn infos; only the first one's timing is used",
                self.props.name,
                spawn_infos.len()
            );
        }
        let first = spawn_infos.first().copied().unwrap_or_default();
        gpu.context.stage(ComputeFrame {
            spawn_rate_instances: spawn_infos.iter().map(|info| info.count).sum(),
            event_spawn_total: event_spawns.iter().flatten().map(|spawn| spawn.count).sum(),
            spawn_interval: first.interval_dt,
            interp_spawn_start_dt: first.interp_start_dt,
            spawn_group: first.spawn_group,
            parameters: Vec::new(),
        });
        gpu.queue.queue(&gpu.context);
        gpu.context.post_tick();

        self.bounds = self.props.fixed_or_default_bounds();
    }

    fn tick_cpu(
        &mut self,
        dt: f32,
        orig_num: usize,
        spawn_infos: &[SpawnInfo],
        event_spawns: &[Vec<EventSpawn>],
        event_sets: &[Option<SharedDataSet>],
        host: &dyn HostInstance,
    ) {
        let capture = host.should_capture_this_frame();
        let spawn_total: usize = spawn_infos.iter().map(|info| info.count).sum::<usize>()
            + event_spawns.iter().flatten().map(|spawn| spawn.count).sum::<usize>();

        let data_set = Arc::clone(&self.data_set);
        let mut data = data_set.lock();
        data.allocate(orig_num + spawn_total);

        let spawn_handles = self.spawn_event_sets.clone();
        let update_handles = self.update_event_sets.clone();
        let spawned_batches = {
            let mut spawn_sets = lock_all(&spawn_handles);
            let mut update_sets = lock_all(&update_handles);
            for set in &mut spawn_sets {
                let needed = set.num_instances() + spawn_total;
                set.allocate(needed);
            }
            for set in &mut update_sets {
                set.allocate(orig_num);
            }

            self.run_update(&mut data, &mut update_sets, orig_num, capture);
            self.run_spawns(&mut data, &mut spawn_sets, dt, spawn_infos, event_spawns, capture)
        };

        if !self.props.event_handlers.is_empty() {
            data.copy_cur_to_prev();
        }
        self.run_event_handlers(&mut data, event_sets, &spawned_batches, capture);

        self.bounds = self.compute_bounds(&data, host);
        drop(data);
        self.post_tick_contexts();
    }

    fn run_update(
        &mut self,
        data: &mut DataSet,
        update_sets: &mut [MutexGuard<'_, DataSet>],
        orig_num: usize,
        capture: bool,
    ) {
        if orig_num == 0 {
            return;
        }
        let Some(update) = self.update.as_mut() else {
            return;
        };
        update
            .bindings
            .write_exec_count(update.context.parameters_mut(), orig_num);

        let mut windows = Vec::with_capacity(1 + update_sets.len());
        windows.push(DataSetWindow::main(&mut *data));
        for set in update_sets.iter_mut() {
            windows.push(DataSetWindow {
                data_set: &mut **set,
                start_instance: 0,
                allocate: false,
                update_instance_count: true,
            });
        }
        update.context.execute(orig_num, &mut windows);
        drop(windows);

        debug_assert!(
            data.num_instances() <= orig_num,
            "update grew the population from {orig_num} to {}",
            data.num_instances()
        );
        if self.dump_particle_data {
            data.dump(0, data.num_instances(), "update");
        }
        if capture {
            let parameters = update.context.parameters();
            let record = ScriptCapture::record(
                ScriptUsage::Update,
                self.tick_count,
                data,
                0,
                orig_num,
                parameters,
            );
            self.captures.push(record);
        }
    }

    /// Runs the spawn program once per batch and returns the sub-batches
    /// spawned for each handler's events.
    fn run_spawns(
        &mut self,
        data: &mut DataSet,
        spawn_sets: &mut [MutexGuard<'_, DataSet>],
        dt: f32,
        spawn_infos: &[SpawnInfo],
        event_spawns: &[Vec<EventSpawn>],
        capture: bool,
    ) -> Vec<Vec<SpawnedBatch>> {
        let before_spawn = data.num_instances();
        let mut batches = Vec::with_capacity(event_spawns.len());

        for info in spawn_infos {
            self.spawn_batch(data, spawn_sets, info);
        }

        let event_timing = SpawnInfo {
            count: 0,
            interval_dt: 0.0,
            interp_start_dt: dt * 0.5,
            spawn_group: 0,
        };
        for spawns in event_spawns {
            let mut handler_batches = Vec::with_capacity(spawns.len());
            for spawn in spawns {
                let start = data.num_instances();
                self.spawn_batch(
                    data,
                    spawn_sets,
                    &SpawnInfo {
                        count: spawn.count,
                        ..event_timing
                    },
                );
                handler_batches.push(SpawnedBatch {
                    event: spawn.event,
                    start,
                    count: spawn.count,
                });
            }
            batches.push(handler_batches);
        }

        let spawned = data.num_instances() - before_spawn;
        if spawned > 0 && capture {
            if let Some(spawn) = &self.spawn {
                let record = ScriptCapture::record(
                    ScriptUsage::Spawn,
                    self.tick_count,
                    data,
                    before_spawn,
                    spawned,
                    spawn.context.parameters(),
                );
                self.captures.push(record);
            }
        }
        batches
    }

    fn spawn_batch(&mut self, data: &mut DataSet, spawn_sets: &mut [MutexGuard<'_, DataSet>], info: &SpawnInfo) {
        if info.count == 0 {
            return;
        }
        let Some(spawn) = self.spawn.as_mut() else {
            return;
        };
        spawn.bindings.write_spawn(spawn.context.parameters_mut(), info);

        let start = data.num_instances();
        let mut windows = Vec::with_capacity(1 + spawn_sets.len());
        windows.push(DataSetWindow {
            data_set: &mut *data,
            start_instance: start,
            allocate: true,
            update_instance_count: true,
        });
        for set in spawn_sets.iter_mut() {
            let event_start = set.num_instances();
            windows.push(DataSetWindow {
                data_set: &mut **set,
                start_instance: event_start,
                allocate: true,
                update_instance_count: true,
            });
        }
        let outcome = spawn.context.execute(info.count, &mut windows);
        drop(windows);

        if outcome == ExecuteOutcome::Skipped {
            tracing::warn!("emitter '{}' skipped a spawn of {}", self.props.name, info.count);
        }
        if self.dump_particle_data {
            data.dump(start, info.count, "spawn");
        }
    }

    fn run_event_handlers(
        &mut self,
        data: &mut DataSet,
        event_sets: &[Option<SharedDataSet>],
        spawned_batches: &[Vec<SpawnedBatch>],
        capture: bool,
    ) {
        let props = Arc::clone(&self.props);
        for (index, handler) in props.event_handlers.iter().enumerate() {
            let Some(Some(source)) = event_sets.get(index) else {
                continue;
            };
            let mut events = source.lock();
            let num_events = self.events_to_process(handler, &events);
            let before = data.num_instances();

            match handler.mode {
                EventExecutionMode::SpawnedParticles => {
                    let batches = spawned_batches.get(index).map_or(&[][..], Vec::as_slice);
                    self.run_spawned_particles(index, data, &mut events, batches);
                }
                EventExecutionMode::EveryParticle => {
                    self.run_every_particle(index, data, &mut events, num_events);
                }
                EventExecutionMode::SingleParticle => {
                    self.run_single_particle(index, data, &mut events, num_events);
                }
            }

            if capture {
                if let Some(script) = self.events.get(index) {
                    let record = ScriptCapture::record(
                        ScriptUsage::Event(index),
                        self.tick_count,
                        data,
                        0,
                        before.max(data.num_instances()),
                        script.context.parameters(),
                    );
                    self.captures.push(record);
                }
            }
        }
    }

    fn run_spawned_particles(
        &mut self,
        index: usize,
        data: &mut DataSet,
        events: &mut DataSet,
        batches: &[SpawnedBatch],
    ) {
        let Some(script) = self.events.get_mut(index) else {
            return;
        };
        for batch in batches {
            let count = batch.count.min(data.num_instances().saturating_sub(batch.start));
            if count == 0 {
                continue;
            }
            script.bindings.write_exec_count(script.context.parameters_mut(), count);
            script.context.execute(
                count,
                &mut [
                    DataSetWindow {
                        data_set: &mut *data,
                        start_instance: batch.start,
                        allocate: false,
                        update_instance_count: false,
                    },
                    DataSetWindow::read_only(&mut *events, batch.event),
                ],
            );
        }
    }

    fn run_every_particle(&mut self, index: usize, data: &mut DataSet, events: &mut DataSet, num_events: usize) {
        let Some(script) = self.events.get_mut(index) else {
            return;
        };
        for event in 0..num_events {
            data.copy_cur_to_prev();
            let count = data.num_instances();
            if count == 0 {
                break;
            }
            script.bindings.write_exec_count(script.context.parameters_mut(), count);
            script.context.execute(
                count,
                &mut [
                    DataSetWindow {
                        data_set: &mut *data,
                        start_instance: 0,
                        allocate: false,
                        update_instance_count: true,
                    },
                    DataSetWindow::read_only(&mut *events, event),
                ],
            );
        }
    }

    fn run_single_particle(&mut self, index: usize, data: &mut DataSet, events: &mut DataSet, num_events: usize) {
        let Some(accessor) = events.layout().accessor(PARTICLE_INDEX_ATTRIBUTE, ValueType::Int) else {
            if !self.warned_bad_particle_index {
                tracing::warn!(
                    "emitter '{}': event '{}' has no {} attribute; single-particle handler skipped",
                    self.props.name,
                    events.name(),
                    PARTICLE_INDEX_ATTRIBUTE
                );
                self.warned_bad_particle_index = true;
            }
            return;
        };
        let Some(script) = self.events.get_mut(index) else {
            return;
        };

        data.copy_cur_to_prev();
        script.bindings.write_exec_count(script.context.parameters_mut(), 1);
        for event in 0..num_events {
            let target = accessor
                .read_i32(events.previous(), event)
                .and_then(|value| usize::try_from(value).ok())
                .filter(|&target| target < data.num_instances());
            let Some(target) = target else {
                if !self.warned_bad_particle_index {
                    tracing::warn!(
                        "emitter '{}': event {} targets a particle outside 0..{}; skipped",
                        self.props.name,
                        event,
                        data.num_instances()
                    );
                    self.warned_bad_particle_index = true;
                }
                continue;
            };
            script.context.execute(
                1,
                &mut [
                    DataSetWindow {
                        data_set: &mut *data,
                        start_instance: target,
                        allocate: false,
                        update_instance_count: false,
                    },
                    DataSetWindow::read_only(&mut *events, event),
                ],
            );
        }
    }

    // =========================================================================
    // BOUNDS
    // =========================================================================

    fn compute_bounds(&mut self, data: &DataSet, host: &dyn HostInstance) -> Bounds {
        if let Some(fixed) = self.props.fixed_bounds {
            return fixed;
        }
        let Some(dynamic) = self.dynamic_bounds(data) else {
            return self.props.fixed_or_default_bounds();
        };
        if self.props.local_space || host.is_local_space() {
            dynamic
        } else {
            host.world_to_local(dynamic)
        }
    }

    /// Bounds of every live position, grown by the largest particle size.
    fn dynamic_bounds(&mut self, data: &DataSet) -> Option<Bounds> {
        let num_instances = data.num_instances();
        let position = self.position?;
        if num_instances == 0 {
            return None;
        }

        let buffer = data.current();
        let mut bounds = Bounds::empty();
        let mut max_size = if self.scale.is_none() && self.sprite_size.is_none() {
            [DEFAULT_PARTICLE_SIZE; 3]
        } else {
            [0.0; 3]
        };

        for instance in 0..num_instances {
            let Some(point) = position.read_vec3(buffer, instance) else {
                continue;
            };
            if point.iter().any(|c| c.is_nan()) {
                if !self.encountered_nans {
                    tracing::warn!(
                        "emitter '{}' has NaN particle positions; likely a divide by zero in a script",
                        self.props.name
                    );
                    self.encountered_nans = true;
                }
                continue;
            }
            bounds.include(point);

            if let Some(scale) = self.scale.and_then(|scale| scale.read_vec3(buffer, instance)) {
                for (max, component) in max_size.iter_mut().zip(scale) {
                    *max = max.max(component);
                }
            } else if let Some(size) = self.sprite_size.and_then(|size| size.read_vec3(buffer, instance)) {
                let largest = size[0].max(size[1]);
                for axis in &mut max_size {
                    *axis = axis.max(largest);
                }
            }
        }

        if !bounds.is_valid() {
            return None;
        }
        if max_size.iter().all(|c| c.abs() <= f32::EPSILON) {
            max_size = [1.0; 3];
        }
        let base = self.props.max_base_extent();
        Some(bounds.expand_by(max_size.map(|c| c * base)))
    }

    // =========================================================================
    // TEARDOWN
    // =========================================================================

    /// Tears the instance down: withdraws GPU work and drops the event data
    /// sets this emitter generates. The emitter ends up complete.
    pub fn release(&mut self) {
        if let Some(gpu) = self.gpu.take() {
            gpu.queue.retire(&gpu.context);
        }
        self.registry.remove_emitter(&self.props.name);
        self.spawn_event_sets.clear();
        self.update_event_sets.clear();
        self.set_execution_state(ExecutionState::Complete);
    }

    // =========================================================================
    // STATS
    // =========================================================================

    /// Properties this instance runs.
    #[inline]
    #[must_use]
    pub fn properties(&self) -> &Arc<EmitterProperties> {
        &self.props
    }

    /// Particle data set.
    #[inline]
    #[must_use]
    pub fn data_set(&self) -> &SharedDataSet {
        &self.data_set
    }

    /// GPU simulation context, on the GPU path.
    #[must_use]
    pub fn compute_context(&self) -> Option<&Arc<ComputeContext>> {
        self.gpu.as_ref().map(|gpu| &gpu.context)
    }

    /// Live instances. On the GPU path this is the readback estimate.
    #[must_use]
    pub fn num_particles(&self) -> usize {
        self.data_set.lock().num_instances()
    }

    /// Bytes held by the particle and generated event data sets.
    #[must_use]
    pub fn total_bytes_used(&self) -> usize {
        self.data_set.lock().size_bytes()
            + self
                .spawn_event_sets
                .iter()
                .chain(&self.update_event_sets)
                .map(|set| set.lock().size_bytes())
                .sum::<usize>()
    }

    /// Milliseconds spent in the last `tick`.
    #[inline]
    #[must_use]
    pub const fn cpu_time_ms(&self) -> f32 {
        self.cpu_time_ms
    }

    /// `pre_tick` calls since the last reset.
    #[inline]
    #[must_use]
    pub const fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Seconds since the last reset.
    #[inline]
    #[must_use]
    pub const fn age(&self) -> f32 {
        self.age
    }

    /// Bounds from the last tick.
    #[inline]
    #[must_use]
    pub const fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Takes the script captures recorded since the last call.
    pub fn take_debug_captures(&mut self) -> Vec<ScriptCapture> {
        std::mem::take(&mut self.captures)
    }
}

fn ensure_compiled(script: &'static str, program: &Program) -> Result<(), DisableReason> {
    if program.is_compiled() {
        Ok(())
    } else {
        Err(DisableReason::ScriptNotReady {
            script,
            name: program.name().to_string(),
        })
    }
}

fn ensure_layout(script: &'static str, program: &Program, update: &Program) -> Result<(), DisableReason> {
    if program.attributes() == update.attributes() {
        Ok(())
    } else {
        Err(DisableReason::LayoutMismatch {
            script,
            name: program.name().to_string(),
        })
    }
}

fn lock_all(sets: &[SharedDataSet]) -> Vec<MutexGuard<'_, DataSet>> {
    sets.iter().map(|set| set.lock()).collect()
}

/// Deterministic per-instance seed.
fn instance_seed(owner: InstanceId, name: &str) -> u64 {
    name.bytes().fold(owner.0 ^ 0x9E37_79B9_7F4A_7C15, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01B3)
    })
}

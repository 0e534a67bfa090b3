//! Integration test: one emitter's events driving another's handlers.

use std::sync::Arc;

use ember::{
    EmitterInstance, EmitterProperties, EngineConfig, EventGeneratorProps, EventHandlerProps,
    EventRegistry, StaticHost,
};
use ember_core::{Attribute, DataSetLayout, ValueType};
use ember_vm::{BinaryOp, EventExecutionMode, Op, Operand, Program, ScriptKind};

fn attributes() -> Vec<Attribute> {
    vec![Attribute::new("Age", ValueType::Float)]
}

fn event_layout() -> Arc<DataSetLayout> {
    Arc::new(DataSetLayout::new(vec![Attribute::new(
        "ParticleIndex",
        ValueType::Int,
    )]))
}

fn program(name: &str, kind: ScriptKind, temps: usize, ops: Vec<Op>) -> Arc<Program> {
    Arc::new(
        Program::builder(name, kind)
            .attributes(attributes())
            .temps(temps)
            .ops(ops)
            .build(),
    )
}

fn zero_spawn() -> Arc<Program> {
    program(
        "spawn",
        ScriptKind::Spawn,
        0,
        vec![Op::Output {
            register: 0,
            index: None,
            value: Operand::Float(0.0),
        }],
    )
}

fn keep_update() -> Arc<Program> {
    program(
        "update",
        ScriptKind::Update,
        0,
        vec![Op::Output {
            register: 0,
            index: None,
            value: Operand::Input(0),
        }],
    )
}

/// Handler adding `amount` to the age of every instance it runs on.
fn add_age(amount: f32) -> Arc<Program> {
    program(
        "add_age",
        ScriptKind::Event(EventExecutionMode::EveryParticle),
        1,
        vec![
            Op::Binary {
                op: BinaryOp::Add,
                a: Operand::Input(0),
                b: Operand::Float(amount),
                dst: 0,
            },
            Op::Output {
                register: 0,
                index: None,
                value: Operand::Temp(0),
            },
        ],
    )
}

/// Source emitter: every spawned instance writes one `Spawned` event whose
/// payload is its index within the spawn batch.
fn source(registry: &Arc<EventRegistry>, host: &StaticHost) -> EmitterInstance {
    let spawn = program(
        "source_spawn",
        ScriptKind::Spawn,
        1,
        vec![
            Op::Output {
                register: 0,
                index: None,
                value: Operand::Float(0.0),
            },
            Op::ExecIndex { dst: 0 },
            Op::Output {
                register: 1,
                index: None,
                value: Operand::Temp(0),
            },
        ],
    );
    let mut props = EmitterProperties::cpu("Source", spawn, keep_update());
    props
        .spawn_event_generators
        .push(EventGeneratorProps::new("Spawned", event_layout()));
    EmitterInstance::new(
        Arc::new(props),
        &EngineConfig::default(),
        Arc::clone(registry),
        host,
        None,
    )
}

fn target(registry: &Arc<EventRegistry>, host: &StaticHost, handler: EventHandlerProps) -> EmitterInstance {
    let props = EmitterProperties::cpu("Target", zero_spawn(), keep_update()).with_event_handler(handler);
    EmitterInstance::new(
        Arc::new(props),
        &EngineConfig::default(),
        Arc::clone(registry),
        host,
        None,
    )
}

/// Producers tick before consumers.
fn frame(emitters: &mut [&mut EmitterInstance], host: &StaticHost) {
    for emitter in emitters.iter_mut() {
        emitter.pre_tick();
    }
    for emitter in emitters.iter_mut() {
        emitter.tick(0.1, host);
    }
}

fn ages(emitter: &EmitterInstance) -> Vec<f32> {
    let data = emitter.data_set().lock();
    (0..data.num_instances())
        .map(|i| data.current().read_f32(0, i).unwrap())
        .collect()
}

#[test]
fn test_spawned_particles_handler_runs_on_new_instances() {
    let registry = EventRegistry::new();
    let host = StaticHost::new(1);
    let handler = EventHandlerProps::new(
        add_age(5.0),
        EventExecutionMode::SpawnedParticles,
        "Source",
        "Spawned",
    )
    .with_spawn_number(2);
    let mut source = source(&registry, &host);
    let mut target = target(&registry, &host, handler);

    source.spawn_burst(3);
    frame(&mut [&mut source, &mut target], &host);
    // Events written this frame are read next frame.
    assert_eq!(target.num_particles(), 0);

    frame(&mut [&mut source, &mut target], &host);
    assert_eq!(ages(&target), vec![5.0; 6]);

    frame(&mut [&mut source, &mut target], &host);
    assert_eq!(target.num_particles(), 6);
}

#[test]
fn test_max_events_per_frame_caps_handling() {
    let registry = EventRegistry::new();
    let host = StaticHost::new(1);
    let handler = EventHandlerProps::new(
        add_age(1.0),
        EventExecutionMode::SpawnedParticles,
        "Source",
        "Spawned",
    )
    .with_spawn_number(1)
    .with_max_events_per_frame(2);
    let mut source = source(&registry, &host);
    let mut target = target(&registry, &host, handler);

    source.spawn_burst(5);
    frame(&mut [&mut source, &mut target], &host);
    frame(&mut [&mut source, &mut target], &host);
    assert_eq!(target.num_particles(), 2);
}

#[test]
fn test_random_spawn_number_stays_in_range() {
    let registry = EventRegistry::new();
    let host = StaticHost::new(1);
    let handler = EventHandlerProps::new(
        add_age(0.0),
        EventExecutionMode::SpawnedParticles,
        "Source",
        "Spawned",
    )
    .with_random_spawn_number(1, 3);
    let mut source = source(&registry, &host);
    let mut target = target(&registry, &host, handler);

    source.spawn_burst(4);
    frame(&mut [&mut source, &mut target], &host);
    frame(&mut [&mut source, &mut target], &host);
    let spawned = target.num_particles();
    assert!((4..=12).contains(&spawned), "spawned {spawned}");
}

#[test]
fn test_every_particle_handler_runs_once_per_event() {
    let registry = EventRegistry::new();
    let host = StaticHost::new(1);
    let handler = EventHandlerProps::new(add_age(1.0), EventExecutionMode::EveryParticle, "Source", "Spawned");
    let mut source = source(&registry, &host);
    let mut target = target(&registry, &host, handler);

    target.spawn_burst(4);
    source.spawn_burst(3);
    frame(&mut [&mut source, &mut target], &host);
    assert_eq!(ages(&target), vec![0.0; 4]);

    frame(&mut [&mut source, &mut target], &host);
    assert_eq!(ages(&target), vec![3.0; 4]);
}

#[test]
fn test_single_particle_handler_targets_payload_index() {
    let registry = EventRegistry::new();
    let host = StaticHost::new(1);
    let handler = EventHandlerProps::new(
        add_age(10.0),
        EventExecutionMode::SingleParticle,
        "Source",
        "Spawned",
    );
    let mut source = source(&registry, &host);
    let mut target = target(&registry, &host, handler);

    target.spawn_burst(2);
    // Payloads 0, 1, 2; index 2 is past the target's instances.
    source.spawn_burst(3);
    frame(&mut [&mut source, &mut target], &host);
    frame(&mut [&mut source, &mut target], &host);

    assert_eq!(ages(&target), vec![10.0, 10.0]);
    assert!(!target.is_disabled());
}

#[test]
fn test_missing_source_is_ignored() {
    let registry = EventRegistry::new();
    let host = StaticHost::new(1);
    let handler = EventHandlerProps::new(add_age(1.0), EventExecutionMode::EveryParticle, "Nowhere", "Spawned");
    let mut target = target(&registry, &host, handler);

    target.spawn_burst(2);
    frame(&mut [&mut target], &host);
    frame(&mut [&mut target], &host);
    assert_eq!(ages(&target), vec![0.0; 2]);
}

#[test]
fn test_release_drops_generated_events() {
    let registry = EventRegistry::new();
    let host = StaticHost::new(1);
    let mut source = source(&registry, &host);
    assert!(registry.get("Source", "Spawned").is_some());

    source.release();
    assert!(registry.get("Source", "Spawned").is_none());
    assert!(source.is_complete());
}

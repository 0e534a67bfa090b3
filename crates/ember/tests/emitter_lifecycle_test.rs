//! Integration test: CPU emitter spawning, aging, ceiling and lifecycle.

use std::sync::Arc;

use ember::{
    DisableReason, EmitterError, EmitterInstance, EmitterProperties, EngineConfig, EventRegistry,
    ExecutionState, ScriptUsage, SpawnRate, StaticHost, TranslatedHost,
};
use ember_core::{Attribute, ParameterDecl, ValueType};
use ember_vm::{BinaryOp, Op, Operand, Program, ScriptKind, UnaryOp};

const LIFETIME: f32 = 0.55;

fn attributes() -> Vec<Attribute> {
    vec![Attribute::new("Age", ValueType::Float)]
}

fn spawn_script() -> Arc<Program> {
    Arc::new(
        Program::builder("spawn", ScriptKind::Spawn)
            .attributes(attributes())
            .ops([Op::Output {
                register: 0,
                index: None,
                value: Operand::Float(0.0),
            }])
            .build(),
    )
}

/// Ages instances by `Engine.DeltaTime` and kills them past `LIFETIME`.
fn aging_update() -> Arc<Program> {
    Arc::new(
        Program::builder("update", ScriptKind::Update)
            .attributes(attributes())
            .parameter(ParameterDecl::new("Engine.DeltaTime", ValueType::Float))
            .temps(3)
            .ops([
                Op::Binary {
                    op: BinaryOp::Add,
                    a: Operand::Input(0),
                    b: Operand::Param(0),
                    dst: 0,
                },
                Op::Binary {
                    op: BinaryOp::Less,
                    a: Operand::Temp(0),
                    b: Operand::Float(LIFETIME),
                    dst: 1,
                },
                Op::AcquireIndex {
                    data_set: 0,
                    keep: Operand::Temp(1),
                    dst: 2,
                },
                Op::Output {
                    register: 0,
                    index: Some(Operand::Temp(2)),
                    value: Operand::Temp(0),
                },
            ])
            .build(),
    )
}

fn emitter(props: EmitterProperties, config: &EngineConfig) -> EmitterInstance {
    EmitterInstance::new(
        Arc::new(props),
        config,
        EventRegistry::new(),
        &StaticHost::new(7),
        None,
    )
}

fn frame(emitter: &mut EmitterInstance, host: &StaticHost) {
    emitter.pre_tick();
    emitter.tick(0.1, host);
}

#[test]
fn test_rate_spawns_one_per_tenth_second() {
    let props = EmitterProperties::cpu("Sparks", spawn_script(), aging_update())
        .with_spawn_rate(SpawnRate::new(10.0));
    let mut emitter = emitter(props, &EngineConfig::default());
    let host = StaticHost::new(7);

    frame(&mut emitter, &host);

    let data = emitter.data_set().lock();
    assert_eq!(data.num_instances(), 1);
    assert_eq!(data.prev_num_instances(), 0);
    assert_eq!(data.current().read_f32(0, 0), Some(0.0));
}

#[test]
fn test_instances_age_and_die() {
    let props = EmitterProperties::cpu("Sparks", spawn_script(), aging_update());
    let mut emitter = emitter(props, &EngineConfig::default());
    let host = StaticHost::new(7);

    emitter.spawn_burst(5);
    frame(&mut emitter, &host);
    assert_eq!(emitter.num_particles(), 5);

    for _ in 0..5 {
        frame(&mut emitter, &host);
        assert_eq!(emitter.num_particles(), 5);
    }
    let age = emitter.data_set().lock().current().read_f32(0, 0).unwrap();
    assert!((age - 0.5).abs() < 1e-4, "age {age}");

    frame(&mut emitter, &host);
    assert_eq!(emitter.num_particles(), 0);
    assert_eq!(emitter.execution_state(), ExecutionState::Active);
}

#[test]
fn test_ceiling_drops_whole_frame() {
    let config = EngineConfig {
        max_instances_per_emitter: 8,
        ..EngineConfig::default()
    };
    let props = EmitterProperties::cpu("Sparks", spawn_script(), aging_update());
    let mut emitter = emitter(props, &config);
    let host = StaticHost::new(7);

    emitter.spawn_burst(5);
    frame(&mut emitter, &host);
    assert_eq!(emitter.num_particles(), 5);

    emitter.spawn_burst(5);
    frame(&mut emitter, &host);
    let data = emitter.data_set().lock();
    assert_eq!(data.num_instances(), data.prev_num_instances());
    assert_eq!(data.num_instances(), 5);
}

#[test]
fn test_inactive_emitter_drains_then_completes() {
    let props = EmitterProperties::cpu("Sparks", spawn_script(), aging_update())
        .with_spawn_rate(SpawnRate::new(10.0));
    let mut emitter = emitter(props, &EngineConfig::default());
    let host = StaticHost::new(7);

    frame(&mut emitter, &host);
    frame(&mut emitter, &host);
    assert_eq!(emitter.num_particles(), 2);

    emitter.set_execution_state(ExecutionState::Inactive);
    let mut frames = 0;
    while !emitter.is_complete() {
        frame(&mut emitter, &host);
        frames += 1;
        assert!(frames < 20, "never completed");
    }
    assert_eq!(emitter.num_particles(), 0);

    frame(&mut emitter, &host);
    assert!(emitter.is_complete());
}

#[test]
fn test_inactive_clear_drops_instances() {
    let props = EmitterProperties::cpu("Sparks", spawn_script(), aging_update());
    let mut emitter = emitter(props, &EngineConfig::default());
    let host = StaticHost::new(7);

    emitter.spawn_burst(3);
    frame(&mut emitter, &host);
    emitter.set_execution_state(ExecutionState::InactiveClear);
    frame(&mut emitter, &host);

    assert_eq!(emitter.execution_state(), ExecutionState::Inactive);
    assert_eq!(emitter.num_particles(), 0);

    frame(&mut emitter, &host);
    assert!(emitter.is_complete());
}

#[test]
fn test_disabled_is_terminal() {
    let mut props = EmitterProperties::cpu("Sparks", spawn_script(), aging_update());
    props.enabled = false;
    let mut emitter = emitter(props, &EngineConfig::default());
    let host = StaticHost::new(7);

    assert_eq!(emitter.disable_reason(), Some(&DisableReason::NotEnabled));
    emitter.set_execution_state(ExecutionState::Active);
    emitter.reset_simulation();
    emitter.spawn_burst(4);
    frame(&mut emitter, &host);

    assert_eq!(emitter.execution_state(), ExecutionState::Disabled);
    assert_eq!(emitter.num_particles(), 0);
    assert!(matches!(
        emitter.set_parameter_f32("Engine.DeltaTime", 0.5),
        Err(EmitterError::Disabled { .. })
    ));
}

#[test]
fn test_reset_restarts_simulation() {
    let props = EmitterProperties::cpu("Sparks", spawn_script(), aging_update());
    let mut emitter = emitter(props, &EngineConfig::default());
    let host = StaticHost::new(7);

    emitter.spawn_burst(3);
    frame(&mut emitter, &host);
    frame(&mut emitter, &host);
    assert_eq!(emitter.tick_count(), 2);

    emitter.reset_simulation();
    assert_eq!(emitter.tick_count(), 0);
    frame(&mut emitter, &host);

    assert_eq!(emitter.tick_count(), 1);
    assert_eq!(emitter.num_particles(), 0);
    assert!((emitter.age() - 0.1).abs() < 1e-6);
}

#[test]
fn test_unknown_parameter_is_rejected() {
    let props = EmitterProperties::cpu("Sparks", spawn_script(), aging_update());
    let mut emitter = emitter(props, &EngineConfig::default());

    assert!(emitter.set_parameter_f32("Engine.DeltaTime", 0.2).is_ok());
    assert!(matches!(
        emitter.set_parameter_f32("User.Missing", 1.0),
        Err(EmitterError::Parameter(_))
    ));
}

#[test]
fn test_capture_records_spawn_and_update() {
    let props = EmitterProperties::cpu("Sparks", spawn_script(), aging_update());
    let mut emitter = emitter(props, &EngineConfig::default());
    let host = StaticHost {
        capture: true,
        ..StaticHost::new(7)
    };

    emitter.spawn_burst(2);
    frame(&mut emitter, &host);
    frame(&mut emitter, &host);

    let captures = emitter.take_debug_captures();
    let usages: Vec<_> = captures.iter().map(|capture| capture.usage).collect();
    assert_eq!(usages, vec![ScriptUsage::Spawn, ScriptUsage::Update]);
    assert_eq!(captures[1].num_instances, 2);
    assert!((captures[1].read_f32(0, 0).unwrap() - 0.1).abs() < 1e-6);
    assert!(emitter.take_debug_captures().is_empty());
}

/// Spawns along +X: instance `i` at `(i, 0, 0)`.
fn line_spawn() -> Arc<Program> {
    Arc::new(
        Program::builder("spawn", ScriptKind::Spawn)
            .attributes(vec![Attribute::new("Position", ValueType::Vec3)])
            .temps(2)
            .ops([
                Op::ExecIndex { dst: 0 },
                Op::Unary {
                    op: UnaryOp::ToFloat,
                    a: Operand::Temp(0),
                    dst: 1,
                },
                Op::Output {
                    register: 0,
                    index: None,
                    value: Operand::Temp(1),
                },
                Op::Output {
                    register: 1,
                    index: None,
                    value: Operand::Float(0.0),
                },
                Op::Output {
                    register: 2,
                    index: None,
                    value: Operand::Float(0.0),
                },
            ])
            .build(),
    )
}

fn still_update() -> Arc<Program> {
    Arc::new(
        Program::builder("update", ScriptKind::Update)
            .attributes(vec![Attribute::new("Position", ValueType::Vec3)])
            .ops((0..3).map(|register| Op::Output {
                register,
                index: None,
                value: Operand::Input(register),
            }))
            .build(),
    )
}

#[test]
fn test_bounds_follow_positions_in_local_space() {
    let mut props = EmitterProperties::cpu("Line", line_spawn(), still_update());
    props.renderer_base_extents = vec![[0.01, 0.01, 0.01]];
    let host = TranslatedHost {
        id: ember_core::InstanceId(3),
        offset: [10.0, 0.0, 0.0],
    };
    let mut emitter = EmitterInstance::new(
        Arc::new(props),
        &EngineConfig::default(),
        EventRegistry::new(),
        &host,
        None,
    );

    emitter.spawn_burst(4);
    emitter.pre_tick();
    emitter.tick(0.1, &host);

    // No size attribute: 50 units times the 0.01 base extent.
    let bounds = emitter.bounds();
    assert!((bounds.min[0] - (-10.5)).abs() < 1e-4, "{bounds:?}");
    assert!((bounds.max[0] - (-6.5)).abs() < 1e-4, "{bounds:?}");
    assert!((bounds.max[1] - 0.5).abs() < 1e-4, "{bounds:?}");
}

#[test]
fn test_fixed_bounds_win() {
    let mut props = EmitterProperties::cpu("Line", line_spawn(), still_update());
    let fixed = ember_core::Bounds::new([-1.0; 3], [1.0; 3]);
    props.fixed_bounds = Some(fixed);
    let mut emitter = emitter(props, &EngineConfig::default());

    emitter.spawn_burst(4);
    frame(&mut emitter, &StaticHost::new(7));
    assert_eq!(emitter.bounds(), fixed);
}

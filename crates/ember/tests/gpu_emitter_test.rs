//! Integration test: GPU emitters queue work on a batcher.

use std::sync::Arc;

use ember::{
    DisableReason, EmitterInstance, EmitterProperties, EngineConfig, EventRegistry, SpawnRate,
    StaticHost, DEFAULT_FIXED_BOUNDS,
};
use ember_core::{Attribute, ParameterDecl, ValueType};
use ember_gpu::{Batcher, ComputeQueue, GpuError, SoftwareDevice};
use ember_vm::{BinaryOp, IntOp, Op, Operand, Program, ScriptKind};

fn attributes() -> Vec<Attribute> {
    vec![
        Attribute::new("Age", ValueType::Float),
        Attribute::new("Lifetime", ValueType::Float),
    ]
}

fn passthrough(name: &str, kind: ScriptKind) -> Arc<Program> {
    Arc::new(
        Program::builder(name, kind)
            .attributes(attributes())
            .ops([
                Op::Output {
                    register: 0,
                    index: None,
                    value: Operand::Float(0.0),
                },
                Op::Output {
                    register: 1,
                    index: None,
                    value: Operand::Float(1.0),
                },
            ])
            .build(),
    )
}

/// Ages carried-over instances and kills them past their lifetime; new
/// instances start with `Spawn.Lifetime`.
fn lifetime_kernel() -> Arc<Program> {
    Arc::new(
        Program::builder("lifetime", ScriptKind::GpuCompute)
            .attributes(attributes())
            .parameter(ParameterDecl::new("Engine.DeltaTime", ValueType::Float))
            .parameter(ParameterDecl::new("Engine.ExecutionCount", ValueType::Int))
            .parameter(ParameterDecl::new("Spawn.Lifetime", ValueType::Float))
            .temps(7)
            .ops([
                Op::ExecIndex { dst: 0 },
                Op::Int {
                    op: IntOp::Less,
                    a: Operand::Temp(0),
                    b: Operand::Param(4),
                    dst: 1,
                },
                Op::Binary {
                    op: BinaryOp::Add,
                    a: Operand::Input(0),
                    b: Operand::Param(0),
                    dst: 2,
                },
                Op::Select {
                    cond: Operand::Temp(1),
                    a: Operand::Temp(2),
                    b: Operand::Float(0.0),
                    dst: 3,
                },
                Op::Select {
                    cond: Operand::Temp(1),
                    a: Operand::Input(1),
                    b: Operand::Param(8),
                    dst: 4,
                },
                Op::Binary {
                    op: BinaryOp::Less,
                    a: Operand::Temp(3),
                    b: Operand::Temp(4),
                    dst: 5,
                },
                Op::AcquireIndex {
                    data_set: 0,
                    keep: Operand::Temp(5),
                    dst: 6,
                },
                Op::Output {
                    register: 0,
                    index: Some(Operand::Temp(6)),
                    value: Operand::Temp(3),
                },
                Op::Output {
                    register: 1,
                    index: Some(Operand::Temp(6)),
                    value: Operand::Temp(4),
                },
            ])
            .build(),
    )
}

fn gpu_emitter(batcher: &Arc<Batcher<SoftwareDevice>>, lifetime: f32) -> EmitterInstance {
    let props = EmitterProperties::gpu(
        "GpuSparks",
        passthrough("spawn", ScriptKind::Spawn),
        passthrough("update", ScriptKind::Update),
        lifetime_kernel(),
    )
    .with_spawn_rate(SpawnRate::new(10.0));
    let queue: Arc<dyn ComputeQueue> = Arc::clone(batcher) as Arc<dyn ComputeQueue>;
    let mut emitter = EmitterInstance::new(
        Arc::new(props),
        &EngineConfig::default(),
        EventRegistry::new(),
        &StaticHost::new(9),
        Some(queue),
    );
    emitter.set_parameter_f32("Spawn.Lifetime", lifetime).unwrap();
    emitter
}

fn batcher(latency: u64) -> Arc<Batcher<SoftwareDevice>> {
    let config = EngineConfig::default();
    Arc::new(Batcher::new(
        Arc::new(SoftwareDevice::new(latency)),
        config.batcher_config(),
    ))
}

fn frame(emitter: &mut EmitterInstance, batcher: &Batcher<SoftwareDevice>) {
    let host = StaticHost::new(9);
    emitter.pre_tick();
    emitter.tick(0.1, &host);
    batcher.dispatch();
}

#[test]
fn test_gpu_emitter_spawns_through_batcher() {
    let batcher = batcher(1);
    let mut emitter = gpu_emitter(&batcher, 100.0);

    for expected in 1..=3 {
        frame(&mut emitter, &batcher);
        assert_eq!(emitter.num_particles(), expected);
    }
    assert_eq!(batcher.device().dispatch_count(), 3);
    assert_eq!(emitter.bounds(), DEFAULT_FIXED_BOUNDS);
}

#[test]
fn test_gpu_count_settles_after_readback() {
    let batcher = batcher(1);
    let mut emitter = gpu_emitter(&batcher, 0.15);

    for _ in 0..20 {
        frame(&mut emitter, &batcher);
        let count = emitter.num_particles();
        assert!((1..=4).contains(&count), "count {count}");
    }
}

#[test]
fn test_release_retires_context() {
    let batcher = batcher(1);
    let mut emitter = gpu_emitter(&batcher, 100.0);
    frame(&mut emitter, &batcher);

    let context = Arc::clone(emitter.compute_context().unwrap());
    emitter.pre_tick();
    emitter.tick(0.1, &StaticHost::new(9));
    assert_eq!(batcher.queued(), 1);

    emitter.release();
    assert!(context.is_retired());
    assert_eq!(batcher.queued(), 0);
    assert!(emitter.is_complete());
    assert!(emitter.compute_context().is_none());
}

#[test]
fn test_non_kernel_program_disables() {
    let batcher = batcher(1);
    let props = EmitterProperties::gpu(
        "GpuSparks",
        passthrough("spawn", ScriptKind::Spawn),
        passthrough("update", ScriptKind::Update),
        passthrough("not_a_kernel", ScriptKind::Update),
    );
    let emitter = EmitterInstance::new(
        Arc::new(props),
        &EngineConfig::default(),
        EventRegistry::new(),
        &StaticHost::new(9),
        Some(batcher as Arc<dyn ComputeQueue>),
    );
    assert_eq!(
        emitter.disable_reason(),
        Some(&DisableReason::Compute(GpuError::NotAKernel("not_a_kernel".to_string())))
    );
}

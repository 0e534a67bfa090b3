//! # Interpreter Benchmark
//!
//! Throughput of a typical update script (integrate, age, kill) at
//! increasing population sizes.

#![allow(missing_docs)]

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use ember_core::{Attribute, DataSet, DataSetLayout, InstanceId, SimTarget, ValueType};
use ember_vm::{BinaryOp, DataSetWindow, ExecutionContext, Op, Operand, Program, ScriptKind};

fn layout() -> Arc<DataSetLayout> {
    Arc::new(DataSetLayout::new(vec![
        Attribute::new("Position", ValueType::Vec3),
        Attribute::new("Velocity", ValueType::Vec3),
        Attribute::new("Age", ValueType::Float),
    ]))
}

/// `Position += Velocity * dt; Age += dt`, never kills.
fn integrate_program() -> Arc<Program> {
    let mut ops = Vec::new();
    for axis in 0..3u16 {
        ops.push(Op::Binary {
            op: BinaryOp::Mul,
            a: Operand::Input(3 + axis),
            b: Operand::Float(1.0 / 60.0),
            dst: 0,
        });
        ops.push(Op::Binary {
            op: BinaryOp::Add,
            a: Operand::Input(axis),
            b: Operand::Temp(0),
            dst: 0,
        });
        ops.push(Op::Output {
            register: axis,
            index: None,
            value: Operand::Temp(0),
        });
        ops.push(Op::Output {
            register: 3 + axis,
            index: None,
            value: Operand::Input(3 + axis),
        });
    }
    ops.push(Op::Binary {
        op: BinaryOp::Add,
        a: Operand::Input(6),
        b: Operand::Float(1.0 / 60.0),
        dst: 0,
    });
    ops.push(Op::Output {
        register: 6,
        index: None,
        value: Operand::Temp(0),
    });

    Arc::new(
        Program::builder("integrate", ScriptKind::Update)
            .attributes(layout().attributes().to_vec())
            .temps(1)
            .ops(ops)
            .build(),
    )
}

fn bench_update(c: &mut Criterion) {
    let mut group = c.benchmark_group("interpreter_update");

    for count in [1_000, 10_000, 100_000] {
        let mut context = ExecutionContext::new();
        context
            .init(integrate_program(), SimTarget::Cpu)
            .expect("program is valid");
        context.tick(InstanceId(0)).expect("no external functions");

        let mut data = DataSet::new("bench", layout(), SimTarget::Cpu, false);
        data.allocate(count);
        data.set_num_instances(count);

        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                data.tick();
                let prev = data.prev_num_instances();
                black_box(context.execute(prev, &mut [DataSetWindow::main(&mut data)]));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_update);
criterion_main!(benches);

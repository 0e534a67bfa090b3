//! Integration test: update executions never grow a population.

use std::sync::Arc;

use ember_core::{Attribute, DataSet, DataSetLayout, InstanceId, SimTarget, ValueType};
use ember_vm::{
    BinaryOp, DataSetWindow, ExecuteOutcome, ExecutionContext, Op, Operand, Program, ScriptKind,
};

fn layout() -> Arc<DataSetLayout> {
    Arc::new(DataSetLayout::new(vec![
        Attribute::new("Age", ValueType::Float),
        Attribute::new("Lifetime", ValueType::Float),
    ]))
}

/// Keeps particles whose `Age + dt < Lifetime`, compacting survivors.
fn kill_on_lifetime(dt: f32) -> Arc<Program> {
    Arc::new(
        Program::builder("update", ScriptKind::Update)
            .attributes(layout().attributes().to_vec())
            .temps(3)
            .ops([
                Op::Binary {
                    op: BinaryOp::Add,
                    a: Operand::Input(0),
                    b: Operand::Float(dt),
                    dst: 0,
                },
                Op::Binary {
                    op: BinaryOp::Less,
                    a: Operand::Temp(0),
                    b: Operand::Input(1),
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
                Op::Output {
                    register: 1,
                    index: Some(Operand::Temp(2)),
                    value: Operand::Input(1),
                },
            ])
            .build(),
    )
}

fn seeded(count: usize) -> DataSet {
    let mut data = DataSet::new("particles", layout(), SimTarget::Cpu, false);
    data.allocate(count);
    for i in 0..count {
        data.current_mut().write_f32(0, i, 0.0);
        data.current_mut().write_f32(1, i, 0.05 * (i % 20 + 1) as f32);
    }
    data.set_num_instances(count);
    data
}

#[test]
fn test_update_never_increases_count() {
    let mut context = ExecutionContext::new();
    context.init(kill_on_lifetime(0.1), SimTarget::Cpu).unwrap();
    let mut data = seeded(200);

    let mut last = data.num_instances();
    for _ in 0..12 {
        context.tick(InstanceId(0)).unwrap();
        data.tick();
        let prev = data.prev_num_instances();
        let outcome = context.execute(prev, &mut [DataSetWindow::main(&mut data)]);
        context.post_tick();

        assert!(matches!(outcome, ExecuteOutcome::Executed { .. }));
        assert!(data.num_instances() <= prev);
        assert!(data.num_instances() <= last);
        last = data.num_instances();
    }
    assert_eq!(last, 0);
}

#[test]
fn test_survivors_are_compacted_in_order() {
    let mut context = ExecutionContext::new();
    context.init(kill_on_lifetime(0.52), SimTarget::Cpu).unwrap();
    context.tick(InstanceId(0)).unwrap();

    let mut data = seeded(20);
    data.tick();
    context.execute(20, &mut [DataSetWindow::main(&mut data)]);

    let lifetimes = data.current().float_column(1).unwrap().to_vec();
    assert_eq!(lifetimes.len(), 10);
    assert!(lifetimes.windows(2).all(|w| w[0] < w[1]));
    assert!(lifetimes.iter().all(|l| *l > 0.52));
}

//! Collection under allocation pressure: structures built across many
//! collections keep their structural identity.

use plume_asm::encode::Assembler;
use plume_asm::Opcode;
use plume_vm::{Machine, Value};

mod common;
use common::{drain, spawn_sink, ModuleImage};

/// ```erlang
/// build(Sink, 0, Acc) -> Sink ! Acc;
/// build(Sink, N, Acc) -> build(Sink, N - 1, [N | Acc]).
/// ```
/// The fresh region is 8 words, so a long list forces collection after
/// collection while `Acc` stays rooted in a register.
fn builder_module() -> Vec<u8> {
    let mut image = ModuleImage::new(&["builder", "run", "erlang", "-"]);
    let minus = image.import("erlang", "-", 2);
    image.export("run", 3, 2);

    let mut asm = Assembler::new();
    asm.label(1);
    asm.op(Opcode::FuncInfo).atom(1).atom(2).untagged(3);
    asm.label(2);
    asm.op(Opcode::IsEqExact).untagged(3).x(1).int(0);
    asm.op(Opcode::Move).x(2).x(1);
    asm.op(Opcode::Send);
    asm.op(Opcode::Return);
    asm.label(3);
    asm.op(Opcode::TestHeap).untagged(2).untagged(3);
    asm.op(Opcode::PutList).x(1).x(2).x(2);
    asm.op(Opcode::GcBif2)
        .untagged(0)
        .untagged(3)
        .untagged(minus)
        .x(1)
        .int(1)
        .x(1);
    asm.op(Opcode::CallOnly).untagged(3).untagged(2);
    asm.op(Opcode::IntCodeEnd);
    image.build(asm)
}

#[test]
fn long_lists_survive_repeated_collections() {
    const LEN: i64 = 2000;
    let mut machine = Machine::new();
    machine.load_module(&builder_module()).expect("loads");
    let sink = spawn_sink(&mut machine);
    machine
        .spawn(
            "builder",
            "run",
            &[Value::Pid(sink), Value::Int(LEN), Value::nil()],
        )
        .expect("spawns");
    machine.run().expect("runs");

    let expected = Value::List((1..=LEN).map(Value::Int).collect());
    assert_eq!(drain(&machine, sink), vec![expected]);
}

#[test]
fn deep_structures_survive_collections() {
    // Nested tuples rooted in a register across collections.
    let mut machine = Machine::new();
    machine.load_module(&builder_module()).expect("loads");
    let sink = spawn_sink(&mut machine);
    let nested = Value::Tuple(vec![
        Value::Tuple(vec![Value::Int(1), Value::Binary(vec![9; 40])]),
        Value::List(vec![Value::atom("x"), Value::Int(1 << 61)]),
    ]);
    machine
        .spawn(
            "builder",
            "run",
            &[Value::Pid(sink), Value::Int(500), nested.clone()],
        )
        .expect("spawns");
    machine.run().expect("runs");

    // Acc = [500, 499, ... 1 | nested]; verify head and the preserved
    // tail structure.
    let out = drain(&machine, sink);
    assert_eq!(out.len(), 1);
    let Value::ImproperList(items, tail) = &out[0] else {
        panic!("expected an improper list, got {:?}", out[0]);
    };
    assert_eq!(items.len(), 500);
    assert_eq!(items[0], Value::Int(1));
    assert_eq!(**tail, nested);
}

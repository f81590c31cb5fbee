//! Reduction-counted preemption: two busy processes must interleave
//! within a bounded window, neither monopolizing the scheduler.

use plume_asm::encode::Assembler;
use plume_asm::Opcode;
use plume_vm::{Machine, Value};

mod common;
use common::{drain, spawn_sink, ModuleImage};

/// `chatter(Sink, N, Tag)` sends `Tag` to `Sink` N times, one send per
/// loop iteration.
fn chatter_module() -> Vec<u8> {
    let mut image = ModuleImage::new(&["chatter", "run", "erlang", "-"]);
    let minus = image.import("erlang", "-", 2);
    image.export("run", 3, 2);

    let mut asm = Assembler::new();
    asm.label(1);
    asm.op(Opcode::FuncInfo).atom(1).atom(2).untagged(3);
    asm.label(2);
    asm.op(Opcode::IsEqExact).untagged(3).x(1).int(0);
    asm.op(Opcode::Return);
    asm.label(3);
    asm.op(Opcode::Move).x(1).x(3); // save N
    asm.op(Opcode::Move).x(0).x(4); // save Sink
    asm.op(Opcode::Move).x(2).x(1); // message = Tag
    asm.op(Opcode::Send);
    asm.op(Opcode::Move).x(4).x(0); // restore Sink
    asm.op(Opcode::GcBif2)
        .untagged(0)
        .untagged(5)
        .untagged(minus)
        .x(3)
        .int(1)
        .x(1);
    asm.op(Opcode::CallOnly).untagged(3).untagged(2);
    asm.op(Opcode::IntCodeEnd);
    image.build(asm)
}

#[test]
fn busy_processes_interleave_within_a_quantum() {
    const SENDS: i64 = 1500;
    let mut machine = Machine::new();
    machine.load_module(&chatter_module()).expect("loads");
    let sink = spawn_sink(&mut machine);
    machine
        .spawn(
            "chatter",
            "run",
            &[Value::Pid(sink), Value::Int(SENDS), Value::atom("a")],
        )
        .expect("spawns");
    machine
        .spawn(
            "chatter",
            "run",
            &[Value::Pid(sink), Value::Int(SENDS), Value::atom("b")],
        )
        .expect("spawns");
    machine.run().expect("runs");

    let messages = drain(&machine, sink);
    assert_eq!(messages.len(), (SENDS * 2) as usize);

    // With a quantum of 1024 reductions, neither process can emit more
    // than a quantum's worth of messages before the other runs.
    let window = &messages[..1100];
    assert!(
        window.contains(&Value::atom("a")) && window.contains(&Value::atom("b")),
        "first window is single-sided: the scheduler is not preempting"
    );

    // Total counts are balanced.
    let a_count = messages.iter().filter(|m| **m == Value::atom("a")).count();
    assert_eq!(a_count, SENDS as usize);
}

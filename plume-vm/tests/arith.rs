//! Arithmetic through the GC-BIF call path, including small-integer
//! overflow promotion.

use plume_asm::encode::Assembler;
use plume_asm::Opcode;
use plume_vm::{Machine, Value};

mod common;
use common::{drain, spawn_sink, ModuleImage};

/// `add(Sink, A, B) -> Sink ! A + B.`
fn add_module() -> Vec<u8> {
    let mut image = ModuleImage::new(&["arith", "add", "erlang", "+"]);
    let plus = image.import("erlang", "+", 2);
    image.export("add", 3, 2);

    let mut asm = Assembler::new();
    asm.label(1);
    asm.op(Opcode::FuncInfo).atom(1).atom(2).untagged(3);
    asm.label(2);
    // x1 + x2 -> x1, then send to the sink in x0.
    asm.op(Opcode::GcBif2)
        .untagged(0)
        .untagged(3)
        .untagged(plus)
        .x(1)
        .x(2)
        .x(1);
    asm.op(Opcode::Send);
    asm.op(Opcode::Return);
    asm.op(Opcode::IntCodeEnd);
    image.build(asm)
}

#[test]
fn adds_small_integers() {
    let mut machine = Machine::new();
    machine.load_module(&add_module()).expect("loads");
    let sink = spawn_sink(&mut machine);
    machine
        .spawn("arith", "add", &[Value::Pid(sink), Value::Int(3), Value::Int(4)])
        .expect("spawns");
    machine.run().expect("runs");
    assert_eq!(drain(&machine, sink), vec![Value::Int(7)]);
}

#[test]
fn overflow_promotes_to_a_boxed_integer() {
    const MAX_SMALL: i64 = (1 << 59) - 1;
    let mut machine = Machine::new();
    machine.load_module(&add_module()).expect("loads");
    let sink = spawn_sink(&mut machine);
    machine
        .spawn(
            "arith",
            "add",
            &[Value::Pid(sink), Value::Int(MAX_SMALL), Value::Int(1)],
        )
        .expect("spawns");
    machine.run().expect("runs");
    assert_eq!(drain(&machine, sink), vec![Value::Int(MAX_SMALL + 1)]);
}

#[test]
fn badarith_terminates_the_process() {
    let mut machine = Machine::new();
    machine.load_module(&add_module()).expect("loads");
    let sink = spawn_sink(&mut machine);
    let pid = machine
        .spawn(
            "arith",
            "add",
            &[Value::Pid(sink), Value::atom("ok"), Value::Int(1)],
        )
        .expect("spawns");
    machine.run().expect("runs");
    assert!(drain(&machine, sink).is_empty());
    assert_eq!(
        machine.exit_reason(pid),
        Some(&Value::Tuple(vec![Value::atom("badarith"), Value::nil()]))
    );
}

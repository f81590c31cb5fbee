//! Bitstring construction and matching round trips.

use plume_asm::encode::Assembler;
use plume_asm::Opcode;
use plume_vm::{Machine, Value};

mod common;
use common::{drain, etf_binary, spawn_sink, ModuleImage};

/// ```erlang
/// run(Sink) ->
///     Bin = <<171:8, <<1,2,3>>/binary>>,
///     <<V:8, Rest/binary>> = Bin,
///     Sink ! {V, Rest, Bin}.
/// ```
fn roundtrip_module() -> Vec<u8> {
    let mut image = ModuleImage::new(&["bits", "run", "all"]);
    image.export("run", 1, 2);
    image.literals.push(etf_binary(&[1, 2, 3]));

    let mut asm = Assembler::new();
    asm.label(1);
    asm.op(Opcode::FuncInfo).atom(1).atom(2).untagged(1);
    asm.label(2);
    // Build: 4-byte target, one integer byte, then the literal binary.
    asm.op(Opcode::BsInit2)
        .untagged(0)
        .int(4)
        .untagged(0)
        .untagged(0)
        .int(0)
        .x(1);
    asm.op(Opcode::BsPutInteger)
        .untagged(0)
        .int(8)
        .untagged(1)
        .int(0)
        .int(171);
    asm.op(Opcode::Move).literal(0).x(2);
    asm.op(Opcode::BsPutBinary)
        .untagged(0)
        .int(3)
        .untagged(8)
        .int(0)
        .x(2);
    // Match it back.
    asm.op(Opcode::BsStartMatch2)
        .untagged(0)
        .x(1)
        .untagged(0)
        .int(0)
        .x(3);
    asm.op(Opcode::BsGetInteger2)
        .untagged(0)
        .x(3)
        .untagged(0)
        .int(8)
        .untagged(1)
        .int(0)
        .x(4);
    asm.op(Opcode::BsGetBinary2)
        .untagged(0)
        .x(3)
        .untagged(0)
        .atom(3) // 'all'
        .untagged(8)
        .int(0)
        .x(5);
    asm.op(Opcode::PutTuple2).x(1).ext_list(3).x(4).x(5).x(1);
    asm.op(Opcode::Send);
    asm.op(Opcode::Return);
    asm.op(Opcode::IntCodeEnd);
    image.build(asm)
}

#[test]
fn build_then_match_yields_the_parts() {
    let mut machine = Machine::new();
    machine.load_module(&roundtrip_module()).expect("loads");
    let sink = spawn_sink(&mut machine);
    machine
        .spawn("bits", "run", &[Value::Pid(sink)])
        .expect("spawns");
    machine.run().expect("runs");
    assert_eq!(
        drain(&machine, sink),
        vec![Value::Tuple(vec![
            Value::Int(171),
            Value::Binary(vec![1, 2, 3]),
            Value::Binary(vec![171, 1, 2, 3]),
        ])]
    );
}

/// Tail predicates and string matching against the module string pool.
fn match_module() -> Vec<u8> {
    let mut image = ModuleImage::new(&["strmatch", "run", "yes", "no"]);
    image.export("run", 2, 2);
    image.strings = b"hi".to_vec();

    let mut asm = Assembler::new();
    asm.label(1);
    asm.op(Opcode::FuncInfo).atom(1).atom(2).untagged(2);
    asm.label(2);
    asm.op(Opcode::BsStartMatch2)
        .untagged(0)
        .x(1)
        .untagged(0)
        .int(0)
        .x(2);
    asm.op(Opcode::BsMatchString)
        .untagged(4)
        .x(2)
        .untagged(16)
        .untagged(0);
    asm.op(Opcode::BsTestTail2).untagged(4).x(2).untagged(0);
    asm.op(Opcode::Move).atom(3).x(1);
    asm.op(Opcode::Send);
    asm.op(Opcode::Return);
    asm.label(4);
    asm.op(Opcode::Move).atom(4).x(1);
    asm.op(Opcode::Send);
    asm.op(Opcode::Return);
    asm.op(Opcode::IntCodeEnd);
    image.build(asm)
}

#[test]
fn match_string_accepts_the_exact_binary() {
    let mut machine = Machine::new();
    machine.load_module(&match_module()).expect("loads");
    let sink = spawn_sink(&mut machine);
    machine
        .spawn(
            "strmatch",
            "run",
            &[Value::Pid(sink), Value::Binary(b"hi".to_vec())],
        )
        .expect("spawns");
    machine.run().expect("runs");
    assert_eq!(drain(&machine, sink), vec![Value::atom("yes")]);
}

#[test]
fn match_string_rejects_other_bytes_and_longer_tails() {
    for bytes in [b"ho".to_vec(), b"hi!".to_vec()] {
        let mut machine = Machine::new();
        machine.load_module(&match_module()).expect("loads");
        let sink = spawn_sink(&mut machine);
        machine
            .spawn("strmatch", "run", &[Value::Pid(sink), Value::Binary(bytes)])
            .expect("spawns");
        machine.run().expect("runs");
        assert_eq!(drain(&machine, sink), vec![Value::atom("no")]);
    }
}

/// A non-binary source takes the fail label of `bs_start_match2` with
/// the source written back.
fn not_a_binary_module() -> Vec<u8> {
    let mut image = ModuleImage::new(&["nobin", "run", "not_binary"]);
    image.export("run", 2, 2);

    let mut asm = Assembler::new();
    asm.label(1);
    asm.op(Opcode::FuncInfo).atom(1).atom(2).untagged(2);
    asm.label(2);
    asm.op(Opcode::BsStartMatch2)
        .untagged(3)
        .x(1)
        .untagged(0)
        .int(0)
        .x(1);
    asm.op(Opcode::Return);
    asm.label(3);
    asm.op(Opcode::Send);
    asm.op(Opcode::Return);
    asm.op(Opcode::IntCodeEnd);
    image.build(asm)
}

#[test]
fn start_match_on_a_non_binary_branches_with_the_source() {
    let mut machine = Machine::new();
    machine.load_module(&not_a_binary_module()).expect("loads");
    let sink = spawn_sink(&mut machine);
    machine
        .spawn("nobin", "run", &[Value::Pid(sink), Value::Int(17)])
        .expect("spawns");
    machine.run().expect("runs");
    assert_eq!(drain(&machine, sink), vec![Value::Int(17)]);
}

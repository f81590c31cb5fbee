//! Map update instructions over literal maps.

use plume_asm::encode::Assembler;
use plume_asm::Opcode;
use plume_vm::{Machine, Value};

mod common;
use common::{drain, etf_atom_map, spawn_sink, ModuleImage};

/// `run(Sink) -> Sink ! maps:put-ish(#{a => 1, b => 2})`, then dies on
/// an exact update of a missing key.
fn maps_module() -> Vec<u8> {
    let mut image = ModuleImage::new(&["mapper", "run", "a", "b", "c"]);
    image.export("run", 1, 2);
    image.literals.push(etf_atom_map(&[("a", 1), ("b", 2)]));

    let mut asm = Assembler::new();
    asm.label(1);
    asm.op(Opcode::FuncInfo).atom(1).atom(2).untagged(1);
    asm.label(2);
    asm.op(Opcode::Allocate).untagged(1).untagged(1);
    asm.op(Opcode::Move).x(0).y(0);
    // x1 = literal map, x2 = map#{c => 3} via assoc.
    asm.op(Opcode::Move).literal(0).x(1);
    asm.op(Opcode::PutMapAssoc)
        .untagged(0)
        .x(1)
        .x(2)
        .untagged(2)
        .ext_list(2)
        .atom(5)
        .int(3);
    asm.op(Opcode::Move).x(2).x(1);
    asm.op(Opcode::Move).y(0).x(0);
    asm.op(Opcode::Send);
    // Exact update of the original map with the missing key c: badarg.
    asm.op(Opcode::Move).literal(0).x(3);
    asm.op(Opcode::PutMapExact)
        .untagged(0)
        .x(3)
        .x(4)
        .untagged(4)
        .ext_list(2)
        .atom(5)
        .int(3);
    asm.op(Opcode::Deallocate).untagged(1);
    asm.op(Opcode::Return);
    asm.op(Opcode::IntCodeEnd);
    image.build(asm)
}

#[test]
fn assoc_adds_and_exact_rejects_new_keys() {
    let mut machine = Machine::new();
    machine.load_module(&maps_module()).expect("loads");
    let sink = spawn_sink(&mut machine);
    let pid = machine
        .spawn("mapper", "run", &[Value::Pid(sink)])
        .expect("spawns");
    machine.run().expect("runs");

    assert_eq!(
        drain(&machine, sink),
        vec![Value::Map(vec![
            (Value::atom("a"), Value::Int(1)),
            (Value::atom("b"), Value::Int(2)),
            (Value::atom("c"), Value::Int(3)),
        ])]
    );
    assert_eq!(
        machine.exit_reason(pid),
        Some(&Value::Tuple(vec![Value::atom("badarg"), Value::nil()]))
    );
}

/// Exact updates of an existing key share the keys tuple and replace
/// the value.
fn exact_update_module() -> Vec<u8> {
    let mut image = ModuleImage::new(&["exact", "run", "a", "b"]);
    image.export("run", 1, 2);
    image.literals.push(etf_atom_map(&[("a", 1), ("b", 2)]));

    let mut asm = Assembler::new();
    asm.label(1);
    asm.op(Opcode::FuncInfo).atom(1).atom(2).untagged(1);
    asm.label(2);
    asm.op(Opcode::Move).literal(0).x(1);
    asm.op(Opcode::PutMapExact)
        .untagged(0)
        .x(1)
        .x(1)
        .untagged(2)
        .ext_list(2)
        .atom(4)
        .int(9);
    asm.op(Opcode::Send);
    asm.op(Opcode::Return);
    asm.op(Opcode::IntCodeEnd);
    image.build(asm)
}

#[test]
fn exact_replaces_existing_values() {
    let mut machine = Machine::new();
    machine.load_module(&exact_update_module()).expect("loads");
    let sink = spawn_sink(&mut machine);
    machine
        .spawn("exact", "run", &[Value::Pid(sink)])
        .expect("spawns");
    machine.run().expect("runs");
    assert_eq!(
        drain(&machine, sink),
        vec![Value::Map(vec![
            (Value::atom("a"), Value::Int(1)),
            (Value::atom("b"), Value::Int(9)),
        ])]
    );
}

/// `get_map_elements` fetches by key; `has_map_fields` branches on
/// missing keys.
fn query_module() -> Vec<u8> {
    let mut image = ModuleImage::new(&["query", "run", "a", "b", "missing", "absent"]);
    image.export("run", 1, 2);
    image.literals.push(etf_atom_map(&[("a", 1), ("b", 2)]));

    let mut asm = Assembler::new();
    asm.label(1);
    asm.op(Opcode::FuncInfo).atom(1).atom(2).untagged(1);
    asm.label(2);
    asm.op(Opcode::Move).literal(0).x(2);
    asm.op(Opcode::HasMapFields)
        .untagged(3)
        .x(2)
        .ext_list(1)
        .atom(5);
    // Unreachable: `missing` is not a key.
    asm.op(Opcode::Return);
    asm.label(3);
    asm.op(Opcode::GetMapElements)
        .untagged(4)
        .x(2)
        .ext_list(2)
        .atom(4)
        .x(1);
    asm.op(Opcode::Send);
    asm.op(Opcode::Return);
    asm.label(4);
    asm.op(Opcode::Move).atom(6).x(1);
    asm.op(Opcode::Send);
    asm.op(Opcode::Return);
    asm.op(Opcode::IntCodeEnd);
    image.build(asm)
}

#[test]
fn map_queries_branch_and_fetch() {
    let mut machine = Machine::new();
    machine.load_module(&query_module()).expect("loads");
    let sink = spawn_sink(&mut machine);
    machine
        .spawn("query", "run", &[Value::Pid(sink)])
        .expect("spawns");
    machine.run().expect("runs");
    // has_map_fields(missing) jumped to label 3; get_map_elements(b)
    // fetched 2.
    assert_eq!(drain(&machine, sink), vec![Value::Int(2)]);
}

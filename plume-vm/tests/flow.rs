//! Tail calls and reduction-counted scheduling: a long countdown must
//! run in constant stack and still terminate.

use plume_vm::{Machine, Value};

mod common;
use common::{count_module, drain, spawn_sink};

#[test]
fn counts_a_long_way_down_in_constant_stack() {
    const ITERATIONS: i64 = 200_000;
    let mut machine = Machine::new();
    machine.load_module(&count_module()).expect("loads");
    let sink = spawn_sink(&mut machine);
    machine
        .spawn(
            "flow",
            "count",
            &[Value::Pid(sink), Value::Int(ITERATIONS), Value::Int(0)],
        )
        .expect("spawns");
    machine.run().expect("runs");
    assert_eq!(drain(&machine, sink), vec![Value::Int(ITERATIONS)]);
}

#[test]
fn zero_iterations_reports_the_accumulator() {
    let mut machine = Machine::new();
    machine.load_module(&count_module()).expect("loads");
    let sink = spawn_sink(&mut machine);
    machine
        .spawn(
            "flow",
            "count",
            &[Value::Pid(sink), Value::Int(0), Value::Int(41)],
        )
        .expect("spawns");
    machine.run().expect("runs");
    assert_eq!(drain(&machine, sink), vec![Value::Int(41)]);
}

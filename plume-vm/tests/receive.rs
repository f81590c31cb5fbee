//! Receive semantics: FIFO delivery, the save buffer, and timeouts.

use plume_asm::encode::Assembler;
use plume_asm::Opcode;
use plume_vm::{Machine, Value};

mod common;
use common::{drain, spawn_sink, ModuleImage};

/// `fwd(Sink)` forwards every message it ever receives to `Sink`.
fn forwarder_module() -> Vec<u8> {
    let mut image = ModuleImage::new(&["fwd", "run"]);
    image.export("run", 1, 2);

    let mut asm = Assembler::new();
    asm.label(1);
    asm.op(Opcode::FuncInfo).atom(1).atom(2).untagged(1);
    asm.label(2);
    asm.op(Opcode::Allocate).untagged(1).untagged(1);
    asm.op(Opcode::Move).x(0).y(0);
    asm.label(3);
    asm.op(Opcode::LoopRec).untagged(5).x(0);
    asm.op(Opcode::RemoveMessage);
    asm.op(Opcode::Move).x(0).x(1);
    asm.op(Opcode::Move).y(0).x(0);
    asm.op(Opcode::Send);
    asm.op(Opcode::Jump).untagged(3);
    asm.label(5);
    asm.op(Opcode::Wait).untagged(3);
    asm.op(Opcode::IntCodeEnd);
    image.build(asm)
}

#[test]
fn messages_arrive_in_send_order() {
    let mut machine = Machine::new();
    machine.load_module(&forwarder_module()).expect("loads");
    let sink = spawn_sink(&mut machine);
    let fwd = machine
        .spawn("fwd", "run", &[Value::Pid(sink)])
        .expect("spawns");
    for n in 1..=5 {
        machine.send(fwd, &Value::Int(n));
    }
    machine.run().expect("runs");
    assert_eq!(
        drain(&machine, sink),
        (1..=5).map(Value::Int).collect::<Vec<_>>()
    );
}

/// ```erlang
/// pick(Sink) ->
///     receive 2 -> ok end,
///     receive Next -> Sink ! Next end.
/// ```
/// Skipping message 1 to match 2 must leave 1 at the head afterwards.
fn selective_module() -> Vec<u8> {
    let mut image = ModuleImage::new(&["pick", "run"]);
    image.export("run", 1, 2);

    let mut asm = Assembler::new();
    asm.label(1);
    asm.op(Opcode::FuncInfo).atom(1).atom(2).untagged(1);
    asm.label(2);
    asm.op(Opcode::Allocate).untagged(1).untagged(1);
    asm.op(Opcode::Move).x(0).y(0);
    asm.label(3);
    asm.op(Opcode::LoopRec).untagged(5).x(0);
    asm.op(Opcode::IsEqExact).untagged(4).x(0).int(2);
    asm.op(Opcode::RemoveMessage);
    asm.op(Opcode::Jump).untagged(6);
    asm.label(4);
    asm.op(Opcode::LoopRecEnd).untagged(3);
    asm.label(5);
    asm.op(Opcode::Wait).untagged(3);
    // Second receive: take whatever is at the head now.
    asm.label(6);
    asm.op(Opcode::LoopRec).untagged(8).x(0);
    asm.op(Opcode::RemoveMessage);
    asm.op(Opcode::Move).x(0).x(1);
    asm.op(Opcode::Move).y(0).x(0);
    asm.op(Opcode::Send);
    asm.op(Opcode::Deallocate).untagged(1);
    asm.op(Opcode::Return);
    asm.label(8);
    asm.op(Opcode::Wait).untagged(6);
    asm.op(Opcode::IntCodeEnd);
    image.build(asm)
}

#[test]
fn skipped_message_returns_to_the_head() {
    let mut machine = Machine::new();
    machine.load_module(&selective_module()).expect("loads");
    let sink = spawn_sink(&mut machine);
    let pick = machine
        .spawn("pick", "run", &[Value::Pid(sink)])
        .expect("spawns");
    machine.send(pick, &Value::Int(1));
    machine.send(pick, &Value::Int(2));
    machine.run().expect("runs");
    // 1 was skipped while matching 2; the second receive must see it.
    assert_eq!(drain(&machine, sink), vec![Value::Int(1)]);
}

/// ```erlang
/// within(Sink) ->
///     receive X -> Sink ! X after 50 -> Sink ! timeout end.
/// ```
fn timeout_module() -> Vec<u8> {
    let mut image = ModuleImage::new(&["within", "run", "timeout"]);
    image.export("run", 1, 2);

    let mut asm = Assembler::new();
    asm.label(1);
    asm.op(Opcode::FuncInfo).atom(1).atom(2).untagged(1);
    asm.label(2);
    asm.op(Opcode::Allocate).untagged(1).untagged(1);
    asm.op(Opcode::Move).x(0).y(0);
    asm.label(3);
    asm.op(Opcode::LoopRec).untagged(5).x(0);
    asm.op(Opcode::RemoveMessage);
    asm.op(Opcode::Move).x(0).x(1);
    asm.op(Opcode::Jump).untagged(6);
    asm.label(5);
    asm.op(Opcode::WaitTimeout).untagged(3).int(50);
    asm.op(Opcode::Timeout);
    asm.op(Opcode::Move).atom(3).x(1);
    asm.label(6);
    asm.op(Opcode::Move).y(0).x(0);
    asm.op(Opcode::Send);
    asm.op(Opcode::Deallocate).untagged(1);
    asm.op(Opcode::Return);
    asm.op(Opcode::IntCodeEnd);
    image.build(asm)
}

#[test]
fn receive_after_takes_the_message_when_one_is_queued() {
    let mut machine = Machine::new();
    machine.load_module(&timeout_module()).expect("loads");
    let sink = spawn_sink(&mut machine);
    let pid = machine
        .spawn("within", "run", &[Value::Pid(sink)])
        .expect("spawns");
    machine.send(pid, &Value::atom("hi"));
    machine.run().expect("runs");
    assert_eq!(drain(&machine, sink), vec![Value::atom("hi")]);
}

#[test]
fn receive_after_times_out_with_no_sender() {
    let mut machine = Machine::new();
    machine.load_module(&timeout_module()).expect("loads");
    let sink = spawn_sink(&mut machine);
    machine
        .spawn("within", "run", &[Value::Pid(sink)])
        .expect("spawns");
    let start = std::time::Instant::now();
    machine.run().expect("runs");
    assert!(start.elapsed() >= std::time::Duration::from_millis(50));
    assert_eq!(drain(&machine, sink), vec![Value::atom("timeout")]);
}

#[test]
fn message_arriving_mid_wait_cancels_the_timer() {
    let mut machine = Machine::new();
    machine.load_module(&timeout_module()).expect("loads");
    machine
        .load_module(&common::count_module())
        .expect("loads");
    let sink = spawn_sink(&mut machine);
    let receiver = machine
        .spawn("within", "run", &[Value::Pid(sink)])
        .expect("spawns");
    // The counter burns several quanta, then its result lands in the
    // receiver's mailbox while the receive timer is armed.
    machine
        .spawn(
            "flow",
            "count",
            &[Value::Pid(receiver), Value::Int(5000), Value::Int(0)],
        )
        .expect("spawns");
    machine.run().expect("runs");
    assert_eq!(drain(&machine, sink), vec![Value::Int(5000)]);
}

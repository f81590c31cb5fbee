//! Shared helpers: a thin module-image builder over the assembler, a
//! sink process for observing results, and external-term blobs for
//! literal tables.

// Each integration test pulls the subset it needs.
#![allow(dead_code)]

use plume_asm::beam::Builder;
use plume_asm::encode::Assembler;
use plume_vm::{Machine, Value};

/// Everything needed to assemble one loadable module.
pub struct ModuleImage {
    pub atoms: Vec<&'static str>,
    pub imports: Vec<(u32, u32, u32)>,
    pub exports: Vec<(u32, u32, u32)>,
    pub funs: Vec<(u32, u32, u32, u32, u32, u32)>,
    pub literals: Vec<Vec<u8>>,
    pub strings: Vec<u8>,
}

impl ModuleImage {
    pub fn new(atoms: &[&'static str]) -> Self {
        ModuleImage {
            atoms: atoms.to_vec(),
            imports: Vec::new(),
            exports: Vec::new(),
            funs: Vec::new(),
            literals: Vec::new(),
            strings: Vec::new(),
        }
    }

    /// Local atom index of a name, 1-based as the loader counts them.
    pub fn atom(&self, name: &str) -> u32 {
        self.atoms
            .iter()
            .position(|a| *a == name)
            .map(|i| i as u32 + 1)
            .expect("atom listed")
    }

    /// Adds an import row, returning its table index.
    pub fn import(&mut self, module: &str, function: &str, arity: u32) -> u64 {
        let row = (self.atom(module), self.atom(function), arity);
        self.imports.push(row);
        (self.imports.len() - 1) as u64
    }

    /// Exports `function/arity` at `label`.
    pub fn export(&mut self, function: &str, arity: u32, label: u32) {
        self.exports.push((self.atom(function), arity, label));
    }

    pub fn build(&self, asm: Assembler) -> Vec<u8> {
        let labels = asm.label_count();
        let code = asm.finish();
        let mut builder = Builder::new();
        builder
            .atoms(&self.atoms)
            .code(&code, labels, self.exports.len() as u32)
            .exports(&self.exports)
            .imports(&self.imports)
            .strings(&self.strings);
        if !self.literals.is_empty() {
            builder.literals(&self.literals);
        }
        if !self.funs.is_empty() {
            builder.funs(&self.funs);
        }
        builder.build()
    }
}

/// Loads a module that only waits, accumulating whatever is sent to it,
/// and spawns it. Tests read its mailbox after `run`.
pub fn spawn_sink(machine: &mut Machine) -> u32 {
    let mut image = ModuleImage::new(&["sink", "run"]);
    image.export("run", 0, 2);
    let mut asm = Assembler::new();
    asm.label(1);
    asm.op(plume_asm::Opcode::FuncInfo)
        .atom(1)
        .atom(2)
        .untagged(0);
    asm.label(2);
    asm.op(plume_asm::Opcode::Wait).untagged(2);
    asm.op(plume_asm::Opcode::IntCodeEnd);
    machine.load_module(&image.build(asm)).expect("sink loads");
    machine.spawn("sink", "run", &[]).expect("sink spawns")
}

/// Messages accumulated by a sink, oldest first.
pub fn drain(machine: &Machine, sink: u32) -> Vec<Value> {
    machine.mailbox(sink)
}

/// ```erlang
/// count(To, 0, Acc) -> To ! Acc;
/// count(To, N, Acc) -> count(To, N - 1, Acc + 1).
/// ```
/// The exported entry pushes a frame and leaves through `call_last` so
/// the frame-popping tail call runs once per invocation.
pub fn count_module() -> Vec<u8> {
    use plume_asm::Opcode;

    let mut image = ModuleImage::new(&["flow", "count", "erlang", "+", "-"]);
    let plus = image.import("erlang", "+", 2);
    let minus = image.import("erlang", "-", 2);
    image.export("count", 3, 2);

    let mut asm = Assembler::new();
    asm.label(1);
    asm.op(Opcode::FuncInfo).atom(1).atom(2).untagged(3);
    asm.label(2);
    asm.op(Opcode::Allocate).untagged(0).untagged(3);
    asm.op(Opcode::CallLast).untagged(3).untagged(3).untagged(0);
    asm.label(3);
    asm.op(Opcode::IsEqExact).untagged(4).x(1).int(0);
    asm.op(Opcode::Move).x(2).x(1);
    asm.op(Opcode::Send);
    asm.op(Opcode::Return);
    asm.label(4);
    asm.op(Opcode::GcBif2)
        .untagged(0)
        .untagged(3)
        .untagged(minus)
        .x(1)
        .int(1)
        .x(1);
    asm.op(Opcode::GcBif2)
        .untagged(0)
        .untagged(3)
        .untagged(plus)
        .x(2)
        .int(1)
        .x(2);
    asm.op(Opcode::CallOnly).untagged(3).untagged(3);
    asm.op(Opcode::IntCodeEnd);
    image.build(asm)
}

// ----------------------------------------------------------------------
// External-term blobs for literal tables
// ----------------------------------------------------------------------

pub fn etf_binary(bytes: &[u8]) -> Vec<u8> {
    let mut out = vec![131, 109];
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
    out
}

pub fn etf_small_atom(name: &str) -> Vec<u8> {
    let mut out = vec![119, name.len() as u8];
    out.extend_from_slice(name.as_bytes());
    out
}

/// `#{atom() => small_int()}` with the pairs in the given order.
pub fn etf_atom_map(pairs: &[(&str, u8)]) -> Vec<u8> {
    let mut out = vec![131, 116];
    out.extend_from_slice(&(pairs.len() as u32).to_be_bytes());
    for (name, value) in pairs {
        out.extend_from_slice(&etf_small_atom(name));
        out.push(97);
        out.push(*value);
    }
    out
}

//! The instruction interpreter.
//!
//! One arm per opcode; operands decode in place against the current
//! process and module. Every arm either advances the instruction
//! offset, transfers control, or raises through the shared error path
//! that walks the stack for a catch frame.
//!
//! Any arm that allocates re-decodes source operands afterwards: a
//! collection moves every boxed term, and a decoded `Term` is only valid
//! up to the next allocation point.

use std::sync::Arc;

use plume_asm::compact::{self, Operand};
use plume_asm::Opcode;

use crate::atom::defaults;
use crate::bif::BifImpl;
use crate::bitstring::{self, BsError};
use crate::context::{Context, ProcessFlags};
use crate::error::{ExecError, Exception, VmError};
use crate::global::{GlobalContext, DEFAULT_REDUCTIONS};
use crate::heap::{FunShape, Heap};
use crate::module::{resolve_import, CallTarget, Module};
use crate::term::{self, Term};

/// How a quantum ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    /// Reductions exhausted; the process goes back to the ready queue.
    Yielded,
    /// Blocked in a receive.
    Waiting,
    /// Finished, normally or not; `exit_reason` is set.
    Terminated,
}

enum Flow {
    Continue,
    Yield,
    Wait,
    Terminate,
}

/// Destination register operand: a bank plus an index.
#[derive(Debug, Clone, Copy)]
enum Dest {
    X(usize),
    Y(usize),
}

/// Runs `ctx` for one quantum, starting at its saved position.
pub(crate) fn execute(global: &mut GlobalContext, ctx: &mut Context) -> Result<Outcome, VmError> {
    let mut module = global.module(ctx.saved_module)?;
    let mut i = ctx.saved_ip;
    let mut reductions = DEFAULT_REDUCTIONS;

    loop {
        match step(global, ctx, &mut module, &mut i, &mut reductions) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Yield) => return Ok(Outcome::Yielded),
            Ok(Flow::Wait) => return Ok(Outcome::Waiting),
            Ok(Flow::Terminate) => return Ok(Outcome::Terminated),
            Err(ExecError::Abort(fatal)) => return Err(fatal),
            Err(ExecError::Raise(exception)) => {
                if !handle_error(global, ctx, &mut module, &mut i, exception)? {
                    return Ok(Outcome::Terminated);
                }
            }
        }
    }
}

// ----------------------------------------------------------------------
// Operand helpers
// ----------------------------------------------------------------------

fn decode_label(module: &Module, pos: &mut usize) -> Result<u32, ExecError> {
    Ok(compact::decode_label(module.code(), pos)?)
}

fn decode_uint(module: &Module, pos: &mut usize) -> Result<u64, ExecError> {
    let at = *pos;
    match compact::decode_operand(module.code(), pos)? {
        Operand::Untagged(v) => Ok(v),
        Operand::Integer(v) if v >= 0 => Ok(v as u64),
        _ => Err(compact::OperandError::KindMismatch(at).into()),
    }
}

/// An allocation amount: a plain word count or an alloc list.
fn decode_alloc(module: &Module, pos: &mut usize) -> Result<usize, ExecError> {
    const FLOAT_WORDS: u64 = 2;
    const FUN_WORDS: u64 = 3;
    let at = *pos;
    match compact::decode_operand(module.code(), pos)? {
        Operand::Untagged(v) => Ok(v as usize),
        Operand::Alloc(list) => {
            Ok((list.words + list.floats * FLOAT_WORDS + list.funs * FUN_WORDS) as usize)
        }
        _ => Err(compact::OperandError::KindMismatch(at).into()),
    }
}

fn decode_atom_index(module: &Module, pos: &mut usize) -> Result<u32, ExecError> {
    Ok(compact::decode_atom_index(module.code(), pos)?)
}

fn decode_dest(module: &Module, pos: &mut usize) -> Result<Dest, ExecError> {
    let at = *pos;
    match compact::decode_operand(module.code(), pos)? {
        Operand::XReg(n) if (n as usize) < crate::context::X_REGS => Ok(Dest::X(n as usize)),
        Operand::XReg(_) => Err(VmError::RegisterRange.into()),
        Operand::YReg(n) => Ok(Dest::Y(n as usize)),
        _ => Err(compact::OperandError::KindMismatch(at).into()),
    }
}

fn read_dest(ctx: &Context, dest: Dest) -> Term {
    match dest {
        Dest::X(n) => ctx.x[n],
        Dest::Y(n) => ctx.heap.y_get(n),
    }
}

fn write_dest(ctx: &mut Context, dest: Dest, value: Term) {
    match dest {
        Dest::X(n) => ctx.x[n] = value,
        Dest::Y(n) => ctx.heap.y_set(n, value),
    }
}

/// Materializes a value operand against the current process and module.
/// Boxed integers and literals land in the fragment space, so decoding
/// never moves live terms.
fn decode_term(
    global: &mut GlobalContext,
    ctx: &mut Context,
    module: &Module,
    pos: &mut usize,
) -> Result<Term, ExecError> {
    let at = *pos;
    match compact::decode_operand(module.code(), pos)? {
        Operand::Untagged(v) => Ok(Term::small(v as i64)),
        Operand::Integer(v) => Ok(ctx.heap.make_int_fragment(v)),
        Operand::Atom(index) => module
            .atom_term(index)
            .ok_or(ExecError::Abort(VmError::MalformedTerm("atom operand"))),
        Operand::XReg(n) if (n as usize) < crate::context::X_REGS => Ok(ctx.x[n as usize]),
        Operand::XReg(_) => Err(VmError::RegisterRange.into()),
        Operand::YReg(n) => Ok(ctx.heap.y_get(n as usize)),
        Operand::Literal(index) => {
            let blob = module
                .literal_blob(index as usize)
                .ok_or(ExecError::Abort(VmError::MalformedTerm("literal index")))?;
            crate::exterm::decode(blob, &mut ctx.heap, &mut global.atoms)
                .map_err(|_| ExecError::Abort(VmError::MalformedTerm("literal")))
        }
        _ => Err(compact::OperandError::KindMismatch(at).into()),
    }
}

fn label_offset(module: &Module, label: u32) -> Result<usize, ExecError> {
    module
        .label_offset(label)
        .ok_or(ExecError::Abort(VmError::MalformedTerm("label")))
}

fn raise(atom: u32) -> ExecError {
    ExecError::Raise(Exception::error_atom(atom))
}

fn oom<T>(result: Result<T, crate::heap::OutOfMemory>) -> Result<T, ExecError> {
    result.map_err(|_| raise(defaults::OUT_OF_MEMORY))
}

/// Builds `{a, b}` with space ensured by the caller.
fn tuple2(heap: &mut Heap, a: Term, b: Term) -> Term {
    let tuple = heap.alloc_tuple(2);
    heap.put_tuple_element(tuple, 0, a);
    heap.put_tuple_element(tuple, 1, b);
    tuple
}

/// Builds `{tag, value}` with space ensured by the caller.
fn error_tuple(heap: &mut Heap, tag: u32, value: Term) -> Term {
    tuple2(heap, Term::atom(tag), value)
}

fn bs_raise(err: BsError) -> ExecError {
    match err {
        BsError::Unsupported => raise(defaults::UNSUPPORTED),
        BsError::Badarg | BsError::Fail => raise(defaults::BADARG),
    }
}

/// Invokes a BIF with arguments taken from the x-registers, the shape
/// used by external calls and `apply`.
fn call_bif_regs(ctx: &mut Context, imp: BifImpl, arity: usize) -> Result<Term, ExecError> {
    let (a0, a1) = (ctx.x[0], ctx.x[1]);
    match (imp, arity) {
        (BifImpl::Bif0(f), 0) => f(ctx).map_err(ExecError::Raise),
        (BifImpl::Bif1(f), 1) => f(ctx, a0).map_err(ExecError::Raise),
        (BifImpl::Bif2(f), 2) => f(ctx, a0, a1).map_err(ExecError::Raise),
        (BifImpl::GcBif1(f), 1) => f(ctx, 0, a0).map_err(ExecError::Raise),
        (BifImpl::GcBif2(f), 2) => f(ctx, 0, a0, a1).map_err(ExecError::Raise),
        _ => Err(VmError::InvalidImport { index: usize::MAX }.into()),
    }
}

/// Restores module and offset from the saved CP; the sentinel CP
/// terminates the process normally.
fn do_return(
    global: &GlobalContext,
    ctx: &mut Context,
    module: &mut Arc<Module>,
    i: &mut usize,
) -> Result<Flow, ExecError> {
    if ctx.cp == Term::CP_SENTINEL {
        ctx.exit_reason = Term::atom(defaults::NORMAL);
        return Ok(Flow::Terminate);
    }
    let (module_index, offset) = Term::cp_parts(ctx.cp);
    if module_index != module.index {
        *module = global.module(module_index).map_err(ExecError::Abort)?;
    }
    *i = offset;
    Ok(Flow::Continue)
}

/// Walks the stack for a catch frame. Returns `true` when control was
/// transferred to a handler; `false` leaves the process terminated with
/// a packaged exit reason.
fn handle_error(
    global: &mut GlobalContext,
    ctx: &mut Context,
    module: &mut Arc<Module>,
    i: &mut usize,
    exception: Exception,
) -> Result<bool, VmError> {
    ctx.x[0] = exception.class;
    ctx.x[1] = exception.reason;

    let mut last_frame = 0usize;
    let mut target = None;
    for (slot, word) in ctx.heap.stack_words().iter().enumerate() {
        if word.is_catch_label() {
            let (module_index, label) = word.catch_label_parts();
            target = Some((last_frame, module_index, label));
            break;
        } else if word.is_cp_word() {
            last_frame = slot + 1;
        }
    }

    if let Some((unwind, module_index, label)) = target {
        let base = ctx.heap.stack_pointer();
        ctx.heap.unwind_to(base + unwind);
        if module_index != module.index {
            *module = global.module(module_index)?;
        }
        *i = module
            .label_offset(label)
            .ok_or(VmError::MalformedTerm("catch label"))?;
        tracing::trace!(pid = ctx.pid, label, "exception caught");
        return Ok(true);
    }

    crate::crash::dump(global, ctx, module, *i);

    // An exit signal terminates with its reason as-is; errors pick up
    // the `{reason, Trace}` packaging and throws become `nocatch`
    // errors.
    if ctx.x[0] == Term::atom(defaults::EXIT) {
        ctx.exit_reason = ctx.x[1];
        return Ok(false);
    }
    let throw = ctx.x[0] == Term::atom(defaults::THROW);
    let words = if throw { 6 } else { 3 };
    if ctx.ensure_free(words).is_err() {
        ctx.exit_reason = Term::atom(defaults::OUT_OF_MEMORY);
        return Ok(false);
    }
    let error_term = if throw {
        error_tuple(&mut ctx.heap, defaults::NOCATCH, ctx.x[1])
    } else {
        ctx.x[1]
    };
    let exit_tuple = ctx.heap.alloc_tuple(2);
    ctx.heap.put_tuple_element(exit_tuple, 0, error_term);
    ctx.heap.put_tuple_element(exit_tuple, 1, Term::NIL);
    ctx.exit_reason = exit_tuple;
    Ok(false)
}

/// Saves the resume position and yields the scheduler quantum.
fn yield_at(ctx: &mut Context, module: &Module, offset: usize) -> Flow {
    ctx.saved_module = module.index;
    ctx.saved_ip = offset;
    ctx.restore_label = None;
    Flow::Yield
}

// ----------------------------------------------------------------------
// Dispatch
// ----------------------------------------------------------------------

#[allow(clippy::too_many_lines)]
fn step(
    global: &mut GlobalContext,
    ctx: &mut Context,
    module: &mut Arc<Module>,
    i: &mut usize,
    reductions: &mut u32,
) -> Result<Flow, ExecError> {
    let byte = *module
        .code()
        .get(*i)
        .ok_or(ExecError::Abort(VmError::UndecodableOpcode {
            opcode: 0,
            offset: *i,
        }))?;
    let op = Opcode::try_from(byte).map_err(|_| {
        ExecError::Abort(VmError::UndecodableOpcode {
            opcode: byte,
            offset: *i,
        })
    })?;
    tracing::trace!(pid = ctx.pid, offset = *i, op = %op, "dispatch");

    let mut pos = *i + 1;

    match op {
        Opcode::Label => {
            decode_label(module, &mut pos)?;
            *i = pos;
        }

        Opcode::FuncInfo => {
            decode_atom_index(module, &mut pos)?;
            decode_atom_index(module, &mut pos)?;
            decode_uint(module, &mut pos)?;
            return Err(raise(defaults::FUNCTION_CLAUSE));
        }

        Opcode::IntCodeEnd => {
            ctx.exit_reason = Term::atom(defaults::NORMAL);
            return Ok(Flow::Terminate);
        }

        Opcode::Call => {
            decode_uint(module, &mut pos)?; // arity
            let label = decode_label(module, &mut pos)?;
            ctx.cp = Term::cp(module.index, pos);
            let target = label_offset(module, label)?;
            *reductions -= 1;
            if *reductions == 0 {
                return Ok(yield_at(ctx, module, target));
            }
            *i = target;
        }

        Opcode::CallLast => {
            decode_uint(module, &mut pos)?; // arity
            let label = decode_label(module, &mut pos)?;
            let n_words = decode_uint(module, &mut pos)? as usize;
            ctx.cp = ctx.heap.frame_pop(n_words);
            let target = label_offset(module, label)?;
            *reductions -= 1;
            if *reductions == 0 {
                return Ok(yield_at(ctx, module, target));
            }
            *i = target;
        }

        Opcode::CallOnly => {
            decode_uint(module, &mut pos)?; // arity
            let label = decode_label(module, &mut pos)?;
            let target = label_offset(module, label)?;
            *reductions -= 1;
            if *reductions == 0 {
                return Ok(yield_at(ctx, module, target));
            }
            *i = target;
        }

        Opcode::CallExt | Opcode::CallExtLast | Opcode::CallExtOnly => {
            let arity = decode_uint(module, &mut pos)? as usize;
            let index = decode_uint(module, &mut pos)? as usize;
            let n_words = if op == Opcode::CallExtLast {
                Some(decode_uint(module, &mut pos)? as usize)
            } else {
                None
            };

            *reductions -= 1;
            if *reductions == 0 {
                // Resume by re-executing this instruction.
                return Ok(yield_at(ctx, module, *i));
            }

            if let Some(n) = n_words {
                ctx.cp = ctx.heap.frame_pop(n);
            }

            let target =
                resolve_import(module, index, global).ok_or_else(|| raise(defaults::UNDEF))?;
            match target {
                CallTarget::Bif(imp) => {
                    let result = call_bif_regs(ctx, imp, arity)?;
                    ctx.x[0] = result;
                    match op {
                        Opcode::CallExt => *i = pos,
                        _ => return do_return(global, ctx, module, i),
                    }
                }
                CallTarget::Nif(f) => {
                    let result = f(global, ctx, arity).map_err(ExecError::Raise)?;
                    ctx.x[0] = result;
                    match op {
                        Opcode::CallExt => *i = pos,
                        _ => return do_return(global, ctx, module, i),
                    }
                }
                CallTarget::Function {
                    module: target_module,
                    label,
                } => {
                    if op == Opcode::CallExt {
                        ctx.cp = Term::cp(module.index, pos);
                    }
                    *module = global.module(target_module).map_err(ExecError::Abort)?;
                    *i = label_offset(module, label)?;
                }
            }
        }

        Opcode::Bif0 => {
            let index = decode_uint(module, &mut pos)? as usize;
            let dest = decode_dest(module, &mut pos)?;
            let entry =
                resolve_import(module, index, global).ok_or_else(|| raise(defaults::UNDEF))?;
            let CallTarget::Bif(BifImpl::Bif0(f)) = entry else {
                return Err(VmError::InvalidImport { index }.into());
            };
            let result = f(ctx).map_err(ExecError::Raise)?;
            write_dest(ctx, dest, result);
            *i = pos;
        }

        Opcode::Bif1 | Opcode::Bif2 => {
            decode_label(module, &mut pos)?; // fail label, unused: errors raise
            let index = decode_uint(module, &mut pos)? as usize;
            let arg1 = decode_term(global, ctx, module, &mut pos)?;
            let arg2 = if op == Opcode::Bif2 {
                Some(decode_term(global, ctx, module, &mut pos)?)
            } else {
                None
            };
            let dest = decode_dest(module, &mut pos)?;
            let entry =
                resolve_import(module, index, global).ok_or_else(|| raise(defaults::UNDEF))?;
            let result = match (entry, arg2) {
                (CallTarget::Bif(BifImpl::Bif1(f)), None) => f(ctx, arg1),
                (CallTarget::Bif(BifImpl::Bif2(f)), Some(arg2)) => f(ctx, arg1, arg2),
                _ => return Err(VmError::InvalidImport { index }.into()),
            }
            .map_err(ExecError::Raise)?;
            write_dest(ctx, dest, result);
            *i = pos;
        }

        Opcode::Allocate | Opcode::AllocateZero => {
            let stack_need = decode_uint(module, &mut pos)? as usize;
            let live = decode_uint(module, &mut pos)? as usize;
            if live > crate::context::X_REGS {
                return Err(VmError::RegisterRange.into());
            }
            ctx.clean_registers(live);
            oom(ctx.ensure_free(stack_need + 1))?;
            ctx.heap
                .frame_push(stack_need, ctx.cp, op == Opcode::AllocateZero);
            *i = pos;
        }

        Opcode::AllocateHeap | Opcode::AllocateHeapZero => {
            let stack_need = decode_alloc(module, &mut pos)?;
            let heap_need = decode_alloc(module, &mut pos)?;
            let live = decode_uint(module, &mut pos)? as usize;
            if live > crate::context::X_REGS {
                return Err(VmError::RegisterRange.into());
            }
            ctx.clean_registers(live);
            oom(ctx.ensure_free(stack_need + heap_need + 1))?;
            ctx.heap
                .frame_push(stack_need, ctx.cp, op == Opcode::AllocateHeapZero);
            *i = pos;
        }

        Opcode::TestHeap => {
            let heap_need = decode_alloc(module, &mut pos)?;
            let live = decode_uint(module, &mut pos)? as usize;
            let free = ctx.heap.free();
            if free < heap_need {
                oom(ctx.ensure_free_with_live(live, heap_need))?;
            } else if free > heap_need.saturating_mul(crate::heap::SHRINK_THRESHOLD_COEFF) {
                oom(ctx.force_collect(live, heap_need * (crate::heap::SHRINK_THRESHOLD_COEFF / 2)))?;
            }
            *i = pos;
        }

        Opcode::Kill => {
            let slot = decode_uint(module, &mut pos)? as usize;
            ctx.heap.y_set(slot, Term::NIL);
            *i = pos;
        }

        Opcode::Deallocate => {
            let n_words = decode_uint(module, &mut pos)? as usize;
            ctx.cp = ctx.heap.frame_pop(n_words);
            *i = pos;
        }

        Opcode::Return => {
            return do_return(global, ctx, module, i);
        }

        Opcode::Send => {
            let to = ctx.x[0];
            if !to.is_pid() {
                return Err(raise(defaults::BADARG));
            }
            global.send(ctx, to.pid_id());
            ctx.x[0] = ctx.x[1];
            *i = pos;
        }

        Opcode::RemoveMessage => {
            if ctx
                .flags
                .intersects(ProcessFlags::WAITING_TIMEOUT | ProcessFlags::WAITING_TIMEOUT_EXPIRED)
            {
                global.cancel_timeout(ctx.pid);
                ctx.flags
                    .remove(ProcessFlags::WAITING_TIMEOUT | ProcessFlags::WAITING_TIMEOUT_EXPIRED);
            }
            ctx.mailbox.remove();
            ctx.mailbox.flush_saved();
            *i = pos;
        }

        Opcode::Timeout => {
            ctx.flags.remove(ProcessFlags::WAITING_TIMEOUT_EXPIRED);
            ctx.mailbox.flush_saved();
            *i = pos;
        }

        Opcode::LoopRec => {
            let label = decode_label(module, &mut pos)?;
            let dest = decode_dest(module, &mut pos)?;
            match ctx.mailbox.peek() {
                None => *i = label_offset(module, label)?,
                Some(message) => {
                    write_dest(ctx, dest, message);
                    *i = pos;
                }
            }
        }

        Opcode::LoopRecEnd => {
            let label = decode_label(module, &mut pos)?;
            ctx.mailbox.skip();
            *i = label_offset(module, label)?;
        }

        Opcode::Wait => {
            let label = decode_label(module, &mut pos)?;
            ctx.saved_module = module.index;
            ctx.saved_ip = label_offset(module, label)?;
            ctx.restore_label = None;
            return Ok(Flow::Wait);
        }

        Opcode::WaitTimeout => {
            let label = decode_label(module, &mut pos)?;
            let timeout = decode_term(global, ctx, module, &mut pos)?;

            let millis = if timeout == Term::atom(defaults::INFINITY) {
                None
            } else if timeout.is_small() && timeout.small_value() >= 0 {
                Some(timeout.small_value() as u64)
            } else {
                return Err(raise(defaults::TIMEOUT_VALUE));
            };

            ctx.saved_module = module.index;
            ctx.saved_ip = pos;
            ctx.restore_label = Some(label);

            let needs_to_wait = if !ctx
                .flags
                .intersects(ProcessFlags::WAITING_TIMEOUT | ProcessFlags::WAITING_TIMEOUT_EXPIRED)
            {
                if let Some(ms) = millis {
                    global.arm_timeout(ctx.pid, ms);
                    ctx.flags.insert(ProcessFlags::WAITING_TIMEOUT);
                }
                true
            } else if !ctx.flags.contains(ProcessFlags::WAITING_TIMEOUT) {
                true
            } else {
                !ctx.mailbox.saved_is_empty()
            };

            if needs_to_wait {
                return Ok(Flow::Wait);
            }
            ctx.restore_label = None;
            *i = pos;
        }

        Opcode::IsLt | Opcode::IsGe => {
            let label = decode_label(module, &mut pos)?;
            let arg1 = decode_term(global, ctx, module, &mut pos)?;
            let arg2 = decode_term(global, ctx, module, &mut pos)?;
            let ordering = term::compare(&ctx.heap, arg1, arg2);
            let pass = match op {
                Opcode::IsLt => ordering == core::cmp::Ordering::Less,
                _ => ordering != core::cmp::Ordering::Less,
            };
            if pass {
                *i = pos;
            } else {
                *i = label_offset(module, label)?;
            }
        }

        Opcode::IsEq | Opcode::IsNe | Opcode::IsEqExact | Opcode::IsNeExact => {
            let label = decode_label(module, &mut pos)?;
            let arg1 = decode_term(global, ctx, module, &mut pos)?;
            let arg2 = decode_term(global, ctx, module, &mut pos)?;
            let equal = match op {
                Opcode::IsEq | Opcode::IsNe => term::equals(&ctx.heap, arg1, arg2),
                _ => term::exactly_equals(&ctx.heap, arg1, arg2),
            };
            let pass = match op {
                Opcode::IsEq | Opcode::IsEqExact => equal,
                _ => !equal,
            };
            if pass {
                *i = pos;
            } else {
                *i = label_offset(module, label)?;
            }
        }

        Opcode::IsInteger
        | Opcode::IsFloat
        | Opcode::IsNumber
        | Opcode::IsAtom
        | Opcode::IsPid
        | Opcode::IsReference
        | Opcode::IsPort
        | Opcode::IsNil
        | Opcode::IsBinary
        | Opcode::IsList
        | Opcode::IsNonemptyList
        | Opcode::IsTuple
        | Opcode::IsBoolean
        | Opcode::IsMap
        | Opcode::IsFunction
        | Opcode::IsBitstr => {
            let label = decode_label(module, &mut pos)?;
            let arg = decode_term(global, ctx, module, &mut pos)?;
            let pass = match op {
                Opcode::IsInteger => ctx.heap.is_any_int(arg),
                Opcode::IsFloat => ctx.heap.is_float(arg),
                Opcode::IsNumber => ctx.heap.is_number(arg),
                Opcode::IsAtom => arg.is_atom(),
                Opcode::IsPid => arg.is_pid(),
                Opcode::IsReference => ctx.heap.is_ref(arg),
                // No port drivers exist in this machine.
                Opcode::IsPort => false,
                Opcode::IsNil => arg.is_nil(),
                Opcode::IsBinary => ctx.heap.is_binary(arg),
                Opcode::IsList => arg.is_list(),
                Opcode::IsNonemptyList => arg.is_list_cell(),
                Opcode::IsTuple => ctx.heap.is_tuple(arg),
                Opcode::IsBoolean => arg.is_boolean(),
                Opcode::IsMap => ctx.heap.is_map(arg),
                Opcode::IsFunction => ctx.heap.is_function(arg),
                // Stub preserved from the reference: always false.
                Opcode::IsBitstr => false,
                _ => unreachable!(),
            };
            if pass {
                *i = pos;
            } else {
                *i = label_offset(module, label)?;
            }
        }

        Opcode::TestArity => {
            let label = decode_label(module, &mut pos)?;
            let arg = decode_term(global, ctx, module, &mut pos)?;
            let arity = decode_uint(module, &mut pos)? as usize;
            if ctx.heap.is_tuple(arg) && ctx.heap.tuple_arity(arg) == arity {
                *i = pos;
            } else {
                *i = label_offset(module, label)?;
            }
        }

        Opcode::SelectVal => {
            let src = decode_term(global, ctx, module, &mut pos)?;
            let default = decode_label(module, &mut pos)?;
            let pairs = decode_list_header(module, &mut pos)? / 2;
            let mut chosen = None;
            for _ in 0..pairs {
                let candidate = decode_term(global, ctx, module, &mut pos)?;
                let label = decode_label(module, &mut pos)?;
                if chosen.is_none() && candidate == src {
                    chosen = Some(label);
                }
            }
            *i = label_offset(module, chosen.unwrap_or(default))?;
        }

        Opcode::SelectTupleArity => {
            let src = decode_term(global, ctx, module, &mut pos)?;
            let default = decode_label(module, &mut pos)?;
            let pairs = decode_list_header(module, &mut pos)? / 2;
            let mut chosen = None;
            if ctx.heap.is_tuple(src) {
                let arity = ctx.heap.tuple_arity(src);
                for _ in 0..pairs {
                    let candidate = decode_uint(module, &mut pos)? as usize;
                    let label = decode_label(module, &mut pos)?;
                    if chosen.is_none() && candidate == arity {
                        chosen = Some(label);
                    }
                }
            }
            *i = label_offset(module, chosen.unwrap_or(default))?;
        }

        Opcode::Jump => {
            let label = decode_label(module, &mut pos)?;
            let target = label_offset(module, label)?;
            *reductions -= 1;
            if *reductions == 0 {
                return Ok(yield_at(ctx, module, target));
            }
            *i = target;
        }

        Opcode::Move => {
            let src = decode_term(global, ctx, module, &mut pos)?;
            let dest = decode_dest(module, &mut pos)?;
            write_dest(ctx, dest, src);
            *i = pos;
        }

        Opcode::GetList => {
            let src = decode_term(global, ctx, module, &mut pos)?;
            let head_dest = decode_dest(module, &mut pos)?;
            let tail_dest = decode_dest(module, &mut pos)?;
            if !src.is_list_cell() {
                return Err(VmError::MalformedTerm("get_list").into());
            }
            let head = ctx.heap.list_head(src);
            let tail = ctx.heap.list_tail(src);
            write_dest(ctx, head_dest, head);
            write_dest(ctx, tail_dest, tail);
            *i = pos;
        }

        Opcode::GetHd | Opcode::GetTl => {
            let src = decode_term(global, ctx, module, &mut pos)?;
            let dest = decode_dest(module, &mut pos)?;
            if !src.is_list_cell() {
                return Err(VmError::MalformedTerm("get_hd/get_tl").into());
            }
            let value = if op == Opcode::GetHd {
                ctx.heap.list_head(src)
            } else {
                ctx.heap.list_tail(src)
            };
            write_dest(ctx, dest, value);
            *i = pos;
        }

        Opcode::GetTupleElement => {
            let src = decode_term(global, ctx, module, &mut pos)?;
            let element = decode_uint(module, &mut pos)? as usize;
            let dest = decode_dest(module, &mut pos)?;
            if !ctx.heap.is_tuple(src) || element >= ctx.heap.tuple_arity(src) {
                return Err(VmError::MalformedTerm("get_tuple_element").into());
            }
            let value = ctx.heap.tuple_element(src, element);
            write_dest(ctx, dest, value);
            *i = pos;
        }

        Opcode::SetTupleElement => {
            let value = decode_term(global, ctx, module, &mut pos)?;
            let tuple = decode_term(global, ctx, module, &mut pos)?;
            let position = decode_uint(module, &mut pos)? as usize;
            if !ctx.heap.is_tuple(tuple) || position >= ctx.heap.tuple_arity(tuple) {
                return Err(VmError::MalformedTerm("set_tuple_element").into());
            }
            ctx.heap.put_tuple_element(tuple, position, value);
            *i = pos;
        }

        Opcode::PutList => {
            let args_at = pos;
            let mut head = decode_term(global, ctx, module, &mut pos)?;
            let mut tail = decode_term(global, ctx, module, &mut pos)?;
            let dest = decode_dest(module, &mut pos)?;
            if ctx.heap.free() < 2 {
                oom(ctx.ensure_free(2))?;
                let mut again = args_at;
                head = decode_term(global, ctx, module, &mut again)?;
                tail = decode_term(global, ctx, module, &mut again)?;
            }
            let cell = ctx.heap.cons(head, tail);
            write_dest(ctx, dest, cell);
            *i = pos;
        }

        Opcode::PutTuple => {
            let size = decode_uint(module, &mut pos)? as usize;
            let dest = decode_dest(module, &mut pos)?;
            oom(ctx.ensure_free(size + 1))?;
            let tuple = ctx.heap.alloc_tuple(size);
            write_dest(ctx, dest, tuple);
            for slot in 0..size {
                let byte = *module
                    .code()
                    .get(pos)
                    .ok_or(ExecError::Abort(VmError::MalformedTerm("put_tuple")))?;
                if byte != Opcode::Put as u8 {
                    return Err(VmError::UndecodableOpcode {
                        opcode: byte,
                        offset: pos,
                    }
                    .into());
                }
                pos += 1;
                let value = decode_term(global, ctx, module, &mut pos)?;
                ctx.heap.put_tuple_element(tuple, slot, value);
            }
            *i = pos;
        }

        Opcode::PutTuple2 => {
            let dest = decode_dest(module, &mut pos)?;
            let size = decode_list_header(module, &mut pos)?;
            oom(ctx.ensure_free(size + 1))?;
            let tuple = ctx.heap.alloc_tuple(size);
            for slot in 0..size {
                let value = decode_term(global, ctx, module, &mut pos)?;
                ctx.heap.put_tuple_element(tuple, slot, value);
            }
            write_dest(ctx, dest, tuple);
            *i = pos;
        }

        Opcode::Swap => {
            let a = decode_dest(module, &mut pos)?;
            let b = decode_dest(module, &mut pos)?;
            let (va, vb) = (read_dest(ctx, a), read_dest(ctx, b));
            write_dest(ctx, a, vb);
            write_dest(ctx, b, va);
            *i = pos;
        }

        Opcode::Badmatch | Opcode::CaseEnd | Opcode::TryCaseEnd => {
            oom(ctx.ensure_free(3))?;
            let arg = decode_term(global, ctx, module, &mut pos)?;
            let tag = match op {
                Opcode::Badmatch => defaults::BADMATCH,
                Opcode::CaseEnd => defaults::CASE_CLAUSE,
                _ => defaults::TRY_CLAUSE,
            };
            let reason = error_tuple(&mut ctx.heap, tag, arg);
            return Err(ExecError::Raise(Exception::error(reason)));
        }

        Opcode::IfEnd => {
            return Err(raise(defaults::IF_CLAUSE));
        }

        Opcode::CallFun => {
            let args_count = decode_uint(module, &mut pos)? as usize;
            if args_count >= crate::context::X_REGS {
                return Err(VmError::RegisterRange.into());
            }

            *reductions -= 1;
            if *reductions == 0 {
                return Ok(yield_at(ctx, module, *i));
            }

            let fun = ctx.x[args_count];
            if !ctx.heap.is_function(fun) {
                oom(ctx.ensure_free(3))?;
                let fun = ctx.x[args_count];
                let reason = error_tuple(&mut ctx.heap, defaults::BADFUN, fun);
                return Err(ExecError::Raise(Exception::error(reason)));
            }

            match ctx.heap.fun_shape(fun) {
                FunShape::Named {
                    module_atom,
                    function_atom,
                    arity,
                } => {
                    if args_count != arity {
                        return Err(raise(defaults::BADARITY));
                    }
                    if let Some(nif) = global.nifs.get(module_atom, function_atom, arity as u32) {
                        let result = nif(global, ctx, args_count).map_err(ExecError::Raise)?;
                        ctx.x[0] = result;
                        *i = pos;
                        return Ok(Flow::Continue);
                    }
                    let target = global
                        .module_by_atom(module_atom)
                        .ok_or_else(|| raise(defaults::UNDEF))?;
                    let label = target
                        .search_exported(function_atom, arity as u32)
                        .ok_or_else(|| raise(defaults::UNDEF))?;
                    ctx.cp = Term::cp(module.index, pos);
                    *module = target;
                    *i = label_offset(module, label)?;
                }
                FunShape::Index {
                    module_index,
                    fun_index,
                } => {
                    let target = global.module(module_index).map_err(ExecError::Abort)?;
                    let entry = target
                        .fun_entry(fun_index)
                        .ok_or(ExecError::Abort(VmError::MalformedTerm("fun index")))?;
                    let fun_arity = (entry.total_arity - entry.n_free) as usize;
                    if args_count != fun_arity {
                        return Err(raise(defaults::BADARITY));
                    }
                    for slot in 0..entry.n_free as usize {
                        ctx.x[fun_arity + slot] = ctx.heap.fun_freeze(fun, slot);
                    }
                    ctx.cp = Term::cp(module.index, pos);
                    let label = entry.label;
                    *module = target;
                    *i = label_offset(module, label)?;
                }
            }
        }

        Opcode::IsFunction2 => {
            let label = decode_label(module, &mut pos)?;
            let arg = decode_term(global, ctx, module, &mut pos)?;
            let arity = decode_uint(module, &mut pos)? as usize;
            let pass = if ctx.heap.is_function(arg) {
                match ctx.heap.fun_shape(arg) {
                    FunShape::Named { arity: a, .. } => a == arity,
                    FunShape::Index {
                        module_index,
                        fun_index,
                    } => {
                        let target = global.module(module_index).map_err(ExecError::Abort)?;
                        match target.fun_entry(fun_index) {
                            Some(entry) => (entry.total_arity - entry.n_free) as usize == arity,
                            None => false,
                        }
                    }
                }
            } else {
                false
            };
            if pass {
                *i = pos;
            } else {
                *i = label_offset(module, label)?;
            }
        }

        Opcode::MakeFun2 => {
            let fun_index = decode_uint(module, &mut pos)? as usize;
            let entry = module
                .fun_entry(fun_index)
                .ok_or(ExecError::Abort(VmError::MalformedTerm("fun index")))?;
            let n_free = entry.n_free as usize;
            if n_free > crate::context::X_REGS {
                return Err(VmError::RegisterRange.into());
            }
            oom(ctx.ensure_free(Heap::fun_words(n_free)))?;
            let freeze: Vec<Term> = ctx.x[..n_free].to_vec();
            let fun = ctx.heap.alloc_fun(module.index, fun_index, &freeze);
            ctx.x[0] = fun;
            *i = pos;
        }

        Opcode::Try | Opcode::Catch => {
            let dest = decode_dest(module, &mut pos)?;
            let label = decode_label(module, &mut pos)?;
            let catch = Term::catch_label(module.index, label);
            write_dest(ctx, dest, catch);
            *i = pos;
        }

        Opcode::TryEnd | Opcode::TryCase => {
            let dest = decode_dest(module, &mut pos)?;
            write_dest(ctx, dest, Term::NIL);
            *i = pos;
        }

        Opcode::Raise => {
            let _stacktrace = decode_term(global, ctx, module, &mut pos)?;
            let value = decode_term(global, ctx, module, &mut pos)?;
            return Err(ExecError::Raise(Exception::error(value)));
        }

        Opcode::CatchEnd => {
            let dest = decode_dest(module, &mut pos)?;
            write_dest(ctx, dest, Term::NIL);
            // How the caught value lands in x0 depends on the class.
            if ctx.x[0] == Term::atom(defaults::THROW) {
                ctx.x[0] = ctx.x[1];
            } else if ctx.x[0] == Term::atom(defaults::ERROR) {
                oom(ctx.ensure_free(6))?;
                let reason = tuple2(&mut ctx.heap, ctx.x[1], Term::atom(defaults::UNDEFINED));
                let exit = error_tuple(&mut ctx.heap, defaults::EXIT_TAG, reason);
                ctx.x[0] = exit;
            } else if ctx.x[0] == Term::atom(defaults::EXIT) {
                oom(ctx.ensure_free(3))?;
                let exit = error_tuple(&mut ctx.heap, defaults::EXIT_TAG, ctx.x[1]);
                ctx.x[0] = exit;
            }
            *i = pos;
        }

        Opcode::Apply | Opcode::ApplyLast => {
            let arity = decode_uint(module, &mut pos)? as usize;
            let n_words = if op == Opcode::ApplyLast {
                Some(decode_uint(module, &mut pos)? as usize)
            } else {
                None
            };
            if arity + 1 >= crate::context::X_REGS {
                return Err(VmError::RegisterRange.into());
            }

            *reductions -= 1;
            if *reductions == 0 {
                return Ok(yield_at(ctx, module, *i));
            }

            if let Some(n) = n_words {
                ctx.cp = ctx.heap.frame_pop(n);
            }

            let module_t = ctx.x[arity];
            let function_t = ctx.x[arity + 1];
            if !module_t.is_atom() || !function_t.is_atom() {
                return Err(raise(defaults::BADARG));
            }
            let (m_atom, f_atom) = (module_t.atom_id(), function_t.atom_id());

            if let Some(imp) = global.bifs.get(m_atom, f_atom, arity as u32) {
                let result = call_bif_regs(ctx, imp, arity)?;
                ctx.x[0] = result;
                match op {
                    Opcode::Apply => *i = pos,
                    _ => return do_return(global, ctx, module, i),
                }
            } else if let Some(nif) = global.nifs.get(m_atom, f_atom, arity as u32) {
                let result = nif(global, ctx, arity).map_err(ExecError::Raise)?;
                ctx.x[0] = result;
                match op {
                    Opcode::Apply => *i = pos,
                    _ => return do_return(global, ctx, module, i),
                }
            } else {
                let target = global
                    .module_by_atom(m_atom)
                    .ok_or_else(|| raise(defaults::UNDEF))?;
                let label = target
                    .search_exported(f_atom, arity as u32)
                    .ok_or_else(|| raise(defaults::UNDEF))?;
                if op == Opcode::Apply {
                    ctx.cp = Term::cp(module.index, pos);
                }
                *module = target;
                *i = label_offset(module, label)?;
            }
        }

        Opcode::Trim => {
            let n_words = decode_uint(module, &mut pos)? as usize;
            decode_uint(module, &mut pos)?; // remaining, unused
            ctx.heap.frame_trim(n_words);
            *i = pos;
        }

        // Stubs preserved from the reference implementation.
        Opcode::RecvMark | Opcode::RecvSet => {
            decode_label(module, &mut pos)?;
            *i = pos;
        }

        Opcode::Line => {
            decode_uint(module, &mut pos)?;
            *i = pos;
        }

        Opcode::GcBif1 | Opcode::GcBif2 | Opcode::GcBif3 => {
            decode_label(module, &mut pos)?; // fail label, unused: errors raise
            let live = decode_uint(module, &mut pos)? as usize;
            let index = decode_uint(module, &mut pos)? as usize;
            let arg1 = decode_term(global, ctx, module, &mut pos)?;
            let arg2 = if matches!(op, Opcode::GcBif2 | Opcode::GcBif3) {
                Some(decode_term(global, ctx, module, &mut pos)?)
            } else {
                None
            };
            if op == Opcode::GcBif3 {
                // Reserved shape; no arity-3 GC-BIF is registered today.
                return Err(VmError::InvalidImport { index }.into());
            }
            let dest = decode_dest(module, &mut pos)?;
            let entry =
                resolve_import(module, index, global).ok_or_else(|| raise(defaults::UNDEF))?;
            let result = match (entry, arg2) {
                (CallTarget::Bif(BifImpl::GcBif1(f)), None) => f(ctx, live, arg1),
                (CallTarget::Bif(BifImpl::GcBif2(f)), Some(arg2)) => f(ctx, live, arg1, arg2),
                _ => return Err(VmError::InvalidImport { index }.into()),
            }
            .map_err(ExecError::Raise)?;
            write_dest(ctx, dest, result);
            *i = pos;
        }

        Opcode::IsTaggedTuple => {
            let label = decode_label(module, &mut pos)?;
            let arg = decode_term(global, ctx, module, &mut pos)?;
            let arity = decode_uint(module, &mut pos)? as usize;
            let tag_index = decode_atom_index(module, &mut pos)?;
            let tag = module
                .atom_term(tag_index)
                .ok_or(ExecError::Abort(VmError::MalformedTerm("atom operand")))?;
            let pass = ctx.heap.is_tuple(arg)
                && ctx.heap.tuple_arity(arg) == arity
                && arity > 0
                && ctx.heap.tuple_element(arg, 0) == tag;
            if pass {
                *i = pos;
            } else {
                *i = label_offset(module, label)?;
            }
        }

        Opcode::PutMapAssoc => return put_map_assoc(global, ctx, module, i, pos),
        Opcode::PutMapExact => return put_map_exact(global, ctx, module, i, pos),

        Opcode::HasMapFields => {
            let label = decode_label(module, &mut pos)?;
            let src = decode_term(global, ctx, module, &mut pos)?;
            let count = decode_list_header(module, &mut pos)?;
            for _ in 0..count {
                let key = decode_term(global, ctx, module, &mut pos)?;
                if !ctx.heap.is_map(src) || ctx.heap.find_map_pos(src, key).is_none() {
                    *i = label_offset(module, label)?;
                    return Ok(Flow::Continue);
                }
            }
            *i = pos;
        }

        Opcode::GetMapElements => {
            let label = decode_label(module, &mut pos)?;
            let src = decode_term(global, ctx, module, &mut pos)?;
            let count = decode_list_header(module, &mut pos)? / 2;
            for _ in 0..count {
                let key = decode_term(global, ctx, module, &mut pos)?;
                let dest = decode_dest(module, &mut pos)?;
                let found = if ctx.heap.is_map(src) {
                    ctx.heap.find_map_pos(src, key)
                } else {
                    None
                };
                match found {
                    Some(position) => {
                        let value = ctx.heap.map_value(src, position);
                        write_dest(ctx, dest, value);
                    }
                    None => {
                        *i = label_offset(module, label)?;
                        return Ok(Flow::Continue);
                    }
                }
            }
            *i = pos;
        }

        // Bitstring construction and matching.
        Opcode::BsAdd => {
            decode_label(module, &mut pos)?;
            let src1 = decode_term(global, ctx, module, &mut pos)?;
            let src2 = decode_term(global, ctx, module, &mut pos)?;
            let unit = decode_uint(module, &mut pos)? as i64;
            let dest = decode_dest(module, &mut pos)?;
            if !src1.is_small() || !src2.is_small() {
                return Err(raise(defaults::BADARG));
            }
            let total = (src1.small_value() + src2.small_value()) * unit;
            write_dest(ctx, dest, Term::small(total));
            *i = pos;
        }

        Opcode::BsInit2 | Opcode::BsInitBits => {
            decode_label(module, &mut pos)?;
            let size = decode_term(global, ctx, module, &mut pos)?;
            decode_uint(module, &mut pos)?; // words
            decode_uint(module, &mut pos)?; // regs
            let flags = decode_term(global, ctx, module, &mut pos)?;
            let dest = decode_dest(module, &mut pos)?;
            if !size.is_small() || size.small_value() < 0 {
                return Err(raise(defaults::BADARG));
            }
            let size_bytes = if op == Opcode::BsInitBits {
                if !flags.is_small() {
                    return Err(raise(defaults::BADARG));
                }
                if flags.small_value() != 0 {
                    return Err(raise(defaults::UNSUPPORTED));
                }
                let bits = size.small_value();
                if bits % 8 != 0 {
                    return Err(raise(defaults::UNSUPPORTED));
                }
                (bits / 8) as usize
            } else {
                size.small_value() as usize
            };
            oom(ctx.ensure_free(Heap::binary_words(size_bytes)))?;
            let bin = ctx.heap.alloc_binary(size_bytes);
            ctx.bs = bin;
            ctx.bs_offset = 0;
            write_dest(ctx, dest, bin);
            *i = pos;
        }

        Opcode::BsAppend => {
            decode_label(module, &mut pos)?;
            let size = decode_term(global, ctx, module, &mut pos)?;
            let extra = decode_term(global, ctx, module, &mut pos)?;
            decode_term(global, ctx, module, &mut pos)?; // live
            let unit = decode_uint(module, &mut pos)? as i64;
            let src_at = pos;
            let src = decode_term(global, ctx, module, &mut pos)?;
            decode_term(global, ctx, module, &mut pos)?; // flags
            let dest = decode_dest(module, &mut pos)?;

            if !ctx.heap.is_binary(src) || !size.is_small() || !extra.is_small() {
                return Err(raise(defaults::BADARG));
            }
            let size_bits = size.small_value();
            let extra_words = extra.small_value().max(0) as usize;
            if size_bits % 8 != 0 || unit != 8 {
                return Err(raise(defaults::UNSUPPORTED));
            }
            let src_size = ctx.heap.binary_size(src);
            let total = src_size + (size_bits / 8) as usize;
            oom(ctx.ensure_free(Heap::binary_words(total) + extra_words))?;
            let mut again = src_at;
            let src = decode_term(global, ctx, module, &mut again)?;
            let bytes = ctx.heap.binary_bytes(src);
            let bin = ctx.heap.alloc_binary(total);
            ctx.heap.binary_write(bin, 0, &bytes);
            ctx.bs = bin;
            ctx.bs_offset = src_size * 8;
            write_dest(ctx, dest, bin);
            *i = pos;
        }

        Opcode::BsPutInteger => {
            decode_label(module, &mut pos)?;
            let size = decode_term(global, ctx, module, &mut pos)?;
            let unit = decode_uint(module, &mut pos)? as i64;
            let flags = decode_term(global, ctx, module, &mut pos)?;
            let src = decode_term(global, ctx, module, &mut pos)?;
            if !ctx.heap.is_any_int(src) || !size.is_small() || !flags.is_small() {
                return Err(raise(defaults::BADARG));
            }
            if unit != 1 {
                return Err(raise(defaults::UNSUPPORTED));
            }
            let value = ctx.heap.any_int_value(src);
            let size_bits = size.small_value();
            bitstring::insert_integer(
                &mut ctx.heap,
                ctx.bs,
                ctx.bs_offset,
                value,
                size_bits,
                flags.small_value(),
            )
            .map_err(bs_raise)?;
            ctx.bs_offset += size_bits as usize;
            *i = pos;
        }

        Opcode::BsPutBinary => {
            decode_label(module, &mut pos)?;
            let size = decode_term(global, ctx, module, &mut pos)?;
            let unit = decode_uint(module, &mut pos)? as i64;
            let flags = decode_term(global, ctx, module, &mut pos)?;
            let src = decode_term(global, ctx, module, &mut pos)?;
            if !ctx.heap.is_binary(src) || !flags.is_small() {
                return Err(raise(defaults::BADARG));
            }
            let size_bytes = if size.is_small() {
                let bits = size.small_value() * unit;
                if bits % 8 != 0 {
                    return Err(raise(defaults::UNSUPPORTED));
                }
                (bits / 8) as usize
            } else if size == Term::atom(defaults::ALL) {
                ctx.heap.binary_size(src)
            } else {
                return Err(raise(defaults::BADARG));
            };
            if size_bytes > ctx.heap.binary_size(src) {
                return Err(raise(defaults::BADARG));
            }
            if flags.small_value() != 0 {
                return Err(raise(defaults::UNSUPPORTED));
            }
            if ctx.bs_offset % 8 != 0 {
                return Err(raise(defaults::UNSUPPORTED));
            }
            bitstring::insert_binary(&mut ctx.heap, ctx.bs, ctx.bs_offset, src, size_bytes)
                .map_err(bs_raise)?;
            ctx.bs_offset += 8 * size_bytes;
            *i = pos;
        }

        Opcode::BsPutString => {
            let size = decode_uint(module, &mut pos)? as usize;
            let offset = decode_uint(module, &mut pos)? as usize;
            if !ctx.heap.is_binary(ctx.bs) {
                return Err(raise(defaults::BADARG));
            }
            if ctx.bs_offset % 8 != 0 {
                return Err(raise(defaults::UNSUPPORTED));
            }
            let bytes = module
                .string(offset, size)
                .ok_or_else(|| raise(defaults::BADARG))?
                .to_vec();
            let at = ctx.bs_offset / 8;
            if at + size > ctx.heap.binary_size(ctx.bs) {
                return Err(raise(defaults::BADARG));
            }
            let bs = ctx.bs;
            ctx.heap.binary_write(bs, at, &bytes);
            ctx.bs_offset += 8 * size;
            *i = pos;
        }

        Opcode::BsStartMatch2 => {
            let fail = decode_label(module, &mut pos)?;
            let src_at = pos;
            decode_term(global, ctx, module, &mut pos)?; // src, re-read below
            decode_term(global, ctx, module, &mut pos)?; // live
            let slots_t = decode_term(global, ctx, module, &mut pos)?;
            let dest = decode_dest(module, &mut pos)?;
            let slots = if slots_t.is_small() {
                slots_t.small_value().max(0) as usize
            } else {
                0
            };
            oom(ctx.ensure_free(Heap::match_state_words(slots)))?;
            let mut again = src_at;
            let src = decode_term(global, ctx, module, &mut again)?;
            if !(ctx.heap.is_binary(src) || ctx.heap.is_match_state(src)) {
                write_dest(ctx, dest, src);
                *i = label_offset(module, fail)?;
            } else {
                let state = ctx.heap.alloc_match_state(src, slots);
                write_dest(ctx, dest, state);
                *i = pos;
            }
        }

        Opcode::BsStartMatch3 => {
            oom(ctx.ensure_free(Heap::match_state_words(0)))?;
            let fail = decode_label(module, &mut pos)?;
            let src = decode_term(global, ctx, module, &mut pos)?;
            decode_term(global, ctx, module, &mut pos)?; // live
            let dest = decode_dest(module, &mut pos)?;
            if !(ctx.heap.is_binary(src) || ctx.heap.is_match_state(src)) {
                write_dest(ctx, dest, src);
                *i = label_offset(module, fail)?;
            } else {
                let state = ctx.heap.alloc_match_state(src, 0);
                write_dest(ctx, dest, state);
                *i = pos;
            }
        }

        Opcode::BsStartMatch4 => {
            oom(ctx.ensure_free(Heap::match_state_words(0)))?;
            // `fail` is `no_fail`, `resume`, or a plain label.
            let fail_at = pos;
            let fail = match compact::decode_operand(module.code(), &mut pos)? {
                Operand::Untagged(label) => Some(label as u32),
                Operand::Atom(_) => None,
                _ => {
                    return Err(ExecError::Abort(VmError::Operand(
                        compact::OperandError::KindMismatch(fail_at),
                    )))
                }
            };
            decode_term(global, ctx, module, &mut pos)?; // live
            let src = decode_term(global, ctx, module, &mut pos)?;
            let dest = decode_dest(module, &mut pos)?;
            if !(ctx.heap.is_binary(src) || ctx.heap.is_match_state(src)) {
                write_dest(ctx, dest, src);
                match fail {
                    Some(label) => *i = label_offset(module, label)?,
                    None => return Err(VmError::MalformedTerm("bs_start_match4").into()),
                }
            } else {
                let state = ctx.heap.alloc_match_state(src, 0);
                write_dest(ctx, dest, state);
                *i = pos;
            }
        }

        Opcode::BsGetPosition => {
            let src = decode_term(global, ctx, module, &mut pos)?;
            let dest = decode_dest(module, &mut pos)?;
            decode_term(global, ctx, module, &mut pos)?; // live
            if !ctx.heap.is_match_state(src) {
                return Err(raise(defaults::BADARG));
            }
            let offset = ctx.heap.match_state_offset(src);
            write_dest(ctx, dest, Term::small(offset as i64));
            *i = pos;
        }

        Opcode::BsSetPosition => {
            let src = decode_term(global, ctx, module, &mut pos)?;
            let position = decode_term(global, ctx, module, &mut pos)?;
            if !ctx.heap.is_match_state(src) || !position.is_small() {
                return Err(raise(defaults::BADARG));
            }
            let value = position.small_value().max(0) as usize;
            ctx.heap.set_match_state_offset(src, value);
            *i = pos;
        }

        Opcode::BsGetTail => {
            let src_at = pos;
            let src = decode_term(global, ctx, module, &mut pos)?;
            let dest = decode_dest(module, &mut pos)?;
            decode_term(global, ctx, module, &mut pos)?; // live
            if !ctx.heap.is_match_state(src) {
                return Err(raise(defaults::BADARG));
            }
            let offset = ctx.heap.match_state_offset(src);
            if offset == 0 {
                let bin = ctx.heap.match_state_binary(src);
                write_dest(ctx, dest, bin);
            } else {
                if offset % 8 != 0 {
                    return Err(raise(defaults::UNSUPPORTED));
                }
                let start = offset / 8;
                let bin = ctx.heap.match_state_binary(src);
                let len = ctx.heap.binary_size(bin) - start;
                oom(ctx.ensure_free(Heap::sub_binary_words(len)))?;
                let mut again = src_at;
                let src = decode_term(global, ctx, module, &mut again)?;
                let bin = ctx.heap.match_state_binary(src);
                let tail = ctx.heap.maybe_sub_binary(bin, start, len);
                write_dest(ctx, dest, tail);
            }
            *i = pos;
        }

        Opcode::BsMatchString => {
            let fail = decode_label(module, &mut pos)?;
            let src = decode_term(global, ctx, module, &mut pos)?;
            let bits = decode_uint(module, &mut pos)? as usize;
            let offset = decode_uint(module, &mut pos)? as usize;
            if !ctx.heap.is_match_state(src) {
                return Err(raise(defaults::BADARG));
            }
            if bits % 8 != 0 {
                return Err(raise(defaults::UNSUPPORTED));
            }
            let bytes = bits / 8;
            let ms_offset = ctx.heap.match_state_offset(src);
            if ms_offset % 8 != 0 {
                return Err(raise(defaults::UNSUPPORTED));
            }
            let byte_offset = ms_offset / 8;
            let expected = module
                .string(offset, bytes)
                .ok_or_else(|| raise(defaults::BADARG))?
                .to_vec();
            let bin = ctx.heap.match_state_binary(src);
            let matches = byte_offset + bytes <= ctx.heap.binary_size(bin)
                && (0..bytes).all(|k| ctx.heap.binary_byte(bin, byte_offset + k) == expected[k]);
            if matches {
                ctx.heap.set_match_state_offset(src, ms_offset + bits);
                *i = pos;
            } else {
                *i = label_offset(module, fail)?;
            }
        }

        Opcode::BsSave2 | Opcode::BsRestore2 => {
            let src = decode_term(global, ctx, module, &mut pos)?;
            let index = decode_term(global, ctx, module, &mut pos)?;
            if !ctx.heap.is_match_state(src) {
                return Err(raise(defaults::BADARG));
            }
            let slot = if index == Term::atom(defaults::START) {
                None
            } else if index.is_small() {
                Some(index.small_value().max(0) as usize)
            } else {
                return Err(VmError::MalformedTerm("bs_save2 index").into());
            };
            if op == Opcode::BsSave2 {
                ctx.heap.match_state_save(src, slot);
            } else {
                ctx.heap.match_state_restore(src, slot);
            }
            *i = pos;
        }

        Opcode::BsSkipBits2 => {
            let fail = decode_label(module, &mut pos)?;
            let src = decode_term(global, ctx, module, &mut pos)?;
            let size = decode_term(global, ctx, module, &mut pos)?;
            let unit = decode_uint(module, &mut pos)? as usize;
            let flags = decode_term(global, ctx, module, &mut pos)?;
            if !ctx.heap.is_match_state(src) || !size.is_small() || !flags.is_small() {
                return Err(raise(defaults::BADARG));
            }
            if flags.small_value() != 0 {
                return Err(raise(defaults::UNSUPPORTED));
            }
            let increment = size.small_value().max(0) as usize * unit;
            let offset = ctx.heap.match_state_offset(src);
            let bin = ctx.heap.match_state_binary(src);
            if offset + increment > ctx.heap.binary_size(bin) * 8 {
                *i = label_offset(module, fail)?;
            } else {
                ctx.heap.set_match_state_offset(src, offset + increment);
                *i = pos;
            }
        }

        Opcode::BsTestUnit => {
            let fail = decode_label(module, &mut pos)?;
            let src = decode_term(global, ctx, module, &mut pos)?;
            let unit = decode_uint(module, &mut pos)? as usize;
            if !ctx.heap.is_match_state(src) || unit == 0 {
                return Err(raise(defaults::BADARG));
            }
            let offset = ctx.heap.match_state_offset(src);
            let bin = ctx.heap.match_state_binary(src);
            if (ctx.heap.binary_size(bin) * 8 - offset) % unit != 0 {
                *i = label_offset(module, fail)?;
            } else {
                *i = pos;
            }
        }

        Opcode::BsTestTail2 => {
            let fail = decode_label(module, &mut pos)?;
            let src = decode_term(global, ctx, module, &mut pos)?;
            let bits = decode_uint(module, &mut pos)? as usize;
            if !ctx.heap.is_match_state(src) {
                return Err(raise(defaults::BADARG));
            }
            let offset = ctx.heap.match_state_offset(src);
            let bin = ctx.heap.match_state_binary(src);
            if ctx.heap.binary_size(bin) * 8 - offset != bits {
                *i = label_offset(module, fail)?;
            } else {
                *i = pos;
            }
        }

        Opcode::BsGetInteger2 => {
            let fail = decode_label(module, &mut pos)?;
            let src = decode_term(global, ctx, module, &mut pos)?;
            decode_term(global, ctx, module, &mut pos)?; // live
            let size = decode_term(global, ctx, module, &mut pos)?;
            let unit = decode_uint(module, &mut pos)? as usize;
            let flags = decode_term(global, ctx, module, &mut pos)?;
            let dest = decode_dest(module, &mut pos)?;
            if !ctx.heap.is_match_state(src) || !size.is_small() || !flags.is_small() {
                return Err(raise(defaults::BADARG));
            }
            let increment = size.small_value().max(0) as usize * unit;
            let offset = ctx.heap.match_state_offset(src);
            let bin = ctx.heap.match_state_binary(src);
            match bitstring::extract_integer(&ctx.heap, bin, offset, increment, flags.small_value())
            {
                Err(BsError::Fail) => *i = label_offset(module, fail)?,
                Err(other) => return Err(bs_raise(other)),
                Ok(value) => {
                    ctx.heap.set_match_state_offset(src, offset + increment);
                    let result = if (term::MIN_SMALL..=term::MAX_SMALL).contains(&value) {
                        Term::small(value)
                    } else {
                        oom(ctx.ensure_free(2))?;
                        ctx.heap.make_int(value)
                    };
                    write_dest(ctx, dest, result);
                    *i = pos;
                }
            }
        }

        Opcode::BsGetBinary2 => {
            let fail = decode_label(module, &mut pos)?;
            let src_at = pos;
            let src = decode_term(global, ctx, module, &mut pos)?;
            decode_term(global, ctx, module, &mut pos)?; // live
            let size = decode_term(global, ctx, module, &mut pos)?;
            let unit = decode_uint(module, &mut pos)? as usize;
            let flags = decode_term(global, ctx, module, &mut pos)?;
            let dest = decode_dest(module, &mut pos)?;
            if !ctx.heap.is_match_state(src) || !flags.is_small() {
                return Err(raise(defaults::BADARG));
            }
            if unit != 8 {
                return Err(raise(defaults::UNSUPPORTED));
            }
            let offset = ctx.heap.match_state_offset(src);
            let bin = ctx.heap.match_state_binary(src);
            let size_bytes = if size.is_small() {
                size.small_value().max(0) as usize
            } else if size == Term::atom(defaults::ALL) {
                ctx.heap.binary_size(bin) - offset / 8
            } else {
                return Err(raise(defaults::BADARG));
            };
            if offset % 8 != 0 {
                return Err(raise(defaults::BADARG));
            }
            if flags.small_value() != 0 {
                return Err(raise(defaults::UNSUPPORTED));
            }
            if offset / 8 + size_bytes > ctx.heap.binary_size(bin) {
                *i = label_offset(module, fail)?;
            } else {
                ctx.heap.set_match_state_offset(src, offset + size_bytes * 8);
                oom(ctx.ensure_free(Heap::sub_binary_words(size_bytes)))?;
                let mut again = src_at;
                let src = decode_term(global, ctx, module, &mut again)?;
                let bin = ctx.heap.match_state_binary(src);
                let out = ctx.heap.maybe_sub_binary(bin, offset / 8, size_bytes);
                write_dest(ctx, dest, out);
                *i = pos;
            }
        }

        Opcode::BsContextToBinary => {
            let dest = decode_dest(module, &mut pos)?;
            let src = read_dest(ctx, dest);
            let result = if ctx.heap.is_match_state(src) {
                let offset = ctx.heap.match_state_offset(src);
                if offset == 0 {
                    ctx.heap.match_state_binary(src)
                } else {
                    let bin = ctx.heap.match_state_binary(src);
                    let len = ctx.heap.binary_size(bin) - offset / 8;
                    oom(ctx.ensure_free(Heap::sub_binary_words(len)))?;
                    let src = read_dest(ctx, dest);
                    let bin = ctx.heap.match_state_binary(src);
                    ctx.heap.maybe_sub_binary(bin, offset / 8, len)
                }
            } else {
                src
            };
            write_dest(ctx, dest, result);
            *i = pos;
        }

        _ => {
            return Err(VmError::UndecodableOpcode {
                opcode: byte,
                offset: *i,
            }
            .into());
        }
    }

    Ok(Flow::Continue)
}

fn decode_list_header(module: &Module, pos: &mut usize) -> Result<usize, ExecError> {
    let at = *pos;
    match compact::decode_operand(module.code(), pos)? {
        Operand::List(count) => Ok(count as usize),
        _ => Err(compact::OperandError::KindMismatch(at).into()),
    }
}

/// Merge-updates a map: shared keys tuple when no key is new, otherwise
/// a two-way stitch of the sorted source entries and sorted new pairs.
fn put_map_assoc(
    global: &mut GlobalContext,
    ctx: &mut Context,
    module: &Arc<Module>,
    i: &mut usize,
    mut pos: usize,
) -> Result<Flow, ExecError> {
    decode_label(module, &mut pos)?; // unused
    let src_at = pos;
    let src = decode_term(global, ctx, module, &mut pos)?;
    let dest = decode_dest(module, &mut pos)?;
    decode_uint(module, &mut pos)?; // live
    let count = decode_list_header(module, &mut pos)? / 2;
    let list_at = pos;

    if !ctx.heap.is_map(src) {
        return Err(raise(defaults::BADARG));
    }

    // Count entries whose key is not already present.
    let mut new_entries = 0usize;
    for _ in 0..count {
        let key = decode_term(global, ctx, module, &mut pos)?;
        decode_term(global, ctx, module, &mut pos)?;
        if ctx.heap.find_map_pos(src, key).is_none() {
            new_entries += 1;
        }
    }

    let src_size = ctx.heap.map_size(src);
    let new_size = src_size + new_entries;
    let shared = new_entries == 0;
    oom(ctx.ensure_free(Heap::map_words(new_size, shared)))?;

    // The collection may have moved everything; re-decode.
    let mut again = src_at;
    let src = decode_term(global, ctx, module, &mut again)?;
    let mut pairs = Vec::with_capacity(count);
    let mut list_pos = list_at;
    for _ in 0..count {
        let key = decode_term(global, ctx, module, &mut list_pos)?;
        let value = decode_term(global, ctx, module, &mut list_pos)?;
        pairs.push((key, value));
    }
    pairs.sort_by(|a, b| term::compare(&ctx.heap, a.0, b.0));
    // Last write wins for duplicate keys in the update list.
    pairs.dedup_by(|next, kept| {
        if term::equals(&ctx.heap, kept.0, next.0) {
            kept.1 = next.1;
            true
        } else {
            false
        }
    });

    let keys = if shared { Some(ctx.heap.map_keys(src)) } else { None };
    let map = ctx.heap.alloc_map(new_size, keys);
    let mut src_pos = 0usize;
    let mut new_pos = 0usize;
    for slot in 0..new_size {
        let take_new = if src_pos >= src_size {
            true
        } else if new_pos >= pairs.len() {
            false
        } else {
            let src_key = ctx.heap.map_key(src, src_pos);
            match term::compare(&ctx.heap, src_key, pairs[new_pos].0) {
                core::cmp::Ordering::Less => false,
                core::cmp::Ordering::Greater => true,
                core::cmp::Ordering::Equal => {
                    // Same key: keep the source key, take the new value.
                    let (_, value) = pairs[new_pos];
                    ctx.heap.set_map_entry(map, slot, src_key, value);
                    src_pos += 1;
                    new_pos += 1;
                    continue;
                }
            }
        };
        if take_new {
            let (key, value) = pairs[new_pos];
            ctx.heap.set_map_entry(map, slot, key, value);
            new_pos += 1;
        } else {
            let key = ctx.heap.map_key(src, src_pos);
            let value = ctx.heap.map_value(src, src_pos);
            ctx.heap.set_map_entry(map, slot, key, value);
            src_pos += 1;
        }
    }

    write_dest(ctx, dest, map);
    *i = pos;
    Ok(Flow::Continue)
}

/// Updates existing keys only; a missing key is `badarg`.
fn put_map_exact(
    global: &mut GlobalContext,
    ctx: &mut Context,
    module: &Arc<Module>,
    i: &mut usize,
    mut pos: usize,
) -> Result<Flow, ExecError> {
    decode_label(module, &mut pos)?; // unused
    let src_at = pos;
    let src = decode_term(global, ctx, module, &mut pos)?;
    let dest = decode_dest(module, &mut pos)?;
    decode_uint(module, &mut pos)?; // live
    let count = decode_list_header(module, &mut pos)? / 2;
    let list_at = pos;

    if !ctx.heap.is_map(src) {
        return Err(raise(defaults::BADARG));
    }

    for _ in 0..count {
        let key = decode_term(global, ctx, module, &mut pos)?;
        decode_term(global, ctx, module, &mut pos)?;
        if ctx.heap.find_map_pos(src, key).is_none() {
            return Err(raise(defaults::BADARG));
        }
    }

    let src_size = ctx.heap.map_size(src);
    oom(ctx.ensure_free(Heap::map_words(src_size, true)))?;

    let mut again = src_at;
    let src = decode_term(global, ctx, module, &mut again)?;
    let keys = ctx.heap.map_keys(src);
    let map = ctx.heap.alloc_map(src_size, Some(keys));
    for slot in 0..src_size {
        let key = ctx.heap.map_key(src, slot);
        let value = ctx.heap.map_value(src, slot);
        ctx.heap.set_map_entry(map, slot, key, value);
    }
    let mut list_pos = list_at;
    for _ in 0..count {
        let key = decode_term(global, ctx, module, &mut list_pos)?;
        let value = decode_term(global, ctx, module, &mut list_pos)?;
        let position = ctx
            .heap
            .find_map_pos(src, key)
            .ok_or_else(|| raise(defaults::BADARG))?;
        ctx.heap.set_map_entry(map, position, key, value);
    }

    write_dest(ctx, dest, map);
    *i = pos;
    Ok(Flow::Continue)
}

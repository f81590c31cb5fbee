//! Native implemented functions: general-arity host functions with full
//! access to the machine.
//!
//! A NIF reads its arguments from the caller's x-registers and returns a
//! single term, or raises. Hosts may register additional NIFs before
//! loading modules; lookup is by `(module, function, arity)` and happens
//! at import-resolution time or on a dynamic `apply`.

use hashbrown::HashMap;

use crate::atom::{defaults, AtomTable};
use crate::context::Context;
use crate::error::Exception;
use crate::global::GlobalContext;
use crate::heap::FunShape;
use crate::term::Term;

/// What a NIF returns: a term, or a raised exception.
pub type NifResult = Result<Term, Exception>;

/// A native function. `argc` arguments are in `ctx.x[0..argc]`.
pub type NifFn = fn(&mut GlobalContext, &mut Context, argc: usize) -> NifResult;

/// NIF lookup table keyed by `(module, function, arity)` atom ids.
#[derive(Debug, Default)]
pub struct NifRegistry {
    map: HashMap<(u32, u32, u32), NifFn>,
}

impl NifRegistry {
    /// Registers a NIF.
    pub fn register(&mut self, module: u32, function: u32, arity: u32, f: NifFn) {
        self.map.insert((module, function, arity), f);
    }

    /// Looks a NIF up.
    pub fn get(&self, module: u32, function: u32, arity: u32) -> Option<NifFn> {
        self.map.get(&(module, function, arity)).copied()
    }
}

/// Registers the `erlang` module NIF set.
pub fn install_defaults(registry: &mut NifRegistry, atoms: &mut AtomTable) {
    let erlang = defaults::ERLANG;
    let mut reg = |name: &str, arity: u32, f: NifFn| {
        let function = atoms.insert(name);
        registry.register(erlang, function, arity, f);
    };
    reg("spawn", 1, nif_spawn_1);
    reg("spawn", 3, nif_spawn_3);
    reg("spawn_monitor", 1, nif_spawn_monitor_1);
    reg("make_ref", 0, nif_make_ref);
    reg("monitor", 2, nif_monitor_2);
    reg("demonitor", 1, nif_demonitor_1);
    reg("link", 1, nif_link_1);
    reg("unlink", 1, nif_unlink_1);
    reg("process_flag", 2, nif_process_flag_2);
    reg("exit", 1, nif_exit_1);
    reg("throw", 1, nif_throw_1);
    reg("error", 1, nif_error_1);
    reg("send", 2, nif_send_2);
    reg("display", 1, nif_display_1);
    reg("put", 2, nif_put_2);
    reg("get", 1, nif_get_1);
}

fn badarg() -> Exception {
    Exception::error_atom(defaults::BADARG)
}

/// Builds the spawned process for a closure and returns its pid.
fn spawn_closure(global: &mut GlobalContext, parent: &Context, fun: Term) -> Result<u32, Exception> {
    if !parent.heap.is_function(fun) {
        return Err(badarg());
    }

    let mut child = global.new_context();
    let size = parent.heap.tree_size(fun);
    child.ensure_free(size).map_err(|_| Exception::error_atom(defaults::OUT_OF_MEMORY))?;
    let fun = child.heap.copy_tree_from(Some(&parent.heap), fun);

    match child.heap.fun_shape(fun) {
        FunShape::Index {
            module_index,
            fun_index,
        } => {
            let module = global
                .module(module_index)
                .map_err(|_| Exception::error_atom(defaults::UNDEF))?;
            let entry = module.fun_entry(fun_index).ok_or_else(badarg)?;
            let arity = (entry.total_arity - entry.n_free) as usize;
            if arity != 0 {
                return Err(badarg());
            }
            for slot in 0..entry.n_free as usize {
                child.x[slot] = child.heap.fun_freeze(fun, slot);
            }
            child.saved_module = module_index;
            child.saved_ip = module
                .label_offset(entry.label)
                .ok_or_else(badarg)?;
            child.cp = Term::cp(module_index, module.end_offset);
        }
        FunShape::Named {
            module_atom,
            function_atom,
            arity,
        } => {
            if arity != 0 {
                return Err(badarg());
            }
            let module = global
                .module_by_atom(module_atom)
                .ok_or(Exception::error_atom(defaults::UNDEF))?;
            let label = module
                .search_exported(function_atom, 0)
                .ok_or(Exception::error_atom(defaults::UNDEF))?;
            child.saved_module = module.index;
            child.saved_ip = module.label_offset(label).ok_or_else(badarg)?;
            child.cp = Term::cp(module.index, module.end_offset);
        }
    }
    Ok(global.commit_process(child))
}

fn nif_spawn_1(global: &mut GlobalContext, ctx: &mut Context, _argc: usize) -> NifResult {
    let fun = ctx.x[0];
    let pid = spawn_closure(global, ctx, fun)?;
    Ok(Term::pid(pid))
}

/// `spawn(Module, Function, Args)`.
fn nif_spawn_3(global: &mut GlobalContext, ctx: &mut Context, _argc: usize) -> NifResult {
    let (module_t, function_t, args) = (ctx.x[0], ctx.x[1], ctx.x[2]);
    if !module_t.is_atom() || !function_t.is_atom() || !(args.is_nil() || args.is_list_cell()) {
        return Err(badarg());
    }

    let mut arity = 0usize;
    let mut cursor = args;
    while cursor.is_list_cell() {
        arity += 1;
        cursor = ctx.heap.list_tail(cursor);
    }
    if !cursor.is_nil() {
        return Err(badarg());
    }

    let module = global
        .module_by_atom(module_t.atom_id())
        .ok_or(Exception::error_atom(defaults::UNDEF))?;
    let label = module
        .search_exported(function_t.atom_id(), arity as u32)
        .ok_or(Exception::error_atom(defaults::UNDEF))?;

    let mut child = global.new_context();
    let mut cursor = args;
    let mut slot = 0;
    while cursor.is_list_cell() {
        let arg = ctx.heap.list_head(cursor);
        let size = ctx.heap.tree_size(arg);
        child
            .ensure_free(size)
            .map_err(|_| Exception::error_atom(defaults::OUT_OF_MEMORY))?;
        child.x[slot] = child.heap.copy_tree_from(Some(&ctx.heap), arg);
        slot += 1;
        cursor = ctx.heap.list_tail(cursor);
    }
    child.saved_module = module.index;
    child.saved_ip = module.label_offset(label).ok_or_else(badarg)?;
    child.cp = Term::cp(module.index, module.end_offset);
    Ok(Term::pid(global.commit_process(child)))
}

fn nif_spawn_monitor_1(global: &mut GlobalContext, ctx: &mut Context, _argc: usize) -> NifResult {
    let fun = ctx.x[0];
    let pid = spawn_closure(global, ctx, fun)?;
    let ticks = global.next_ref_ticks();
    if let Some(child) = global.processes.get_mut(&pid) {
        child.add_monitor(ctx.pid, ticks, false);
    }
    ctx.ensure_free(2 + 3)
        .map_err(|_| Exception::error_atom(defaults::OUT_OF_MEMORY))?;
    let reference = ctx.heap.alloc_ref(ticks);
    let tuple = ctx.heap.alloc_tuple(2);
    ctx.heap.put_tuple_element(tuple, 0, Term::pid(pid));
    ctx.heap.put_tuple_element(tuple, 1, reference);
    Ok(tuple)
}

fn nif_make_ref(global: &mut GlobalContext, ctx: &mut Context, _argc: usize) -> NifResult {
    let ticks = global.next_ref_ticks();
    ctx.ensure_free(2)
        .map_err(|_| Exception::error_atom(defaults::OUT_OF_MEMORY))?;
    Ok(ctx.heap.alloc_ref(ticks))
}

/// `monitor(process, Pid)`.
fn nif_monitor_2(global: &mut GlobalContext, ctx: &mut Context, _argc: usize) -> NifResult {
    let (kind, pid_t) = (ctx.x[0], ctx.x[1]);
    if kind != Term::atom(defaults::PROCESS) || !pid_t.is_pid() {
        return Err(badarg());
    }
    let pid = pid_t.pid_id();
    let ticks = global.next_ref_ticks();
    match global.processes.get_mut(&pid) {
        Some(target) => {
            target.add_monitor(ctx.pid, ticks, false);
        }
        None => return Err(badarg()),
    }
    ctx.ensure_free(2)
        .map_err(|_| Exception::error_atom(defaults::OUT_OF_MEMORY))?;
    Ok(ctx.heap.alloc_ref(ticks))
}

fn nif_demonitor_1(global: &mut GlobalContext, ctx: &mut Context, _argc: usize) -> NifResult {
    let reference = ctx.x[0];
    if !ctx.heap.is_ref(reference) {
        return Err(badarg());
    }
    let ticks = ctx.heap.ref_ticks(reference);
    for target in global.processes.values_mut() {
        target.demonitor_by_ref(ticks);
    }
    Ok(Term::atom(defaults::TRUE))
}

fn nif_link_1(global: &mut GlobalContext, ctx: &mut Context, _argc: usize) -> NifResult {
    let pid_t = ctx.x[0];
    if !pid_t.is_pid() {
        return Err(badarg());
    }
    let pid = pid_t.pid_id();
    let ticks = global.next_ref_ticks();
    match global.processes.get_mut(&pid) {
        Some(target) => {
            target.add_monitor(ctx.pid, ticks, true);
        }
        None => return Err(badarg()),
    }
    ctx.add_monitor(pid, ticks, true);
    Ok(Term::atom(defaults::TRUE))
}

fn nif_unlink_1(global: &mut GlobalContext, ctx: &mut Context, _argc: usize) -> NifResult {
    let pid_t = ctx.x[0];
    if !pid_t.is_pid() {
        return Err(badarg());
    }
    let pid = pid_t.pid_id();
    if let Some(target) = global.processes.get_mut(&pid) {
        target.demonitor(ctx.pid, true);
    }
    ctx.demonitor(pid, true);
    Ok(Term::atom(defaults::TRUE))
}

/// `process_flag(trap_exit, Bool)`.
fn nif_process_flag_2(_global: &mut GlobalContext, ctx: &mut Context, _argc: usize) -> NifResult {
    let (flag, value) = (ctx.x[0], ctx.x[1]);
    if flag != Term::atom(defaults::TRAP_EXIT) || !value.is_boolean() {
        return Err(badarg());
    }
    let old = if ctx.trap_exit {
        Term::atom(defaults::TRUE)
    } else {
        Term::atom(defaults::FALSE)
    };
    ctx.trap_exit = value == Term::atom(defaults::TRUE);
    Ok(old)
}

fn nif_exit_1(_global: &mut GlobalContext, ctx: &mut Context, _argc: usize) -> NifResult {
    Err(Exception::exit(ctx.x[0]))
}

fn nif_throw_1(_global: &mut GlobalContext, ctx: &mut Context, _argc: usize) -> NifResult {
    Err(Exception::throw(ctx.x[0]))
}

fn nif_error_1(_global: &mut GlobalContext, ctx: &mut Context, _argc: usize) -> NifResult {
    Err(Exception::error(ctx.x[0]))
}

/// `send(Pid, Message)`, the function form of `!`.
fn nif_send_2(global: &mut GlobalContext, ctx: &mut Context, _argc: usize) -> NifResult {
    let to = ctx.x[0];
    if !to.is_pid() {
        return Err(badarg());
    }
    global.send(ctx, to.pid_id());
    // A self-send may have collected; x[1] is a root and stays fresh.
    Ok(ctx.x[1])
}

fn nif_display_1(global: &mut GlobalContext, ctx: &mut Context, _argc: usize) -> NifResult {
    let value = crate::value::Value::from_term(&global.atoms, &ctx.heap, ctx.x[0]);
    tracing::info!(pid = ctx.pid, %value, "display");
    Ok(Term::atom(defaults::TRUE))
}

fn nif_put_2(_global: &mut GlobalContext, ctx: &mut Context, _argc: usize) -> NifResult {
    let (key, value) = (ctx.x[0], ctx.x[1]);
    for entry in ctx.dictionary.iter_mut() {
        if crate::term::equals(&ctx.heap, entry.0, key) {
            let old = entry.1;
            entry.1 = value;
            return Ok(old);
        }
    }
    ctx.dictionary.push((key, value));
    Ok(Term::atom(defaults::UNDEFINED))
}

fn nif_get_1(_global: &mut GlobalContext, ctx: &mut Context, _argc: usize) -> NifResult {
    let key = ctx.x[0];
    for entry in &ctx.dictionary {
        if crate::term::equals(&ctx.heap, entry.0, key) {
            return Ok(entry.1);
        }
    }
    Ok(Term::atom(defaults::UNDEFINED))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_flag_returns_the_old_value() {
        let mut global = GlobalContext::new();
        let mut ctx = global.new_context();
        ctx.x[0] = Term::atom(defaults::TRAP_EXIT);
        ctx.x[1] = Term::atom(defaults::TRUE);
        assert_eq!(
            nif_process_flag_2(&mut global, &mut ctx, 2),
            Ok(Term::atom(defaults::FALSE))
        );
        assert!(ctx.trap_exit);
    }

    #[test]
    fn monitor_requires_a_live_target() {
        let mut global = GlobalContext::new();
        let mut ctx = global.new_context();
        ctx.x[0] = Term::atom(defaults::PROCESS);
        ctx.x[1] = Term::pid(4242);
        assert_eq!(
            nif_monitor_2(&mut global, &mut ctx, 2),
            Err(Exception::error_atom(defaults::BADARG))
        );
    }

    #[test]
    fn link_is_bidirectional() {
        let mut global = GlobalContext::new();
        let peer = global.new_context();
        let peer_pid = global.commit_process(peer);
        let mut ctx = global.new_context();
        ctx.x[0] = Term::pid(peer_pid);
        nif_link_1(&mut global, &mut ctx, 1).expect("links");
        assert_eq!(ctx.monitors.len(), 1);
        assert!(ctx.monitors[0].linked);
        let peer = global.take_process(peer_pid).expect("alive");
        assert_eq!(peer.monitors.len(), 1);
        assert_eq!(peer.monitors[0].peer, ctx.pid);
    }

    #[test]
    fn dictionary_put_get() {
        let mut global = GlobalContext::new();
        let mut ctx = global.new_context();
        ctx.x[0] = Term::small(1);
        ctx.x[1] = Term::atom(defaults::OK);
        assert_eq!(
            nif_put_2(&mut global, &mut ctx, 2),
            Ok(Term::atom(defaults::UNDEFINED))
        );
        assert_eq!(nif_get_1(&mut global, &mut ctx, 1), Ok(Term::atom(defaults::OK)));
    }

    #[test]
    fn exceptions_carry_their_class() {
        let mut global = GlobalContext::new();
        let mut ctx = global.new_context();
        ctx.x[0] = Term::atom(defaults::NORMAL);
        let err = nif_exit_1(&mut global, &mut ctx, 1).unwrap_err();
        assert_eq!(err.class, Term::atom(defaults::EXIT));
        let err = nif_throw_1(&mut global, &mut ctx, 1).unwrap_err();
        assert_eq!(err.class, Term::atom(defaults::THROW));
    }
}

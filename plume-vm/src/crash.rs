//! Crash reports for uncaught errors.
//!
//! Emitted through the diagnostic stream right before an erroring
//! process is torn down; scheduling of other processes continues.

use crate::context::Context;
use crate::global::GlobalContext;
use crate::module::Module;
use crate::term::Term;
use crate::value::Value;

fn describe_cp(global: &GlobalContext, cp: u64) -> String {
    if cp == Term::CP_SENTINEL {
        return "#CP<entry>".to_string();
    }
    let (module_index, offset) = Term::cp_parts(cp);
    match global.module(module_index) {
        Ok(module) => format!(
            "#CP<module: {}, offset: {offset}>",
            global.atoms.name(module.name_atom)
        ),
        Err(_) => format!("#CP<module: {module_index}, offset: {offset}>"),
    }
}

fn describe_term(global: &GlobalContext, ctx: &Context, t: Term) -> String {
    if (t.is_boxed() || t.is_list_cell()) && !ctx.heap.index_in_bounds(t.heap_index()) {
        return format!("#junk<{:#x}>", t.raw());
    }
    Value::from_term(&global.atoms, &ctx.heap, t).to_string()
}

/// Dumps pid, continuation, error registers, stack, registers and
/// mailbox of a crashing process.
pub(crate) fn dump(global: &GlobalContext, ctx: &Context, module: &Module, offset: usize) {
    let mut stack = String::new();
    for word in ctx.heap.stack_words() {
        if word.is_catch_label() {
            let (module_index, label) = word.catch_label_parts();
            stack.push_str(&format!("catch: {module_index}:{label}\n"));
        } else if word.is_cp_word() {
            stack.push_str(&describe_cp(global, word.raw()));
            stack.push('\n');
        } else {
            stack.push_str(&describe_term(global, ctx, *word));
            stack.push('\n');
        }
    }

    let mut registers = String::new();
    for (index, reg) in ctx.x.iter().enumerate() {
        registers.push_str(&format!("x[{index}]: {}\n", describe_term(global, ctx, *reg)));
    }

    let mut mailbox = String::new();
    for message in ctx.mailbox.terms() {
        mailbox.push_str(&describe_term(global, ctx, *message));
        mailbox.push('\n');
    }

    tracing::error!(
        pid = ctx.pid,
        module = global.atoms.name(module.name_atom),
        offset,
        cp = %describe_cp(global, ctx.cp),
        class = %describe_term(global, ctx, ctx.x[0]),
        reason = %describe_term(global, ctx, ctx.x[1]),
        stack = %stack,
        registers = %registers,
        mailbox = %mailbox,
        "process crashed"
    );
}

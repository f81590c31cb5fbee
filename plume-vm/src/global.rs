//! The machine-wide context: atom table, module and process registries,
//! scheduler queues and timers.
//!
//! There is exactly one of these per machine and it is passed explicitly
//! everywhere; nothing here is a static. All mutation happens on the
//! single execution thread.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hashbrown::HashMap;

use crate::atom::{self, defaults, AtomTable};
use crate::bif::{self, BifRegistry};
use crate::context::{Context, Status};
use crate::error::VmError;
use crate::module::Module;
use crate::nif::{self, NifRegistry};
use crate::term::Term;
use crate::value::Value;

/// Reductions granted per scheduling quantum.
pub const DEFAULT_REDUCTIONS: u32 = 1024;

/// Machine-wide shared state.
#[derive(Debug)]
pub struct GlobalContext {
    /// Atom interning table.
    pub atoms: AtomTable,
    pub(crate) modules: Vec<Arc<Module>>,
    pub(crate) modules_by_atom: HashMap<u32, usize>,
    pub(crate) processes: HashMap<u32, Context>,
    pub(crate) ready: VecDeque<u32>,
    pub(crate) timers: Vec<(Instant, u32)>,
    pub(crate) bifs: BifRegistry,
    pub(crate) nifs: NifRegistry,
    pub(crate) exited: HashMap<u32, Value>,
    next_pid: u32,
    ref_ticks: u64,
}

impl GlobalContext {
    /// Fresh context with the default atoms, BIFs and NIFs installed.
    pub fn new() -> Self {
        let mut atoms = AtomTable::new();
        atom::install_defaults(&mut atoms);
        let mut bifs = BifRegistry::default();
        bif::install_defaults(&mut bifs, &mut atoms);
        let mut nifs = NifRegistry::default();
        nif::install_defaults(&mut nifs, &mut atoms);
        GlobalContext {
            atoms,
            modules: Vec::new(),
            modules_by_atom: HashMap::new(),
            processes: HashMap::new(),
            ready: VecDeque::new(),
            timers: Vec::new(),
            bifs,
            nifs,
            exited: HashMap::new(),
            next_pid: 1,
            ref_ticks: 0,
        }
    }

    // ------------------------------------------------------------------
    // Modules
    // ------------------------------------------------------------------

    /// Registers a loaded module, assigning its registry index.
    pub fn register_module(&mut self, mut module: Module) -> usize {
        let index = self.modules.len();
        module.set_index(index);
        self.modules_by_atom.insert(module.name_atom, index);
        self.modules.push(Arc::new(module));
        tracing::debug!(index, "registered module");
        index
    }

    /// Module by registry index.
    pub fn module(&self, index: usize) -> Result<Arc<Module>, VmError> {
        self.modules
            .get(index)
            .cloned()
            .ok_or(VmError::UnknownModule(index))
    }

    /// Module by name atom.
    pub fn module_by_atom(&self, name_atom: u32) -> Option<Arc<Module>> {
        self.modules_by_atom
            .get(&name_atom)
            .map(|i| self.modules[*i].clone())
    }

    // ------------------------------------------------------------------
    // Processes and scheduling
    // ------------------------------------------------------------------

    /// Fresh process context, not yet registered.
    pub fn new_context(&mut self) -> Context {
        let pid = self.next_pid;
        self.next_pid += 1;
        Context::new(pid)
    }

    /// Registers a context and makes it runnable.
    pub fn commit_process(&mut self, ctx: Context) -> u32 {
        let pid = ctx.pid;
        self.processes.insert(pid, ctx);
        self.ready.push_back(pid);
        tracing::debug!(pid, "spawned process");
        pid
    }

    pub(crate) fn take_process(&mut self, pid: u32) -> Option<Context> {
        self.processes.remove(&pid)
    }

    pub(crate) fn put_process(&mut self, ctx: Context) {
        self.processes.insert(ctx.pid, ctx);
    }

    /// Whether a process exists (running processes are briefly absent
    /// from the registry; they are alive by definition).
    pub fn is_alive(&self, pid: u32) -> bool {
        self.processes.contains_key(&pid)
    }

    pub(crate) fn ready_pop(&mut self) -> Option<u32> {
        self.ready.pop_front()
    }

    pub(crate) fn ready_push(&mut self, pid: u32) {
        self.ready.push_back(pid);
    }

    /// Monotonic reference ticks.
    pub fn next_ref_ticks(&mut self) -> u64 {
        self.ref_ticks += 1;
        self.ref_ticks
    }

    /// Exit reason of a terminated process.
    pub fn exit_reason(&self, pid: u32) -> Option<&Value> {
        self.exited.get(&pid)
    }

    // ------------------------------------------------------------------
    // Messaging
    // ------------------------------------------------------------------

    /// Delivers `sender.x[1]` to `to`, deep-copying the term tree into
    /// the receiver's heap. Sends to dead processes vanish. The message
    /// is re-read from `x[1]` because a self-send may collect the
    /// sender's heap first.
    pub fn send(&mut self, sender: &mut Context, to: u32) {
        if to == sender.pid {
            let size = sender.heap.tree_size(sender.x[1]);
            if sender.ensure_free(size).is_err() {
                tracing::warn!(pid = sender.pid, "self-send dropped: heap limit");
                return;
            }
            let copied = sender.heap.copy_tree_from(None, sender.x[1]);
            sender.mailbox.push(copied);
            return;
        }
        let Some(target) = self.processes.get_mut(&to) else {
            return;
        };
        let size = sender.heap.tree_size(sender.x[1]);
        if target.ensure_free(size).is_err() {
            tracing::warn!(pid = to, "message dropped: receiver heap limit");
            return;
        }
        let copied = target.heap.copy_tree_from(Some(&sender.heap), sender.x[1]);
        target.mailbox.push(copied);
        self.wake_for_message(to);
    }

    /// Makes a waiting process runnable after a message arrived,
    /// resuming at its receive-retry label if one is armed.
    pub(crate) fn wake_for_message(&mut self, pid: u32) {
        let Some(ctx) = self.processes.get_mut(&pid) else {
            return;
        };
        if ctx.status != Status::Waiting {
            return;
        }
        if let Some(label) = ctx.restore_label.take() {
            if let Some(module) = self.modules.get(ctx.saved_module) {
                if let Some(offset) = module.label_offset(label) {
                    ctx.saved_ip = offset;
                }
            }
        }
        ctx.status = Status::Runnable;
        self.ready.push_back(pid);
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Arms a receive timeout for `pid`.
    pub(crate) fn arm_timeout(&mut self, pid: u32, millis: u64) {
        self.timers.push((Instant::now() + Duration::from_millis(millis), pid));
    }

    /// Disarms any timeout for `pid` (a message arrived first).
    pub(crate) fn cancel_timeout(&mut self, pid: u32) {
        self.timers.retain(|(_, p)| *p != pid);
    }

    /// Fires every elapsed timer: the owner resumes past its
    /// `wait_timeout` with the expired flag set.
    pub(crate) fn fire_due_timers(&mut self) {
        let now = Instant::now();
        let mut fired = Vec::new();
        self.timers.retain(|(deadline, pid)| {
            if *deadline <= now {
                fired.push(*pid);
                false
            } else {
                true
            }
        });
        for pid in fired {
            let Some(ctx) = self.processes.get_mut(&pid) else {
                continue;
            };
            ctx.flags.remove(crate::context::ProcessFlags::WAITING_TIMEOUT);
            ctx.flags.insert(crate::context::ProcessFlags::WAITING_TIMEOUT_EXPIRED);
            ctx.restore_label = None;
            if ctx.status == Status::Waiting {
                ctx.status = Status::Runnable;
                self.ready.push_back(pid);
            }
            tracing::trace!(pid, "receive timeout fired");
        }
    }

    /// Earliest pending deadline, if any.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timers.iter().map(|(deadline, _)| *deadline).min()
    }

    // ------------------------------------------------------------------
    // Termination
    // ------------------------------------------------------------------

    /// Terminates a process: fans monitor and link signals out to its
    /// peers, records the exit reason, and drops the context.
    pub fn terminate_process(&mut self, mut ctx: Context) {
        self.cancel_timeout(ctx.pid);
        let normal = ctx.exit_reason == Term::atom(defaults::NORMAL);
        tracing::debug!(pid = ctx.pid, normal, "process terminated");

        let monitors = core::mem::take(&mut ctx.monitors);
        for monitor in monitors {
            if monitor.peer == ctx.pid {
                continue;
            }
            if monitor.linked {
                let mut kill = false;
                let mut delivered = false;
                if let Some(target) = self.processes.get_mut(&monitor.peer) {
                    if target.trap_exit {
                        // {'EXIT', From, Reason}
                        let size = 4 + ctx.heap.tree_size(ctx.exit_reason);
                        if target.ensure_free(size).is_ok() {
                            let reason = target.heap.copy_tree_from(Some(&ctx.heap), ctx.exit_reason);
                            let tuple = target.heap.alloc_tuple(3);
                            target.heap.put_tuple_element(tuple, 0, Term::atom(defaults::EXIT_TAG));
                            target.heap.put_tuple_element(tuple, 1, Term::pid(ctx.pid));
                            target.heap.put_tuple_element(tuple, 2, reason);
                            target.mailbox.push(tuple);
                            delivered = true;
                        }
                    } else if !normal {
                        let size = ctx.heap.tree_size(ctx.exit_reason);
                        if target.ensure_free(size).is_ok() {
                            target.exit_reason =
                                target.heap.copy_tree_from(Some(&ctx.heap), ctx.exit_reason);
                        } else {
                            target.exit_reason = Term::atom(defaults::OUT_OF_MEMORY);
                        }
                        kill = true;
                    }
                }
                if kill {
                    if let Some(victim) = self.processes.remove(&monitor.peer) {
                        self.ready.retain(|p| *p != monitor.peer);
                        self.terminate_process(victim);
                    }
                } else if delivered {
                    self.wake_for_message(monitor.peer);
                }
            } else {
                // {'DOWN', Ref, process, From, Reason}
                let delivered = if let Some(target) = self.processes.get_mut(&monitor.peer) {
                    let size = 2 + 6 + ctx.heap.tree_size(ctx.exit_reason);
                    if target.ensure_free(size).is_ok() {
                        let reference = target.heap.alloc_ref(monitor.ref_ticks);
                        let reason = target.heap.copy_tree_from(Some(&ctx.heap), ctx.exit_reason);
                        let tuple = target.heap.alloc_tuple(5);
                        target.heap.put_tuple_element(tuple, 0, Term::atom(defaults::DOWN));
                        target.heap.put_tuple_element(tuple, 1, reference);
                        target.heap.put_tuple_element(tuple, 2, Term::atom(defaults::PROCESS));
                        target.heap.put_tuple_element(tuple, 3, Term::pid(ctx.pid));
                        target.heap.put_tuple_element(tuple, 4, reason);
                        target.mailbox.push(tuple);
                        true
                    } else {
                        false
                    }
                } else {
                    false
                };
                if delivered {
                    self.wake_for_message(monitor.peer);
                }
            }
        }

        let reason = Value::from_term(&self.atoms, &ctx.heap, ctx.exit_reason);
        self.exited.insert(ctx.pid, reason);
        self.ready.retain(|p| *p != ctx.pid);
        self.processes.remove(&ctx.pid);
    }
}

impl Default for GlobalContext {
    fn default() -> Self {
        Self::new()
    }
}

//! The process: registers, heap region, mailbox, monitors and flags.

use crate::heap::{Heap, OutOfMemory};
use crate::mailbox::Mailbox;
use crate::term::Term;

/// Number of x-registers per process.
pub const X_REGS: usize = 16;

bitflags::bitflags! {
    /// Scheduling flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProcessFlags: u32 {
        /// A receive timeout is armed.
        const WAITING_TIMEOUT = 0x01;
        /// The armed timeout fired; the next receive takes its timeout
        /// branch.
        const WAITING_TIMEOUT_EXPIRED = 0x02;
    }
}

/// Whether a suspended process may be picked by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// In the ready queue (or currently executing).
    Runnable,
    /// Blocked in a receive.
    Waiting,
}

/// A monitor or link entry held by the process that will emit the signal
/// when it terminates. `peer` is looked up by pid on use, never held as
/// a pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Monitor {
    /// The observing (monitor) or linked peer process.
    pub peer: u32,
    /// Reference ticks identifying the monitor.
    pub ref_ticks: u64,
    /// Link entry rather than monitor entry.
    pub linked: bool,
}

/// Per-process execution state.
#[derive(Debug)]
pub struct Context {
    /// Process id.
    pub pid: u32,
    /// Argument/temporary registers.
    pub x: [Term; X_REGS],
    /// Heap, stack and fragment space.
    pub heap: Heap,
    /// Saved continuation pointer.
    pub cp: u64,
    /// Module registry index to resume in.
    pub saved_module: usize,
    /// Code offset to resume at.
    pub saved_ip: usize,
    /// Label to resume at instead of `saved_ip` when a message arrives
    /// (the receive-retry label of `wait_timeout`).
    pub restore_label: Option<u32>,
    /// Message queue.
    pub mailbox: Mailbox,
    /// Process dictionary.
    pub dictionary: Vec<(Term, Term)>,
    /// Monitors and links to fan out on termination.
    pub monitors: Vec<Monitor>,
    /// Scheduling flags.
    pub flags: ProcessFlags,
    /// Deliver exit signals as messages instead of dying.
    pub trap_exit: bool,
    /// Group leader pid.
    pub group_leader: Term,
    /// Exit reason once terminated.
    pub exit_reason: Term,
    /// Current bitstring build target.
    pub bs: Term,
    /// Bit offset into the build target.
    pub bs_offset: usize,
    /// Scheduler status while suspended.
    pub status: Status,
}

impl Context {
    /// Fresh process with an empty region.
    pub fn new(pid: u32) -> Self {
        Context {
            pid,
            x: [Term::NIL; X_REGS],
            heap: Heap::new(),
            cp: Term::CP_SENTINEL,
            saved_module: 0,
            saved_ip: 0,
            restore_label: None,
            mailbox: Mailbox::new(),
            dictionary: Vec::new(),
            monitors: Vec::new(),
            flags: ProcessFlags::empty(),
            trap_exit: false,
            group_leader: Term::pid(0),
            exit_reason: Term::atom(crate::atom::defaults::NORMAL),
            bs: Term::INVALID,
            bs_offset: 0,
            status: Status::Runnable,
        }
    }

    /// Clears x-registers at `live` and above so dead values do not pin
    /// garbage through a collection.
    pub fn clean_registers(&mut self, live: usize) {
        for reg in self.x.iter_mut().skip(live) {
            *reg = Term::NIL;
        }
    }

    /// Guarantees `need` words of heap headroom, collecting with the
    /// full root set if necessary. Every decoded term not reachable from
    /// the roots is invalid afterwards.
    pub fn ensure_free(&mut self, need: usize) -> Result<(), OutOfMemory> {
        if self.heap.free() >= need
            && self.heap.fragments_len() < crate::heap::FRAGMENT_MERGE_LIMIT
        {
            return Ok(());
        }
        self.collect_with_roots(need)
    }

    fn collect_with_roots(&mut self, need: usize) -> Result<(), OutOfMemory> {
        let Context {
            heap,
            x,
            dictionary,
            mailbox,
            exit_reason,
            bs,
            ..
        } = self;
        let mut roots: Vec<&mut Term> = Vec::with_capacity(X_REGS + 2 + dictionary.len() * 2 + mailbox.len());
        roots.extend(x.iter_mut());
        for (key, value) in dictionary.iter_mut() {
            roots.push(key);
            roots.push(value);
        }
        roots.extend(mailbox.terms_mut());
        roots.push(exit_reason);
        roots.push(bs);
        heap.collect(need, &mut roots)
    }

    /// [`Context::clean_registers`] followed by [`Context::ensure_free`]:
    /// the GC-BIF and `allocate`/`test_heap` entry point.
    pub fn ensure_free_with_live(&mut self, live: usize, need: usize) -> Result<(), OutOfMemory> {
        self.clean_registers(live);
        self.ensure_free(need)
    }

    /// Unconditional collection targeting `need` free words, used to
    /// shrink a grossly over-allocated heap.
    pub fn force_collect(&mut self, live: usize, need: usize) -> Result<(), OutOfMemory> {
        self.clean_registers(live);
        self.collect_with_roots(need)
    }

    /// Registers a monitor (or link) entry on this process and returns
    /// the identifying reference ticks.
    pub fn add_monitor(&mut self, peer: u32, ref_ticks: u64, linked: bool) -> u64 {
        self.monitors.push(Monitor {
            peer,
            ref_ticks,
            linked,
        });
        ref_ticks
    }

    /// Drops the first matching monitor (or link) entry.
    pub fn demonitor(&mut self, peer: u32, linked: bool) {
        if let Some(at) = self
            .monitors
            .iter()
            .position(|m| m.peer == peer && m.linked == linked)
        {
            self.monitors.remove(at);
        }
    }

    /// Drops a monitor entry by its reference.
    pub fn demonitor_by_ref(&mut self, ref_ticks: u64) {
        self.monitors.retain(|m| m.ref_ticks != ref_ticks || m.linked);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_registers_clears_the_tail() {
        let mut ctx = Context::new(1);
        ctx.x = [Term::small(7); X_REGS];
        ctx.clean_registers(2);
        assert_eq!(ctx.x[1], Term::small(7));
        assert_eq!(ctx.x[2], Term::NIL);
        assert_eq!(ctx.x[15], Term::NIL);
    }

    #[test]
    fn ensure_free_keeps_register_roots() {
        let mut ctx = Context::new(1);
        let t = {
            ctx.ensure_free(8).expect("room");
            let t = ctx.heap.alloc_tuple(1);
            ctx.heap.put_tuple_element(t, 0, Term::small(3));
            t
        };
        ctx.x[0] = t;
        ctx.ensure_free(4096).expect("grows");
        assert_eq!(ctx.heap.tuple_element(ctx.x[0], 0), Term::small(3));
    }

    #[test]
    fn monitors_add_and_remove() {
        let mut ctx = Context::new(1);
        ctx.add_monitor(7, 100, false);
        ctx.add_monitor(8, 101, true);
        ctx.demonitor(8, true);
        assert_eq!(ctx.monitors.len(), 1);
        ctx.demonitor_by_ref(100);
        assert!(ctx.monitors.is_empty());
    }
}

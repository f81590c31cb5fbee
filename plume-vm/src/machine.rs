//! The embedding surface: load, spawn, run, inspect.
//!
//! ```no_run
//! use plume_vm::{Machine, Value};
//!
//! let image: Vec<u8> = std::fs::read("factorial.beam").unwrap();
//! let mut machine = Machine::new();
//! machine.load_module(&image).unwrap();
//! let pid = machine
//!     .spawn("factorial", "start", &[Value::Int(10)])
//!     .unwrap();
//! machine.run().unwrap();
//! assert!(machine.exit_reason(pid).is_some());
//! ```

use crate::error::{LoadError, VmError};
use crate::global::GlobalContext;
use crate::module::Module;
use crate::nif::NifFn;
use crate::scheduler;
use crate::term::Term;
use crate::value::Value;

/// Why a spawn request was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpawnError {
    /// No module with that name is loaded.
    #[error("module {0} is not loaded")]
    NoModule(String),
    /// The module does not export `function/arity`.
    #[error("{module}:{function}/{arity} is not exported")]
    NotExported {
        /// Module name.
        module: String,
        /// Function name.
        function: String,
        /// Requested arity.
        arity: usize,
    },
    /// More arguments than argument registers.
    #[error("too many arguments")]
    TooManyArguments,
    /// The initial arguments did not fit the fresh heap.
    #[error("arguments exceed the heap limit")]
    OutOfMemory,
}

/// A virtual machine instance: one global context plus the scheduler.
#[derive(Debug, Default)]
pub struct Machine {
    global: GlobalContext,
}

impl Machine {
    /// Machine with the default BIF and NIF sets.
    pub fn new() -> Self {
        Machine {
            global: GlobalContext::new(),
        }
    }

    /// Registers a host NIF under `module:function/arity`. Modules
    /// loaded afterwards resolve imports against it.
    pub fn register_nif(&mut self, module: &str, function: &str, arity: u32, f: NifFn) {
        let module = self.global.atoms.insert(module);
        let function = self.global.atoms.insert(function);
        self.global.nifs.register(module, function, arity, f);
    }

    /// Loads one module image, returning the module name.
    pub fn load_module(&mut self, image: &[u8]) -> Result<String, LoadError> {
        let module = Module::load(
            image.to_vec(),
            &mut self.global.atoms,
            &self.global.bifs,
            &self.global.nifs,
        )?;
        let name = self.global.atoms.name(module.name_atom).to_string();
        self.global.register_module(module);
        Ok(name)
    }

    /// Loads every module of an AVM pack archive. Returns the name of
    /// the start module, if the archive marks one.
    pub fn load_pack(&mut self, data: &[u8]) -> Result<Option<String>, LoadError> {
        let records = plume_asm::pack::records(data)?;
        let mut start = None;
        for record in records {
            if !record.is_beam() {
                continue;
            }
            let name = self.load_module(record.data)?;
            if record.is_start() {
                start = Some(name);
            }
        }
        Ok(start)
    }

    /// Spawns a process running an exported `module:function(args)` and
    /// returns its pid. The process runs when [`Machine::run`] drives
    /// the scheduler.
    pub fn spawn(&mut self, module: &str, function: &str, args: &[Value]) -> Result<u32, SpawnError> {
        if args.len() > crate::context::X_REGS {
            return Err(SpawnError::TooManyArguments);
        }
        let module_atom = self
            .global
            .atoms
            .find(module)
            .ok_or_else(|| SpawnError::NoModule(module.to_string()))?;
        let target = self
            .global
            .module_by_atom(module_atom)
            .ok_or_else(|| SpawnError::NoModule(module.to_string()))?;
        let function_atom = self.global.atoms.insert(function);
        let label = target
            .search_exported(function_atom, args.len() as u32)
            .ok_or_else(|| SpawnError::NotExported {
                module: module.to_string(),
                function: function.to_string(),
                arity: args.len(),
            })?;

        let mut ctx = self.global.new_context();
        for (slot, arg) in args.iter().enumerate() {
            ctx.x[slot] = arg
                .build(&mut self.global.atoms, &mut ctx)
                .map_err(|_| SpawnError::OutOfMemory)?;
        }
        ctx.saved_module = target.index;
        ctx.saved_ip = target
            .label_offset(label)
            .ok_or_else(|| SpawnError::NotExported {
                module: module.to_string(),
                function: function.to_string(),
                arity: args.len(),
            })?;
        // Returning from the entry function runs into `int_code_end`,
        // which terminates the process normally.
        ctx.cp = Term::cp(target.index, target.end_offset);
        Ok(self.global.commit_process(ctx))
    }

    /// Drives the scheduler until no process is runnable and no timer
    /// is pending.
    pub fn run(&mut self) -> Result<(), VmError> {
        scheduler::run(&mut self.global)
    }

    /// Whether a process is still alive.
    pub fn is_alive(&self, pid: u32) -> bool {
        self.global.is_alive(pid)
    }

    /// Exit reason of a terminated process.
    pub fn exit_reason(&self, pid: u32) -> Option<&Value> {
        self.global.exit_reason(pid)
    }

    /// Snapshot of a live process's message queue, oldest first.
    pub fn mailbox(&self, pid: u32) -> Vec<Value> {
        match self.global.processes.get(&pid) {
            Some(ctx) => ctx
                .mailbox
                .terms()
                .map(|t| Value::from_term(&self.global.atoms, &ctx.heap, *t))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Delivers a message to a live process from outside the machine.
    pub fn send(&mut self, pid: u32, message: &Value) {
        let Some(mut ctx) = self.global.take_process(pid) else {
            return;
        };
        match message.build(&mut self.global.atoms, &mut ctx) {
            Ok(term) => {
                ctx.mailbox.push(term);
                self.global.put_process(ctx);
                self.global.wake_for_message(pid);
            }
            Err(_) => {
                tracing::warn!(pid, "host message dropped: heap limit");
                self.global.put_process(ctx);
            }
        }
    }

    /// The global context, for embedders that need lower-level access.
    pub fn global(&self) -> &GlobalContext {
        &self.global
    }

    /// Mutable access to the global context.
    pub fn global_mut(&mut self) -> &mut GlobalContext {
        &mut self.global
    }
}

//! Round-robin cooperative scheduler.
//!
//! The driver owns exactly one running process at a time: it takes the
//! context out of the registry, runs the interpreter for one quantum,
//! and routes the outcome. When nothing is runnable it sleeps until the
//! nearest timer deadline; with no timers left it returns, leaving any
//! still-waiting processes suspended for the embedder to inspect.

use std::time::Instant;

use crate::context::Status;
use crate::error::VmError;
use crate::global::GlobalContext;
use crate::interpreter::{self, Outcome};

/// Runs until no process is runnable and no timer is pending.
pub(crate) fn run(global: &mut GlobalContext) -> Result<(), VmError> {
    loop {
        global.fire_due_timers();

        let Some(pid) = global.ready_pop() else {
            match global.next_deadline() {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline > now {
                        std::thread::sleep(deadline - now);
                    }
                    continue;
                }
                None => return Ok(()),
            }
        };

        let Some(mut ctx) = global.take_process(pid) else {
            continue;
        };

        match interpreter::execute(global, &mut ctx) {
            Ok(Outcome::Yielded) => {
                ctx.status = Status::Runnable;
                global.put_process(ctx);
                global.ready_push(pid);
            }
            Ok(Outcome::Waiting) => {
                ctx.status = Status::Waiting;
                global.put_process(ctx);
            }
            Ok(Outcome::Terminated) => {
                global.terminate_process(ctx);
            }
            Err(fatal) => {
                tracing::error!(pid, error = %fatal, "machine abort");
                global.put_process(ctx);
                return Err(fatal);
            }
        }
    }
}

//! Program supervisor (§4.6 "Program startup/shutdown").
//!
//! Implements the `seq(program, macroString, stackSize)` entry point: the
//! full sequence from a freshly-parsed compiler descriptor to N running
//! state-set threads, and the mirror-image shutdown. Grounded on the
//! original's `seq()`/`sequencer()` in `seq_main.c` for the step ordering,
//! and on the `lazy_static!`-backed process-wide singleton pattern used for
//! connection registries for the auxiliary-fiber idempotence requirement
//! (§4.6 step 6: "singleton auxiliary fiber spawn, idempotent,
//! process-wide").

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use lazy_static::lazy_static;

use crate::compiler::CompiledProgram;
use crate::error::Error;
use crate::program::Program;
use crate::pv::PvProvider;
use crate::registry;

/// The smallest stack `seq()` will honor for a state-set thread, mirroring
/// the original's `SMALL_STACK` floor so a too-small caller-supplied value
/// cannot produce a thread that overflows before its first guard check.
pub const SMALL_STACK: usize = 64 * 1024;

/// The ceiling a requested thread priority is clamped to — this runtime
/// has no portable way to *raise* a thread's OS scheduling priority (no
/// such call exists in `std::thread`), so a request above the ceiling is
/// silently capped rather than rejected (§9 Open Question: "thread
/// priority is a hint, never escalated").
pub const THREAD_PRIORITY_CEILING: u8 = 99;

/// Options accepted by [`seq`], mirroring the original's `seq(pProg,
/// macroString, stackSize)` triple plus the provider name and priority
/// that command-line macros (`pvsys`, `priority`) can also supply.
#[derive(Debug, Clone, Default)]
pub struct SeqOptions {
    pub macro_string: String,
    pub stack_size: Option<usize>,
    pub priority: Option<u8>,
}

lazy_static! {
    static ref AUX_FIBER_STARTED: AtomicBool = AtomicBool::new(false);
}

/// Ensure the process-wide auxiliary fiber (here: a detached thread that
/// exists purely so its spawn is observable exactly once) has started.
/// Idempotent across every program loaded in the process (§4.6 step 6).
fn ensure_aux_fiber() {
    if AUX_FIBER_STARTED
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        thread::Builder::new()
            .name("seq_aux".into())
            .spawn(|| {
                // Reserved for process-wide timer/housekeeping work a real
                // deployment's PV provider might need pumped from a
                // dedicated thread. Nothing to do yet.
            })
            .ok();
    }
}

/// Resolve `pvsys` from the command-line/program-statement macro table,
/// defaulting to `"ca"` as the original does when the macro is absent
/// (§6 "CLI/host surface").
fn resolve_pvsys(program: &Program) -> String {
    program
        .macros
        .get("pvsys")
        .unwrap_or("ca")
        .to_string()
}

/// Start a program: resolve macros, create the PV context, assign and
/// monitor every channel, then spawn one thread per state set (§4.6 steps
/// 1-8). Returns the running [`Program`], already registered with
/// [`crate::registry`].
pub fn seq(
    compiled: CompiledProgram,
    options: SeqOptions,
    provider: Arc<dyn PvProvider>,
) -> Result<Arc<Program>, Error> {
    let program = Program::new(compiled, &options.macro_string, provider)?;

    let pvsys = resolve_pvsys(&program);
    program
        .provider
        .create_context(&pvsys)
        .map_err(Error::Provider)?;

    ensure_aux_fiber();
    program.run_init_func();

    program.assign_channel_names()?;

    let stack_size = options.stack_size.unwrap_or(SMALL_STACK).max(SMALL_STACK);
    let priority = options.priority.unwrap_or(0).min(THREAD_PRIORITY_CEILING);

    registry::register(Arc::clone(&program));

    for state_set in program.state_sets.clone() {
        let program_for_thread = Arc::clone(&program);
        let thread_name = format!("{}:{}", program.name, state_set.name);
        let builder = thread::Builder::new()
            .name(thread_name)
            .stack_size(stack_size);
        builder.spawn(move || {
            if program_for_thread
                .options
                .contains(crate::compiler::ProgramOptions::CONNECT_BEFORE_START)
            {
                program_for_thread.wait_connect_barrier();
            }
            state_set.run();
        })?;
    }
    let _ = priority; // no portable std API to apply an OS thread priority

    Ok(program)
}

/// Stop a running program and deregister it (§4.6 shutdown sequencing:
/// "signal all SS fibers, await death semaphores, cancel monitors,
/// disconnect channels, close logs, deregister from global registry").
pub fn stop(program: &Arc<Program>) {
    program.shutdown();
    registry::deregister(program);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::*;
    use crate::pv::mock::MockProvider;
    use crate::vararea::VarArea;
    use std::time::Duration;

    fn transient_state() -> CompiledState {
        CompiledState {
            name: "s".into(),
            event_mask: 0,
            options: StateOptions::empty(),
            evaluator: Arc::new(|_v: &VarArea, _ctx| None),
            action: Arc::new(|_v, _t| {}),
            delay_init: Arc::new(|_v, _d| {}),
            entry_hook: None,
            exit_hook: None,
            max_delays: 0,
        }
    }

    fn minimal_program() -> CompiledProgram {
        CompiledProgram {
            magic: MAGIC,
            name: "seqtest".into(),
            options: ProgramOptions::empty(),
            var_size: 8,
            params: String::new(),
            num_event_flags: 1,
            state_sets: vec![CompiledStateSet {
                name: "ss0".into(),
                states: vec![transient_state()],
                channel_ids: Vec::new(),
            }],
            channels: Vec::new(),
            queues: Vec::new(),
            init_func: None,
            entry_func: None,
            exit_func: None,
        }
    }

    #[test]
    fn seq_spawns_a_thread_per_state_set_and_stops_cleanly() {
        let provider = MockProvider::new();
        let program = seq(
            minimal_program(),
            SeqOptions::default(),
            provider as Arc<dyn PvProvider>,
        )
        .unwrap();
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(program.state_sets.len(), 1);
        stop(&program);
    }
}

//! A loaded program (§3 "Program").
//!
//! [`Program`] owns everything a running instance needs once the compiler
//! descriptor has been resolved against a macro string and a PV provider:
//! the channel table, the event-flag set, the sync queues, the shared
//! variable area, and the connect/assign bookkeeping the all-first-
//! connect-and-monitor barrier waits on (§4.6 step 8). Built with
//! [`std::sync::Arc::new_cyclic`] so that [`crate::channel::Channel`] and
//! [`crate::stateset::StateSet`] can each hold a [`Weak`] back-reference
//! without a reference cycle — the same back-reference shape used between
//! a space and its owning connection elsewhere in this codebase's lineage.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use crate::channel::Channel;
use crate::compiler::{CompiledProgram, ProgramOptions};
use crate::error::Error;
use crate::event::EventFlagSet;
use crate::log::{SayLevel, SeqLogger};
use crate::macros::MacroTable;
use crate::pv::PvProvider;
use crate::stateset::StateSet;
use crate::sync::{Cond, Latch};
use crate::syncqueue::{Payload, SyncQueue};
use crate::vararea::VarArea;

/// A running program instance (§3 "Program").
pub struct Program {
    pub name: String,
    pub options: ProgramOptions,
    pub logger: SeqLogger,
    pub event_flags: EventFlagSet,
    pub provider: Arc<dyn PvProvider>,
    pub channels: Vec<Arc<Channel>>,
    pub queues: Vec<SyncQueue>,
    pub state_sets: Vec<Arc<StateSet>>,
    /// Authoritative variable area in non-safe mode; in safe mode this is
    /// only the seed each state set's private shadow is cloned from at
    /// construction (§4.3 "Safe mode").
    pub var_area: Latch<VarArea>,
    pub connect_count: AtomicUsize,
    pub assign_count: AtomicUsize,
    /// Program-statement macros layered with command-line macros, later
    /// wins (§4.4). Kept so [`crate::supervisor`] can resolve channel name
    /// templates with the same table [`Program::new`] was built from.
    pub macros: MacroTable,
    /// Program-level initializer, run once before any state-set thread is
    /// spawned (§4.6 startup step 6: "Invoke user `initFunc`").
    init_func: Option<Arc<crate::compiler::Hook>>,
    /// Program-level finalizer, run once at the start of shutdown (§4.6
    /// "Shutdown: triggered by user `exitFunc` request or external stop").
    exit_func: Option<Arc<crate::compiler::Hook>>,
    connect_barrier: Cond,
}

impl Program {
    /// Resolve a compiler descriptor into a running program: check the
    /// magic number, layer macros (program-statement, then command line,
    /// later wins, §4.4), build the channel table, and spin up one
    /// [`StateSet`] per compiled state set without yet starting its
    /// thread — that is [`crate::supervisor`]'s job (§4.6).
    pub fn new(
        compiled: CompiledProgram,
        command_line_macros: &str,
        provider: Arc<dyn PvProvider>,
    ) -> Result<Arc<Program>, Error> {
        compiled.check_magic()?;

        let mut macros = MacroTable::new();
        macros.parse(&compiled.params);
        macros.parse(command_line_macros);

        let safe_mode = compiled.options.contains(ProgramOptions::SAFE);
        let debug_default = compiled.options.contains(ProgramOptions::DEBUG);
        let logger = SeqLogger::stdout(if debug_default {
            SayLevel::Debug
        } else {
            SayLevel::Info
        });

        for c in &compiled.channels {
            if crate::pv::PvType::from_var_type(&c.var_type).is_none() {
                return Err(crate::error::StartupError::UnknownVarType(c.var_type.clone()).into());
            }
        }

        let seed_var_area = VarArea::new(compiled.var_size);
        let num_ss = compiled.state_sets.len();
        let init_func = compiled.init_func.clone();
        let exit_func = compiled.exit_func.clone();

        let program = Arc::new_cyclic(|weak: &Weak<Program>| {
            let channels: Vec<Arc<Channel>> = compiled
                .channels
                .iter()
                .enumerate()
                .map(|(id, c)| {
                    Arc::new(
                        Channel::new(id, c, num_ss, weak.clone())
                            .expect("channel var types were validated above"),
                    )
                })
                .collect();

            let queues: Vec<SyncQueue> = compiled
                .queues
                .iter()
                .filter_map(|q| SyncQueue::new(q.capacity, q.event_flag))
                .collect();

            let state_sets: Vec<Arc<StateSet>> = compiled
                .state_sets
                .into_iter()
                .enumerate()
                .map(|(id, css)| {
                    StateSet::new(id, css, weak.clone(), safe_mode, seed_var_area.clone())
                })
                .collect();

            Program {
                name: compiled.name,
                options: compiled.options,
                logger,
                event_flags: EventFlagSet::new(),
                provider,
                channels,
                queues,
                state_sets,
                var_area: Latch::new(seed_var_area),
                connect_count: AtomicUsize::new(0),
                assign_count: AtomicUsize::new(0),
                macros,
                init_func,
                exit_func,
                connect_barrier: Cond::new(),
            }
        });

        for ss in &program.state_sets {
            program.event_flags.register(Arc::clone(&ss.waiter));
        }

        Ok(program)
    }

    /// Run the compiler-emitted program initializer, if any (§4.6 startup
    /// step 6). Called by [`crate::supervisor::seq`] after the auxiliary
    /// fiber is ensured and before any state-set thread is spawned, so it
    /// sees an otherwise-untouched variable area.
    pub fn run_init_func(&self) {
        if let Some(hook) = &self.init_func {
            hook(&mut self.var_area.lock());
        }
    }

    /// Run the compiler-emitted program finalizer, if any (§4.6 "Shutdown:
    /// triggered by user `exitFunc` request"). Called at the start of
    /// [`Program::shutdown`], before any state set is signaled to stop.
    fn run_exit_func(&self) {
        if let Some(hook) = &self.exit_func {
            hook(&mut self.var_area.lock());
        }
    }

    /// Resolve `{macro}` templates against this program's macro table and
    /// assign every channel (§4.6 step 8, first half). Call before
    /// spawning any state-set thread.
    pub fn assign_channel_names(&self) -> Result<(), Error> {
        for channel in &self.channels {
            let resolved = self.macros.expand(&channel.name_template);
            Arc::clone(channel).assign(resolved)?;
        }
        Ok(())
    }

    /// Push a monitored value onto sync queue `index`. Returns `true` if
    /// the queue was full and the value was dropped.
    pub fn push_sync_queue(&self, index: usize, payload: Payload) -> bool {
        match self.queues.get(index) {
            Some(queue) => queue.push(payload),
            None => true,
        }
    }

    /// Overwrite `len(data)` bytes of the shared (non-safe-mode) variable
    /// area at `offset` — called directly from a provider callback thread
    /// (§4.3: non-safe mode has no deferred commit step).
    pub fn write_shared_var(&self, offset: usize, data: &[u8]) {
        self.var_area.lock().write_bytes(offset, data);
    }

    /// Block the calling thread until every channel has connected (and, if
    /// monitored, delivered its first update) or `+c` was not requested —
    /// in which case this returns immediately (§4.6 step 8 "connect-before-
    /// start").
    pub fn wait_connect_barrier(&self) {
        if !self.options.contains(ProgramOptions::CONNECT_BEFORE_START) {
            return;
        }
        while !self.all_channels_ready() {
            self.connect_barrier.wait();
        }
    }

    fn all_channels_ready(&self) -> bool {
        self.channels.iter().all(|c| c.ready_for_barrier())
    }

    /// Called by a channel whenever its connection state changes; wakes
    /// anything blocked in [`Program::wait_connect_barrier`].
    pub fn maybe_release_connect_barrier(&self) {
        if self.all_channels_ready() {
            self.connect_barrier.signal();
        }
    }

    /// Signal every state set to stop and wait for each to exit its loop,
    /// then disconnect the PV context (§4.6 shutdown sequencing).
    pub fn shutdown(&self) {
        self.run_exit_func();
        for ss in &self.state_sets {
            ss.request_shutdown();
        }
        for ss in &self.state_sets {
            ss.await_death();
        }
        for channel in &self.channels {
            channel.teardown();
        }
        self.provider.destroy_context();
    }

    /// Human-readable snapshot of this program's channel table, in the
    /// spirit of the original's `seqShow()` (§10.5).
    pub fn describe(&self) -> String {
        let mut out = format!(
            "program {} ({} state sets, {} channels, {}/{} connected/assigned)\n",
            self.name,
            self.state_sets.len(),
            self.channels.len(),
            self.connect_count.load(Ordering::SeqCst),
            self.assign_count.load(Ordering::SeqCst),
        );
        for channel in &self.channels {
            let (status, severity, _) = channel.status_snapshot();
            out.push_str(&format!(
                "  {} -> {} connected={} status={} severity={}",
                channel.var_name,
                channel.resolved_name(),
                channel.is_connected(),
                status,
                severity,
            ));
            if let Some(err) = channel.last_error() {
                out.push_str(&format!(" last_error={}", err));
            }
            out.push('\n');
        }
        out
    }
}

#[cfg(test)]
pub mod test_support {
    use super::*;
    use crate::compiler::{CompiledChannel, CompiledProgram, CompiledStateSet, ProgramOptions, MAGIC};
    use crate::pv::mock::MockProvider;
    use std::ops::Deref;

    /// A [`Program`] wired to an in-memory [`MockProvider`], for tests in
    /// [`crate::channel`] and [`crate::stateset`] that need a real owner
    /// to hand out `Weak<Program>` back-references.
    pub struct TestProgram {
        pub program: Arc<Program>,
        provider: Arc<MockProvider>,
    }

    impl Deref for TestProgram {
        type Target = Program;
        fn deref(&self) -> &Program {
            &self.program
        }
    }

    impl TestProgram {
        pub fn provider_mock(&self) -> &MockProvider {
            &self.provider
        }
    }

    fn idle_state() -> crate::compiler::CompiledState {
        crate::compiler::CompiledState {
            name: "idle".into(),
            event_mask: 0,
            options: crate::compiler::StateOptions::empty(),
            evaluator: Arc::new(|_v, _ctx| None),
            action: Arc::new(|_v, _t| {}),
            delay_init: Arc::new(|_v, _d| {}),
            entry_hook: None,
            exit_hook: None,
            max_delays: 0,
        }
    }

    pub fn test_program(channels: Vec<CompiledChannel>, num_ss: usize) -> TestProgram {
        let provider = MockProvider::new();
        let compiled = CompiledProgram {
            magic: MAGIC,
            name: "test".into(),
            options: ProgramOptions::empty(),
            var_size: 64,
            params: String::new(),
            num_event_flags: 8,
            state_sets: (0..num_ss)
                .map(|i| CompiledStateSet {
                    name: format!("ss{}", i),
                    states: vec![idle_state()],
                    channel_ids: Vec::new(),
                })
                .collect(),
            channels,
            queues: Vec::new(),
            init_func: None,
            entry_func: None,
            exit_func: None,
        };
        let program = Program::new(compiled, "", Arc::clone(&provider) as Arc<dyn PvProvider>)
            .expect("test program descriptor is well-formed");
        TestProgram { program, provider }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::test_program;
    use super::*;
    use crate::compiler::{CompiledProgram, CompiledStateSet, ProgramOptions, MAGIC};
    use crate::pv::mock::MockProvider;

    #[test]
    fn init_func_and_exit_func_run_against_the_shared_var_area() {
        let provider = MockProvider::new();
        let compiled = CompiledProgram {
            magic: MAGIC,
            name: "hooks".into(),
            options: ProgramOptions::empty(),
            var_size: 8,
            params: String::new(),
            num_event_flags: 1,
            state_sets: vec![CompiledStateSet {
                name: "ss0".into(),
                states: vec![test_support_idle_state()],
                channel_ids: Vec::new(),
            }],
            channels: Vec::new(),
            queues: Vec::new(),
            init_func: Some(Arc::new(|v| unsafe { v.write::<i32>(0, 1) })),
            entry_func: None,
            exit_func: Some(Arc::new(|v| unsafe { v.write::<i32>(0, 2) })),
        };
        let program = Program::new(compiled, "", Arc::clone(&provider) as Arc<dyn PvProvider>)
            .unwrap();
        program.run_init_func();
        assert_eq!(unsafe { program.var_area.lock().read::<i32>(0) }, 1);
        program.run_exit_func();
        assert_eq!(unsafe { program.var_area.lock().read::<i32>(0) }, 2);
    }

    fn test_support_idle_state() -> crate::compiler::CompiledState {
        crate::compiler::CompiledState {
            name: "idle".into(),
            event_mask: 0,
            options: crate::compiler::StateOptions::empty(),
            evaluator: Arc::new(|_v, _ctx| None),
            action: Arc::new(|_v, _t| {}),
            delay_init: Arc::new(|_v, _d| {}),
            entry_hook: None,
            exit_hook: None,
            max_delays: 0,
        }
    }

    #[test]
    fn describe_reports_counts_for_a_channel_free_program() {
        let test = test_program(Vec::new(), 2);
        let out = test.program.describe();
        assert!(out.contains("2 state sets"));
        assert!(out.contains("0 channels"));
    }
}

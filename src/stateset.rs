//! The state-set fiber (§3 "State set (SS)", §4.5 "State-set scheduling").
//!
//! Each [`StateSet`] runs its own main loop, one per OS thread (§5:
//! "Preemptive OS threads (priority-scheduled)" — a deliberate departure
//! from the cooperative single-thread fiber scheduler a `fiber` module
//! would assume). The loop shape itself — wait for a wake condition,
//! re-evaluate every guard regardless of why it woke, run at most one
//! transition, repeat — is grounded on the `fiber::Cond`-based wait/signal
//! idiom in [`crate::sync`], generalized from "wait for one condition" to
//! "wait for the nearest of an event-flag wake or a delay deadline".
//!
//! Before a wake's guards are evaluated, [`StateSet::compute_delay_expired`]
//! computes `delayExpired[0..maxDelays)` (§4.5 step 3b) and hands it to the
//! evaluator through [`crate::compiler::EvalContext`] alongside the
//! variable area (§9's "context handle") — the variable area alone holds
//! no time/delay state, so a `when(delay(d))` guard has no other way to
//! observe that its deadline elapsed.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::compiler::{CompiledState, CompiledStateSet, StateOptions};
use crate::event::Waiter;
use crate::program::Program;
use crate::sync::Cond;
use crate::vararea::VarArea;

/// A state set's view of the variable area: either the program's single
/// shared region (non-safe mode, where a monitor write is visible to every
/// state set as soon as it lands) or this state set's own shadow, updated
/// only by explicit dirty-flag commits at cycle boundaries (safe mode,
/// §4.3 "Safe mode").
enum VarView {
    Shared,
    Private(Mutex<VarArea>),
}

/// One compiler-emitted state set, running its transition loop on its own
/// thread (§4.5).
pub struct StateSet {
    pub id: usize,
    pub name: String,
    states: Vec<CompiledState>,
    pub channel_ids: Vec<usize>,
    program: Weak<Program>,
    current_state: AtomicUsize,
    prev_state: AtomicUsize,
    time_entered: Mutex<f64>,
    delays: Mutex<Vec<f64>>,
    pub waiter: Arc<Waiter>,
    view: VarView,
    shutdown: AtomicBool,
    death: Cond,
}

impl StateSet {
    pub fn new(
        id: usize,
        compiled: CompiledStateSet,
        program: Weak<Program>,
        safe_mode: bool,
        initial_view: VarArea,
    ) -> Arc<StateSet> {
        debug_assert!(!compiled.states.is_empty(), "a state set must have at least one state");
        Arc::new(StateSet {
            id,
            name: compiled.name,
            states: compiled.states,
            channel_ids: compiled.channel_ids,
            program,
            current_state: AtomicUsize::new(0),
            prev_state: AtomicUsize::new(0),
            time_entered: Mutex::new(0.0),
            delays: Mutex::new(Vec::new()),
            waiter: Arc::new(Waiter::new()),
            view: if safe_mode {
                VarView::Private(Mutex::new(initial_view))
            } else {
                VarView::Shared
            },
            shutdown: AtomicBool::new(false),
            death: Cond::new(),
        })
    }

    fn program(&self) -> Arc<Program> {
        self.program.upgrade().expect("state set outlived its program")
    }

    pub fn current_state_index(&self) -> usize {
        self.current_state.load(Ordering::SeqCst)
    }

    fn state(&self, index: usize) -> &CompiledState {
        &self.states[index]
    }

    fn with_var<R>(&self, f: impl FnOnce(&VarArea) -> R) -> R {
        match &self.view {
            VarView::Shared => f(&self.program().var_area.lock()),
            VarView::Private(v) => f(&v.lock().unwrap()),
        }
    }

    fn with_var_mut<R>(&self, f: impl FnOnce(&mut VarArea) -> R) -> R {
        match &self.view {
            VarView::Shared => f(&mut self.program().var_area.lock()),
            VarView::Private(v) => f(&mut v.lock().unwrap()),
        }
    }

    /// Commit pending safe-mode monitor values for this state set's
    /// channels into its private view (§4.5 step 3a). A no-op in non-safe
    /// mode, where writes already landed in the shared area.
    fn commit_dirty(&self) {
        if matches!(self.view, VarView::Shared) {
            return;
        }
        let program = self.program();
        for &channel_id in &self.channel_ids {
            let channel = &program.channels[channel_id];
            if let Some(bytes) = channel.take_dirty(self.id) {
                self.with_var_mut(|v| v.write_bytes(channel.var_offset, &bytes));
            }
        }
    }

    /// Re-populate the delay table and record a fresh entry time for
    /// `index` (§4.5 step 1). Kept separate from [`StateSet::run_entry_hook`]
    /// so a `+e`/`+r` state can reset its timers on a self-transition
    /// without re-running the (suppressed) entry hook (§3 "State" option
    /// bits).
    fn reset_timers(&self, index: usize) {
        let state = self.state(index);
        let mut delays = vec![0.0f64; state.max_delays];
        self.with_var(|v| (state.delay_init)(v, &mut delays));
        *self.delays.lock().unwrap() = delays;
        *self.time_entered.lock().unwrap() = crate::clock::monotonic();
    }

    /// Set the wake mask for `index` and run its entry hook, if any.
    fn run_entry_hook(&self, index: usize) {
        let state = self.state(index);
        self.waiter.set_mask(state.event_mask);
        if let Some(hook) = &state.entry_hook {
            self.with_var_mut(|v| hook(v));
        }
    }

    /// Enter `index` unconditionally: reset timers, then run the entry
    /// hook. Used only for the initial state at startup, where no
    /// self-transition suppression can apply.
    fn enter_state(&self, index: usize) {
        self.reset_timers(index);
        self.run_entry_hook(index);
    }

    fn run_exit_hook(&self, index: usize) {
        if let Some(hook) = &self.state(index).exit_hook {
            self.with_var_mut(|v| hook(v));
        }
    }

    /// Bounded sleep duration until the nearest pending delay would
    /// plausibly matter, or `None` to wait indefinitely for an event flag.
    fn next_timeout(&self) -> Option<Duration> {
        let delays = self.delays.lock().unwrap();
        if delays.is_empty() {
            return None;
        }
        let elapsed = crate::clock::monotonic() - *self.time_entered.lock().unwrap();
        let nearest = delays.iter().cloned().fold(f64::INFINITY, f64::min);
        if !nearest.is_finite() {
            return None;
        }
        let remaining = (nearest - elapsed).max(0.0);
        Some(Duration::from_secs_f64(remaining))
    }

    /// Compute `delayExpired[0..maxDelays)` for the current wake (§4.5 step
    /// 3b): `delayExpired[d] = (now - timeEntered) >= delay[d]`. Must run
    /// before the evaluator is called so a `when(delay(d))` guard can
    /// observe a deadline that just elapsed.
    fn compute_delay_expired(&self) -> Vec<bool> {
        let delays = self.delays.lock().unwrap();
        let elapsed = crate::clock::monotonic() - *self.time_entered.lock().unwrap();
        delays.iter().map(|&d| elapsed >= d).collect()
    }

    /// Evaluate every transition guard of the current state in order and
    /// run the first match (§4.5 step 3c/3d): exit hook of the old state
    /// (unless suppressed on a self-transition), the transition's action
    /// body, then timer reset and entry hook of the new state — each
    /// independently suppressible on a self-transition (§3 "State" option
    /// bits).
    fn try_transition(&self, delay_expired: &[bool]) -> bool {
        let current = self.current_state_index();
        let ctx = crate::compiler::EvalContext::new(delay_expired);
        let matched = match self.with_var(|v| (self.state(current).evaluator)(v, &ctx)) {
            Some(matched) => matched,
            None => return false,
        };
        let target = matched.target_state;
        let is_self = target == current;
        let options = self.state(current).options;

        if !(is_self && options.contains(StateOptions::SUPPRESS_EXIT_TO_SELF)) {
            self.run_exit_hook(current);
        }
        self.with_var_mut(|v| (self.state(current).action)(v, matched.transition_index));

        self.prev_state.store(current, Ordering::SeqCst);
        self.current_state.store(target, Ordering::SeqCst);

        let target_options = self.state(target).options;
        let reset_timers = !is_self || target_options.contains(StateOptions::RESET_TIMERS_ON_ENTRY);
        let run_hook = !is_self || !target_options.contains(StateOptions::SUPPRESS_ENTRY_FROM_SELF);

        if reset_timers {
            self.reset_timers(target);
        }
        if run_hook {
            self.run_entry_hook(target);
        }
        true
    }

    /// Request this state set's loop to exit after its current wake, and
    /// wake it immediately so it notices (§4.6 shutdown sequencing).
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.waiter.wake.signal();
    }

    /// Block until [`StateSet::run`] has observed shutdown and returned
    /// (§4.6: "await death semaphores").
    pub fn await_death(&self) {
        self.death.wait();
    }

    /// The main loop (§4.5 steps 1-3): enter the initial state, then
    /// repeatedly wait for a wake, commit any pending safe-mode values,
    /// and run at most one transition per wake.
    pub fn run(&self) {
        self.enter_state(0);

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match self.next_timeout() {
                Some(timeout) => {
                    self.waiter.wake.wait_timeout(timeout);
                }
                None => {
                    self.waiter.wake.wait();
                }
            }
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.commit_dirty();
            let delay_expired = self.compute_delay_expired();
            self.try_transition(&delay_expired);
        }

        self.death.signal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::*;
    use crate::program::test_support::test_program;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::sync::Arc as StdArc;

    fn counting_state(
        counter: StdArc<StdAtomicUsize>,
        event_mask: u64,
        target: usize,
    ) -> CompiledState {
        CompiledState {
            name: "s".into(),
            event_mask,
            options: StateOptions::empty(),
            evaluator: Arc::new(move |_v: &VarArea, _ctx| {
                Some(TransitionMatch {
                    transition_index: 0,
                    target_state: target,
                })
            }),
            action: Arc::new(move |_v, _t| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            delay_init: Arc::new(|_v, d| d[0] = 0.0),
            entry_hook: None,
            exit_hook: None,
            max_delays: 1,
        }
    }

    #[test]
    fn run_processes_a_transition_then_stops_on_shutdown() {
        let program = test_program(Vec::new(), 1);
        let counter = StdArc::new(StdAtomicUsize::new(0));
        let ss = StateSet::new(
            0,
            CompiledStateSet {
                name: "ss0".into(),
                states: vec![counting_state(StdArc::clone(&counter), 0, 0)],
                channel_ids: Vec::new(),
            },
            Arc::downgrade(&program.program),
            false,
            VarArea::new(0),
        );
        let handle = {
            let ss = StdArc::clone(&ss);
            std::thread::spawn(move || ss.run())
        };
        std::thread::sleep(Duration::from_millis(20));
        ss.request_shutdown();
        handle.join().unwrap();
        assert!(counter.load(Ordering::SeqCst) >= 1);
    }

    fn lone_state_set(state: CompiledState, program: &crate::program::test_support::TestProgram) -> Arc<StateSet> {
        StateSet::new(
            0,
            CompiledStateSet {
                name: "ss0".into(),
                states: vec![state],
                channel_ids: Vec::new(),
            },
            Arc::downgrade(&program.program),
            false,
            VarArea::new(0),
        )
    }

    #[test]
    fn delay_expired_becomes_true_only_after_the_delay_elapses() {
        let program = test_program(Vec::new(), 1);
        let state = CompiledState {
            name: "s".into(),
            event_mask: 0,
            options: StateOptions::empty(),
            evaluator: Arc::new(|_v, _ctx| None),
            action: Arc::new(|_v, _t| {}),
            delay_init: Arc::new(|_v, d| d[0] = 0.03),
            entry_hook: None,
            exit_hook: None,
            max_delays: 1,
        };
        let ss = lone_state_set(state, &program);
        ss.enter_state(0);
        assert_eq!(ss.compute_delay_expired(), vec![false]);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(ss.compute_delay_expired(), vec![true]);
    }

    #[test]
    fn a_when_delay_guard_sees_its_own_deadline_through_the_context_handle() {
        let program = test_program(Vec::new(), 1);
        let state = CompiledState {
            name: "s".into(),
            event_mask: 0,
            options: StateOptions::empty(),
            evaluator: Arc::new(|_v, ctx| {
                if ctx.delay_expired(0) {
                    Some(TransitionMatch {
                        transition_index: 0,
                        target_state: 0,
                    })
                } else {
                    None
                }
            }),
            action: Arc::new(|_v, _t| {}),
            delay_init: Arc::new(|_v, d| d[0] = 0.02),
            entry_hook: None,
            exit_hook: None,
            max_delays: 1,
        };
        let ss = lone_state_set(state, &program);
        ss.enter_state(0);
        let too_soon = ss.compute_delay_expired();
        assert!(!ss.try_transition(&too_soon));
        std::thread::sleep(Duration::from_millis(40));
        let expired = ss.compute_delay_expired();
        assert!(ss.try_transition(&expired));
    }

    #[test]
    fn self_transition_can_reset_timers_while_suppressing_the_entry_hook() {
        let program = test_program(Vec::new(), 1);
        let hook_calls = StdArc::new(StdAtomicUsize::new(0));
        let hook_calls_for_closure = StdArc::clone(&hook_calls);
        let state = CompiledState {
            name: "s".into(),
            event_mask: 0,
            options: StateOptions::SUPPRESS_ENTRY_FROM_SELF | StateOptions::RESET_TIMERS_ON_ENTRY,
            evaluator: Arc::new(|_v, _ctx| {
                Some(TransitionMatch {
                    transition_index: 0,
                    target_state: 0,
                })
            }),
            action: Arc::new(|_v, _t| {}),
            delay_init: Arc::new(|_v, d| d[0] = 0.0),
            entry_hook: Some(Arc::new(move |_v| {
                hook_calls_for_closure.fetch_add(1, Ordering::SeqCst);
            })),
            exit_hook: None,
            max_delays: 1,
        };
        let ss = lone_state_set(state, &program);
        ss.enter_state(0);
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1, "initial entry always runs the hook");

        let time_before = *ss.time_entered.lock().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let delay_expired = ss.compute_delay_expired();
        assert!(ss.try_transition(&delay_expired));

        assert_eq!(
            hook_calls.load(Ordering::SeqCst),
            1,
            "+e suppresses the entry hook on a self-transition"
        );
        let time_after = *ss.time_entered.lock().unwrap();
        assert!(
            time_after > time_before,
            "+r still resets timers on a self-transition even though the hook is suppressed"
        );
    }
}

//! Compiler output (§6 "Compiler output (consumed)").
//!
//! The state-notation compiler is out of scope (§1); this module only
//! describes the tabular in-memory structure it hands to the runtime, and
//! checks the magic number that guards against a runtime/compiler ABI
//! skew. Evaluators, action bodies, delay initializers, and entry/exit
//! hooks are opaque callables (§9 "Opaque user-code callables") — the
//! runtime invokes them and otherwise never inspects them.

use std::sync::Arc;

use bitflags::bitflags;

use crate::event::EventFlagId;
use crate::vararea::VarArea;

/// Magic number the compiler stamps into every program descriptor.
/// Mismatches are refused at startup (§6 "Contract").
pub const MAGIC: u32 = 0x5345_5143; // "SEQC"

bitflags! {
    /// Program-wide option bits (§3 "Program").
    pub struct ProgramOptions: u32 {
        /// `+r`: reentrant — per-instance variable area copy.
        const REENT             = 0b0000_0001;
        /// `+s`: safe mode — per-state-set variable view, committed at
        /// transition-cycle boundaries (§4.3 "Safe mode").
        const SAFE               = 0b0000_0010;
        /// `+m`: main — this program owns the process main thread (not
        /// otherwise load-bearing for the runtime itself).
        const MAIN                = 0b0000_0100;
        /// `+c`: connect-before-start — state sets block on the
        /// all-first-connect-and-monitor barrier before running (§4.6
        /// step 8).
        const CONNECT_BEFORE_START = 0b0000_1000;
        /// `+a`: async — synchronous pvGet/pvPut default to async
        /// completion polling instead of blocking.
        const ASYNC               = 0b0001_0000;
        /// `+d`: debug — enables debug-level logging by default.
        const DEBUG               = 0b0010_0000;
        /// `+i`: init-register-as-record — reserved compiler option,
        /// passed through unused by the runtime itself.
        const INIT_REGISTER_AS_RECORD = 0b0100_0000;
    }
}

bitflags! {
    /// Per-state option bits (§3 "State").
    pub struct StateOptions: u32 {
        /// `+r`: reset delay timers whenever this state is (re-)entered,
        /// even on a self-transition.
        const RESET_TIMERS_ON_ENTRY = 0b0000_0001;
        /// `+e`: suppress the entry hook on a self-targeted transition.
        const SUPPRESS_ENTRY_FROM_SELF = 0b0000_0010;
        /// `+x`: suppress the exit hook on a self-targeted transition.
        const SUPPRESS_EXIT_TO_SELF = 0b0000_0100;
    }
}

/// What a [`TransitionEvaluator`] reports when a transition's guard holds.
#[derive(Debug, Clone, Copy)]
pub struct TransitionMatch {
    pub transition_index: usize,
    pub target_state: usize,
}

/// The context handle a [`TransitionEvaluator`] receives alongside the
/// variable area (§9: "an abstract callable taking the variable area and a
/// context handle"). Exposes this wake's `delayExpired[0..maxDelays)` bits
/// (§3 "State set"), computed by [`crate::stateset::StateSet::run`] at step
/// 3b before any guard is evaluated — a `when(delay(d))` guard reads its
/// slot through here instead of seeing the variable area alone, which holds
/// no time/delay state.
pub struct EvalContext<'a> {
    delay_expired: &'a [bool],
}

impl<'a> EvalContext<'a> {
    pub fn new(delay_expired: &'a [bool]) -> Self {
        EvalContext { delay_expired }
    }

    /// `true` once `delay(id)` has remained true continuously since the
    /// state was entered, mirroring `seq_delay(ssId, delayId)` reading
    /// `ss->delayExpired[]`.
    pub fn delay_expired(&self, id: usize) -> bool {
        self.delay_expired.get(id).copied().unwrap_or(false)
    }
}

/// Evaluates the current state's transition guards in order and reports
/// the first match, or `None` (§4.5 step 3c). Takes a read-only view of the
/// variable area as the SS currently sees it (post safe-mode commit), plus
/// the context handle exposing this wake's delay-expiry bits.
pub type TransitionEvaluator =
    dyn Fn(&VarArea, &EvalContext) -> Option<TransitionMatch> + Send + Sync;

/// Runs the body of the transition identified by `transition_index`
/// (§4.5 step 3d), with read/write access to the variable area.
pub type ActionDispatcher = dyn Fn(&mut VarArea, usize) + Send + Sync;

/// Populates `delay[0..]` on entry to a state (§4.5 step 1).
pub type DelayInitializer = dyn Fn(&VarArea, &mut [f64]) + Send + Sync;

/// Entry/exit hooks and the program-level init/entry/exit functions all
/// share this shape: read/write access to the variable area, no return
/// value (§7 "bodies return normally").
pub type Hook = dyn Fn(&mut VarArea) + Send + Sync;

/// One state, as produced by the compiler (§3 "State").
pub struct CompiledState {
    pub name: String,
    pub event_mask: u64,
    pub options: StateOptions,
    pub evaluator: Arc<TransitionEvaluator>,
    pub action: Arc<ActionDispatcher>,
    pub delay_init: Arc<DelayInitializer>,
    pub entry_hook: Option<Arc<Hook>>,
    pub exit_hook: Option<Arc<Hook>>,
    pub max_delays: usize,
}

/// One state set, as produced by the compiler (§3 "State set (SS)").
pub struct CompiledStateSet {
    pub name: String,
    pub states: Vec<CompiledState>,
    /// Channel ids this state set associates with (assigned/monitored on
    /// its behalf at startup, §4.6 step 8).
    pub channel_ids: Vec<usize>,
}

/// One PV channel, as produced by the compiler (§3 "Channel").
pub struct CompiledChannel {
    pub var_name: String,
    pub var_type: String,
    pub var_offset: usize,
    pub count: usize,
    pub name_template: String,
    pub monitor: bool,
    pub event_flag: Option<EventFlagId>,
    pub queued: bool,
    pub queue_index: Option<usize>,
}

/// One sync queue, as produced by the compiler (§3 "Sync queue").
pub struct CompiledQueue {
    pub capacity: usize,
    pub event_flag: EventFlagId,
}

/// The full tabular program descriptor (§3 "Program", §6 "Compiler
/// output").
pub struct CompiledProgram {
    pub magic: u32,
    pub name: String,
    pub options: ProgramOptions,
    pub var_size: usize,
    /// Macro list from the `program(...)` statement (§4.4).
    pub params: String,
    pub num_event_flags: u32,
    pub state_sets: Vec<CompiledStateSet>,
    pub channels: Vec<CompiledChannel>,
    pub queues: Vec<CompiledQueue>,
    /// Run once before any state-set thread is spawned (§4.6 step 6).
    pub init_func: Option<Arc<Hook>>,
    /// Symmetric with `exit_func` in the compiler's tabular layout, but
    /// §4.6 names no invocation point for a program-level (as opposed to
    /// per-state) entry hook — reserved, never called by this runtime.
    pub entry_func: Option<Arc<Hook>>,
    /// Run once at the start of shutdown (§4.6 "triggered by user
    /// `exitFunc` request or external stop").
    pub exit_func: Option<Arc<Hook>>,
}

impl CompiledProgram {
    /// Check the magic number before any table is allocated (§6
    /// "Contract"). Corresponds to the original's `if (pSeqProg->magic !=
    /// MAGIC) { errlogPrintf(...); return; }`.
    pub fn check_magic(&self) -> Result<(), crate::error::StartupError> {
        if self.magic != MAGIC {
            return Err(crate::error::StartupError::MagicMismatch {
                expected: MAGIC,
                found: self.magic,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_program(magic: u32) -> CompiledProgram {
        CompiledProgram {
            magic,
            name: "test".into(),
            options: ProgramOptions::empty(),
            var_size: 0,
            params: String::new(),
            num_event_flags: 0,
            state_sets: Vec::new(),
            channels: Vec::new(),
            queues: Vec::new(),
            init_func: None,
            entry_func: None,
            exit_func: None,
        }
    }

    #[test]
    fn magic_mismatch_is_rejected() {
        let program = empty_program(0xdead_beef);
        assert!(program.check_magic().is_err());
    }

    #[test]
    fn correct_magic_is_accepted() {
        let program = empty_program(MAGIC);
        assert!(program.check_magic().is_ok());
    }
}

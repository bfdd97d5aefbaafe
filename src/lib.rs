//! Runtime engine for the state notation language: a compiled program
//! descriptor (§6) drives a set of preemptive state-set threads (§4.5)
//! against a PV provider (§6), synchronized through event flags (§4.2) and
//! bounded sync queues (§4.1, §4.7).
//!
//! [`supervisor::seq`] is the entry point: it resolves a
//! [`compiler::CompiledProgram`] and a macro string into a running
//! [`program::Program`], registers it with [`registry`], and returns it;
//! [`supervisor::stop`] reverses that.

#[macro_use]
extern crate failure;

pub mod channel;
pub mod clock;
pub mod compiler;
pub mod error;
pub mod event;
pub mod log;
pub mod macros;
pub mod program;
pub mod pv;
pub mod queue;
pub mod registry;
pub mod stateset;
pub mod supervisor;
pub mod sync;
pub mod syncqueue;
pub mod vararea;

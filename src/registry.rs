//! Global program registry (§2 "Global registry", §10.5).
//!
//! A process-wide list of running programs, the way the original tracked
//! every `sequencer()` instance so `seqShow` could enumerate them from any
//! IOC shell. Grounded on the `lazy_static!`-backed singleton pattern used
//! elsewhere in this crate for process-wide state.

use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;

use crate::program::Program;

lazy_static! {
    static ref PROGRAMS: Mutex<Vec<Arc<Program>>> = Mutex::new(Vec::new());
}

/// Add a newly started program to the registry (§4.6 step 8 completion).
pub fn register(program: Arc<Program>) {
    PROGRAMS.lock().unwrap().push(program);
}

/// Remove a program from the registry (§4.6 shutdown: "deregister from
/// global registry"). No-op if it is not present (already deregistered).
pub fn deregister(program: &Arc<Program>) {
    let mut programs = PROGRAMS.lock().unwrap();
    programs.retain(|p| !Arc::ptr_eq(p, program));
}

/// Every currently registered program's name, in registration order.
pub fn list() -> Vec<String> {
    PROGRAMS
        .lock()
        .unwrap()
        .iter()
        .map(|p| p.name.clone())
        .collect()
}

/// `seqShow`-style introspection: describe one named program, or every
/// registered program if `name` is `None`.
pub fn show(name: Option<&str>) -> String {
    let programs = PROGRAMS.lock().unwrap();
    match name {
        Some(name) => programs
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.describe())
            .unwrap_or_else(|| format!("no such program: {}\n", name)),
        None => programs.iter().map(|p| p.describe()).collect(),
    }
}

//! Logging (§4.8, §10.2).
//!
//! One mutex-protected, timestamped writer per program, reproducing the
//! original `seq_logv()` wire format exactly:
//! `<fiber-name> YYYY/MM/DD HH:MM:SS: <message>`.
//!
//! Grounded on a `log.rs` pattern of wrapping the [`log`] facade around a
//! native `say()` sink and mapping [`log::Level`] to a sequencer-native
//! level enum (`SayLevel`). This crate has no host process to delegate to,
//! so [`SeqLogger`] is a self-contained [`log::Log`] implementation instead
//! of an FFI shim, but keeps the same level table and record format.

use std::fs::File;
use std::io::{self, Write};
use std::sync::Mutex;

use log::{Level, Log, Metadata, Record};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;

use crate::clock::{format_timestamp, time};

/// Sequencer-native logging levels, ordered the way the original's
/// `auxArgs.debug` gated PV-level debugging: lower is more severe.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ToPrimitive, FromPrimitive)]
pub enum SayLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
}

impl From<Level> for SayLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Error => SayLevel::Error,
            Level::Warn => SayLevel::Warn,
            Level::Info => SayLevel::Info,
            Level::Debug | Level::Trace => SayLevel::Debug,
        }
    }
}

enum Sink {
    Stdout,
    File(Mutex<File>),
}

/// Program-scoped log writer. One instance is owned by each
/// [`crate::program::Program`] (§5 resource table: "log sink — program
/// owner — log mutex discipline").
pub struct SeqLogger {
    sink: Sink,
    max_level: SayLevel,
}

impl SeqLogger {
    /// Log to stdout. Used when the `logfile` macro (§6) is absent, exactly
    /// as `init_log()` defaulted `pLogFile` to `""`.
    pub fn stdout(max_level: SayLevel) -> Self {
        SeqLogger {
            sink: Sink::Stdout,
            max_level,
        }
    }

    /// Open (create/truncate) `path` for logging, as `init_log()` does with
    /// `fopen(pValue, "w")`.
    pub fn file(path: &str, max_level: SayLevel) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(SeqLogger {
            sink: Sink::File(Mutex::new(file)),
            max_level,
        })
    }

    /// Write one record, formatted exactly as `seq_logv()`:
    /// `<fiber-name> YYYY/MM/DD HH:MM:SS: <message>`. `fiber_name` replaces
    /// the original's `epicsThreadGetNameSelf()`, since callers here are
    /// not all running on their own dedicated OS thread identity the way
    /// EPICS threads are (the auxiliary fiber logs on behalf of PV
    /// provider callbacks, for instance).
    pub fn write(&self, fiber_name: &str, level: SayLevel, message: &str) {
        if level > self.max_level {
            return;
        }
        let line = format!("{} {}: {}\n", fiber_name, format_timestamp(time()), message);
        match &self.sink {
            Sink::Stdout => {
                let stdout = io::stdout();
                let mut handle = stdout.lock();
                let _ = handle.write_all(line.as_bytes());
            }
            Sink::File(file) => {
                let mut file = file.lock().unwrap();
                if file.write_all(line.as_bytes()).is_ok() {
                    let _ = file.flush();
                }
            }
        }
    }
}

/// Adapts a [`SeqLogger`] to the [`log`] facade, for crates embedding this
/// runtime that want `log::info!`/`log::error!` to land in the same sink.
/// `record.target()` is used in place of a fiber name, since the `log`
/// facade has no notion of the calling thread.
pub struct FacadeLogger {
    pub inner: SeqLogger,
}

impl Log for FacadeLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        SayLevel::from(metadata.level()) <= self.inner.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.inner
            .write(record.target(), record.level().into(), &record.args().to_string());
    }

    fn flush(&self) {}
}

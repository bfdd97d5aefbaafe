use std::fmt;
use std::fmt::{Display, Formatter};
use std::io;

/// Top-level error type returned by fallible public API.
///
/// Internal invariant violations that indicate a broken compiler/runtime
/// contract (out-of-range state index, arena lookup miss) are programming
/// errors, not recoverable conditions, and are reported with
/// `debug_assert!`/`panic!` instead of a variant here.
#[derive(Debug, Fail)]
pub enum Error {
    #[fail(display = "startup failed: {}", _0)]
    Startup(StartupError),

    #[fail(display = "channel error: {}", _0)]
    Channel(ChannelError),

    #[fail(display = "macro error: {}", _0)]
    Macro(MacroError),

    #[fail(display = "PV provider error: {}", _0)]
    Provider(ProviderError),

    #[fail(display = "IO error: {}", _0)]
    IO(io::Error),
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::IO(error)
    }
}

impl From<StartupError> for Error {
    fn from(error: StartupError) -> Self {
        Error::Startup(error)
    }
}

impl From<ChannelError> for Error {
    fn from(error: ChannelError) -> Self {
        Error::Channel(error)
    }
}

impl From<MacroError> for Error {
    fn from(error: MacroError) -> Self {
        Error::Macro(error)
    }
}

impl From<ProviderError> for Error {
    fn from(error: ProviderError) -> Self {
        Error::Provider(error)
    }
}

/// Structural/fatal failures that prevent a program from starting at all
/// (§7 "Structural/fatal").
#[derive(Debug, Fail)]
pub enum StartupError {
    #[fail(
        display = "magic number mismatch: expected {:#x}, got {:#x} (recompile your program?)",
        expected, found
    )]
    MagicMismatch { expected: u32, found: u32 },

    #[fail(display = "unknown variable type {:?}", _0)]
    UnknownVarType(String),

    #[fail(display = "table allocation failed: {}", _0)]
    AllocationFailed(String),
}

/// Per-channel recoverable failures (§7 "Per-operation recoverable" /
/// "Provider connection loss").
#[derive(Debug, Fail)]
pub enum ChannelError {
    #[fail(display = "pvGet timed out on channel {}", _0)]
    GetTimeout(String),

    #[fail(display = "pvPut timed out on channel {}", _0)]
    PutTimeout(String),

    #[fail(display = "channel {} is not assigned", _0)]
    NotAssigned(String),

    #[fail(display = "channel {} is not connected", _0)]
    NotConnected(String),
}

/// Reserved for future macro-syntax diagnostics. Macro expansion (§4.4) is
/// currently total — undefined tokens expand to the empty string rather than
/// failing — so this enum has no live constructors yet. It stays as its own
/// type, following the one-error-enum-per-subsystem practice used
/// throughout this crate, so that adding a fallible macro feature later
/// does not widen `Error`'s variant set.
#[derive(Debug, Fail)]
pub enum MacroError {
    #[fail(display = "macro expansion exceeded depth limit ({})", _0)]
    DepthExceeded(usize),
}

/// Failures reported by a [`crate::pv::PvProvider`] implementation.
#[derive(Debug, Fail)]
pub struct ProviderError {
    pub status: i32,
    pub severity: i32,
    pub message: String,
}

impl Display for ProviderError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status={} severity={}: {}",
            self.status, self.severity, self.message
        )
    }
}

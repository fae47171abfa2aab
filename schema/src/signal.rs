//! Signal vocabulary for the process-control facility
//!
//! The names follow the classic Unix signal set. Not every platform can
//! deliver every kind; unsupported kinds are reported by the control
//! implementation instead of being silently mapped to something else.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Signal to deliver with a kill request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum SignalKind {
    /// No signal; only checks that the target can be signalled
    None,
    /// Hangup
    Hup,
    /// Interrupt
    Int,
    /// Quit
    Quit,
    /// Illegal instruction
    Ill,
    /// Trace trap
    Trap,
    /// Abort
    Abrt,
    /// Emulator trap
    Emt,
    /// Floating point exception
    Fpe,
    /// Kill (cannot be caught or ignored)
    Kill,
    /// Bus error
    Bus,
    /// Segmentation violation
    Segv,
    /// Bad system call argument
    Sys,
    /// Write on a pipe with no reader
    Pipe,
    /// Alarm clock
    Alrm,
    /// Software termination
    #[default]
    Term,
}

impl SignalKind {
    /// Conventional upper-case name, e.g. `SIGTERM`
    pub fn name(&self) -> &'static str {
        match self {
            SignalKind::None => "SIGNONE",
            SignalKind::Hup => "SIGHUP",
            SignalKind::Int => "SIGINT",
            SignalKind::Quit => "SIGQUIT",
            SignalKind::Ill => "SIGILL",
            SignalKind::Trap => "SIGTRAP",
            SignalKind::Abrt => "SIGABRT",
            SignalKind::Emt => "SIGEMT",
            SignalKind::Fpe => "SIGFPE",
            SignalKind::Kill => "SIGKILL",
            SignalKind::Bus => "SIGBUS",
            SignalKind::Segv => "SIGSEGV",
            SignalKind::Sys => "SIGSYS",
            SignalKind::Pipe => "SIGPIPE",
            SignalKind::Alrm => "SIGALRM",
            SignalKind::Term => "SIGTERM",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Scope of a kill request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum KillFlags {
    /// Signal only the target process
    #[default]
    NoChildren,
    /// Also signal the target's process group (best effort)
    Children,
}

/// Which redirected output stream of a child
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum StreamKind {
    /// Child standard output
    Stdout,
    /// Child standard error
    Stderr,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

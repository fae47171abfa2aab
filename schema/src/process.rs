//! Process lifecycle types
//!
//! A child process tracked by a handle moves through three states:
//!
//! ```text
//! Created → Running → Terminated
//! ```
//!
//! `Terminated` is final. Whether anybody is told about the termination is
//! governed by the handle's detached flag, not by the state itself.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::SystemTime;

/// Lowest scheduling priority hint
pub const PRIORITY_MIN: u32 = 0;
/// Priority hint used when none is requested
pub const PRIORITY_DEFAULT: u32 = 50;
/// Highest scheduling priority hint
pub const PRIORITY_MAX: u32 = 100;

/// Exit code reported for children that did not exit normally
pub const ABNORMAL_EXIT_CODE: i32 = -1;

/// Lifecycle state of a process handle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "camelCase")]
pub enum ProcessState {
    /// Handle exists but no OS process has been bound to it yet
    #[default]
    Created,
    /// An OS process is bound and has not been reaped
    Running,
    /// The OS process exited and was reaped
    Terminated,
}

impl ProcessState {
    /// Whether the handle still accepts launch-time configuration
    pub fn is_configurable(&self) -> bool {
        matches!(self, ProcessState::Created)
    }

    /// Whether an OS process is currently bound to the handle
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running)
    }

    /// Whether the handle reached its final state
    pub fn is_terminated(&self) -> bool {
        matches!(self, ProcessState::Terminated)
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProcessState::Created => "created",
            ProcessState::Running => "running",
            ProcessState::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

/// Termination record for one child process
///
/// Built once by the handle when its child is reaped and handed to the
/// notification dispatcher at most once.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ExitSignal {
    /// OS process identifier of the child
    pub pid: u32,
    /// Exit status, or [`ABNORMAL_EXIT_CODE`] when killed by a signal
    pub exit_code: i32,
    /// Signal number that terminated the child, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// Reap time in RFC3339 format
    pub timestamp: String,
}

impl ExitSignal {
    /// Create a record for a child that exited with `exit_code`
    #[must_use]
    pub fn new(pid: u32, exit_code: i32) -> Self {
        Self {
            pid,
            exit_code,
            signal: None,
            timestamp: current_timestamp(),
        }
    }

    /// Create a record for a child terminated by `signal`
    #[must_use]
    pub fn signaled(pid: u32, signal: i32) -> Self {
        Self {
            pid,
            exit_code: ABNORMAL_EXIT_CODE,
            signal: Some(signal),
            timestamp: current_timestamp(),
        }
    }

    /// True when the child exited normally with status 0
    pub fn is_success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none()
    }
}

/// What to run for a launched child
///
/// The program is executed directly with `args` as its argument vector; no
/// shell is involved and nothing is split or expanded.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct CommandSpec {
    /// Program to execute (looked up in `PATH` unless absolute)
    pub program: String,

    /// Argument vector, excluding the program itself
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables on top of the inherited environment
    #[serde(default)]
    pub environment: HashMap<String, String>,

    /// Working directory for the child
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

impl CommandSpec {
    /// Run `program` with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Run the child in `dir`
    pub fn current_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }
}

/// Current wall-clock time in RFC3339 format (seconds precision)
#[must_use]
pub fn current_timestamp() -> String {
    humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
}

//! Signal delivery and existence checks
//!
//! [`ProcessControl`] is the seam between the handle and the operating
//! system. The Unix implementation lives in [`crate::process::unix`]; tests
//! use [`MockProcessControl`].

use crate::KillError;
use parking_lot::Mutex;
use schema::{KillFlags, SignalKind};
use std::collections::HashMap;

/// Sends signals to arbitrary processes
pub trait ProcessControl: Send + Sync {
    /// Deliver `signal` to `pid` (and its process group with
    /// [`KillFlags::Children`])
    fn kill(&self, pid: u32, signal: SignalKind, flags: KillFlags) -> Result<(), KillError>;

    /// Whether `pid` refers to a process we are allowed to signal
    fn exists(&self, pid: u32) -> bool;
}

/// Control used by [`crate::ProcessHandle::kill`] and friends
pub fn platform() -> &'static dyn ProcessControl {
    #[cfg(unix)]
    {
        static PLATFORM: crate::process::unix::UnixProcessControl =
            crate::process::unix::UnixProcessControl;
        &PLATFORM
    }
    #[cfg(not(unix))]
    {
        static PLATFORM: UnsupportedProcessControl = UnsupportedProcessControl;
        &PLATFORM
    }
}

/// Control for targets without signal support
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedProcessControl;

impl ProcessControl for UnsupportedProcessControl {
    fn kill(&self, _pid: u32, signal: SignalKind, _flags: KillFlags) -> Result<(), KillError> {
        Err(KillError::OperationNotSupported(signal.name().to_string()))
    }

    fn exists(&self, _pid: u32) -> bool {
        false
    }
}

/// Target state known to [`MockProcessControl`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockTarget {
    /// Signals are accepted
    Alive,
    /// Exists but belongs to someone else
    Protected,
}

/// In-memory [`ProcessControl`] for tests
///
/// Unknown pids behave like exited processes. Successful `kill` calls are
/// recorded; [`SignalKind::Kill`] and [`SignalKind::Term`] remove the target.
#[derive(Debug, Default)]
pub struct MockProcessControl {
    targets: Mutex<HashMap<u32, MockTarget>>,
    calls: Mutex<Vec<(u32, SignalKind, KillFlags)>>,
}

impl MockProcessControl {
    /// Create a control that knows no processes
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `pid` signalable
    pub fn add_process(&self, pid: u32) {
        self.targets.lock().insert(pid, MockTarget::Alive);
    }

    /// Make `pid` exist but refuse signals
    pub fn add_protected(&self, pid: u32) {
        self.targets.lock().insert(pid, MockTarget::Protected);
    }

    /// Forget `pid`
    pub fn remove_process(&self, pid: u32) {
        self.targets.lock().remove(&pid);
    }

    /// Successful deliveries, in order
    pub fn calls(&self) -> Vec<(u32, SignalKind, KillFlags)> {
        self.calls.lock().clone()
    }
}

impl ProcessControl for MockProcessControl {
    fn kill(&self, pid: u32, signal: SignalKind, flags: KillFlags) -> Result<(), KillError> {
        if signal == SignalKind::Emt {
            return Err(KillError::OperationNotSupported(signal.name().to_string()));
        }
        let mut targets = self.targets.lock();
        match targets.get(&pid).copied() {
            None => Err(KillError::NoSuchProcess(pid)),
            Some(MockTarget::Protected) => Err(KillError::AccessDenied(pid)),
            Some(MockTarget::Alive) => {
                if matches!(signal, SignalKind::Kill | SignalKind::Term) {
                    targets.remove(&pid);
                }
                self.calls.lock().push((pid, signal, flags));
                Ok(())
            }
        }
    }

    fn exists(&self, pid: u32) -> bool {
        self.targets.lock().get(&pid) == Some(&MockTarget::Alive)
    }
}

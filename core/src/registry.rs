//! Registry of live process handles
//!
//! Maps the pid of every attached, running child to a weak reference to its
//! handle, so that the reaper can find the handle when the exit is observed.
//! Registries are constructed explicitly and shared by cloning; there is no
//! process-wide instance.

use crate::handle::{HandleInner, ProcessHandle, Termination};
use crate::Result;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Shared pid → handle map
#[derive(Debug, Clone, Default)]
pub struct ProcessRegistry {
    entries: Arc<DashMap<u32, Weak<HandleInner>>>,
}

impl ProcessRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `handle` under `pid`
    ///
    /// Normally done by [`ProcessHandle::bind_launch_result`]. A live entry
    /// for the same pid is replaced with a warning.
    pub fn register(&self, pid: u32, handle: &ProcessHandle) {
        if let Some(previous) = self.entries.insert(pid, handle.downgrade()) {
            if previous.strong_count() > 0 && !Weak::ptr_eq(&previous, &handle.downgrade()) {
                warn!("Replacing live registration for process {}", pid);
            }
        }
    }

    /// Remove the entry for `pid` only if it still points at `inner`
    pub(crate) fn unregister(&self, pid: u32, inner: &Arc<HandleInner>) -> bool {
        self.entries
            .remove_if(&pid, |_, entry| std::ptr::eq(entry.as_ptr(), Arc::as_ptr(inner)))
            .is_some()
    }

    /// Handle registered for `pid`, if it is still alive
    pub fn lookup(&self, pid: u32) -> Option<ProcessHandle> {
        self.entries
            .get(&pid)
            .and_then(|entry| entry.upgrade())
            .map(ProcessHandle::from_inner)
    }

    /// Remove whatever is registered for `pid`
    pub fn remove(&self, pid: u32) -> Option<ProcessHandle> {
        self.entries
            .remove(&pid)
            .and_then(|(_, entry)| entry.upgrade())
            .map(ProcessHandle::from_inner)
    }

    /// Whether a live handle is registered for `pid`
    pub fn contains(&self, pid: u32) -> bool {
        self.entries
            .get(&pid)
            .is_some_and(|entry| entry.strong_count() > 0)
    }

    /// Number of entries, including ones whose handle is already gone
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered pids, in no particular order
    pub fn pids(&self) -> Vec<u32> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }

    /// Drop entries whose handle no longer exists; returns how many
    pub fn prune(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.strong_count() > 0);
        before.saturating_sub(self.entries.len())
    }

    /// Route an exit observed by pid alone to the registered handle
    ///
    /// For reapers that only know the pid. The entry is trusted to belong to
    /// the child that exited, so this must run before the pid can be reused;
    /// a reaper that holds the handle calls
    /// [`ProcessHandle::handle_termination`] on it instead, as the launcher
    /// does.
    ///
    /// Returns `Ok(false)` when nothing is registered for `pid`, which happens
    /// legitimately when the handle detached first.
    pub fn dispatch_termination(&self, pid: u32, termination: impl Into<Termination>) -> Result<bool> {
        let Some((_, entry)) = self.entries.remove(&pid) else {
            debug!("Termination of untracked process {} ignored", pid);
            return Ok(false);
        };
        let Some(inner) = entry.upgrade() else {
            debug!("Handle for process {} dropped before termination", pid);
            return Ok(false);
        };

        ProcessHandle::from_inner(inner).handle_termination(termination)?;
        Ok(true)
    }
}

//! Asynchronous process handle
//!
//! A [`ProcessHandle`] represents one child process from the moment the
//! caller decides to start it until long after the OS reaped it:
//!
//! ```text
//! Created ──bind_launch_result──▶ Running ──handle_termination──▶ Terminated
//! ```
//!
//! The `detached` flag is orthogonal to the state. The per-handle lock is the
//! single point where [`ProcessHandle::detach`] and
//! [`ProcessHandle::handle_termination`] meet, so exactly one of "notified"
//! or "suppressed because detached first" happens for every attached child.
//!
//! ## Ownership
//!
//! Handles are cheap clones of one shared slot. The caller keeps its clone
//! for as long as it likes; the launcher's reaper task keeps another until
//! the child exits. The [`ProcessRegistry`] only holds a weak reference used
//! to locate the handle when the exit is observed.

use crate::control::{self, ProcessControl};
use crate::dispatch::{NotificationDispatcher, NullDispatcher};
use crate::registry::ProcessRegistry;
use crate::streams::{
    OutputReader, PipeReader, PipeStatus, PipeWriter, StreamBundle, DEFAULT_DRAIN_CHUNK_SIZE,
    DEFAULT_MAX_BUFFERED_BYTES,
};
use crate::{CoreError, KillError, Result};
use parking_lot::Mutex;
use schema::{ExitSignal, KillFlags, ProcessState, SignalKind, ABNORMAL_EXIT_CODE, PRIORITY_DEFAULT, PRIORITY_MAX};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Default time drain tasks may keep reading after the child was reaped
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_millis(500);

/// How a child process ended, as observed by the reaper
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    /// Exit status, or [`ABNORMAL_EXIT_CODE`] when killed by a signal
    pub exit_code: i32,
    /// Terminating signal, if any
    pub signal: Option<i32>,
}

impl Termination {
    /// Normal exit with `exit_code`
    pub fn exited(exit_code: i32) -> Self {
        Self {
            exit_code,
            signal: None,
        }
    }

    /// Killed by `signal`
    pub fn signaled(signal: i32) -> Self {
        Self {
            exit_code: ABNORMAL_EXIT_CODE,
            signal: Some(signal),
        }
    }

    /// Convert an OS exit status
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Self::signaled(signal);
            }
        }
        Self::exited(ABNORMAL_EXIT_CODE)
    }

    fn into_signal(self, pid: u32) -> ExitSignal {
        match self.signal {
            Some(signal) => ExitSignal::signaled(pid, signal),
            None => ExitSignal::new(pid, self.exit_code),
        }
    }
}

impl From<i32> for Termination {
    fn from(exit_code: i32) -> Self {
        Self::exited(exit_code)
    }
}

impl From<std::process::ExitStatus> for Termination {
    fn from(status: std::process::ExitStatus) -> Self {
        Self::from_status(status)
    }
}

struct HandleState {
    pid: Option<u32>,
    priority: u32,
    lifecycle: ProcessState,
    detached: bool,
    /// Set while this handle is registered
    registry: Option<ProcessRegistry>,
}

pub(crate) struct HandleInner {
    redirect: bool,
    drain_grace: Duration,
    streams: Option<StreamBundle>,
    dispatcher: Arc<dyn NotificationDispatcher>,
    state: Mutex<HandleState>,
    exit_tx: watch::Sender<Option<ExitSignal>>,
}

/// Builder for [`ProcessHandle`]
#[derive(Clone)]
pub struct HandleBuilder {
    redirect: bool,
    priority: u32,
    dispatcher: Arc<dyn NotificationDispatcher>,
    drain_chunk_size: usize,
    max_buffered_bytes: usize,
    drain_grace: Duration,
}

impl Default for HandleBuilder {
    fn default() -> Self {
        Self {
            redirect: false,
            priority: PRIORITY_DEFAULT,
            dispatcher: Arc::new(NullDispatcher),
            drain_chunk_size: DEFAULT_DRAIN_CHUNK_SIZE,
            max_buffered_bytes: DEFAULT_MAX_BUFFERED_BYTES,
            drain_grace: DEFAULT_DRAIN_GRACE,
        }
    }
}

impl fmt::Debug for HandleBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleBuilder")
            .field("redirect", &self.redirect)
            .field("priority", &self.priority)
            .field("drain_chunk_size", &self.drain_chunk_size)
            .field("max_buffered_bytes", &self.max_buffered_bytes)
            .field("drain_grace", &self.drain_grace)
            .finish_non_exhaustive()
    }
}

impl HandleBuilder {
    /// Capture the child's standard streams
    pub fn redirect(mut self, redirect: bool) -> Self {
        self.redirect = redirect;
        self
    }

    /// Initial priority hint, clamped to `0..=100`
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority.min(PRIORITY_MAX);
        self
    }

    /// Where the exit notification goes if the handle is still attached
    pub fn dispatcher(mut self, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Read size of the stdout/stderr drain tasks
    pub fn drain_chunk_size(mut self, size: usize) -> Self {
        self.drain_chunk_size = size;
        self
    }

    /// Cap on bytes buffered per output stream before draining pauses
    pub fn max_buffered_bytes(mut self, bytes: usize) -> Self {
        self.max_buffered_bytes = bytes;
        self
    }

    /// How long drain tasks may keep reading after the child was reaped
    pub fn drain_grace(mut self, grace: Duration) -> Self {
        self.drain_grace = grace;
        self
    }

    /// Create the handle in state `Created`
    pub fn build(self) -> ProcessHandle {
        let (exit_tx, _exit_rx) = watch::channel(None);
        let streams = self
            .redirect
            .then(|| StreamBundle::with_limits(self.drain_chunk_size, self.max_buffered_bytes));
        ProcessHandle {
            inner: Arc::new(HandleInner {
                redirect: self.redirect,
                drain_grace: self.drain_grace,
                streams,
                dispatcher: self.dispatcher,
                state: Mutex::new(HandleState {
                    pid: None,
                    priority: self.priority,
                    lifecycle: ProcessState::Created,
                    detached: false,
                    registry: None,
                }),
                exit_tx,
            }),
        }
    }
}

/// Shared handle to one child process
#[derive(Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ProcessHandle")
            .field("pid", &state.pid)
            .field("state", &state.lifecycle)
            .field("priority", &state.priority)
            .field("redirect", &self.inner.redirect)
            .field("detached", &state.detached)
            .finish()
    }
}

impl ProcessHandle {
    /// Create a handle with default priority and no notification sink
    pub fn create(redirect: bool) -> Self {
        Self::builder().redirect(redirect).build()
    }

    /// Start configuring a handle
    pub fn builder() -> HandleBuilder {
        HandleBuilder::default()
    }

    pub(crate) fn from_inner(inner: Arc<HandleInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<HandleInner> {
        Arc::downgrade(&self.inner)
    }

    /// True when both values refer to the same handle
    pub fn ptr_eq(&self, other: &ProcessHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// OS process id, once bound
    pub fn pid(&self) -> Option<u32> {
        self.inner.state.lock().pid
    }

    /// Current lifecycle state
    pub fn state(&self) -> ProcessState {
        self.inner.state.lock().lifecycle
    }

    /// Priority hint
    pub fn priority(&self) -> u32 {
        self.inner.state.lock().priority
    }

    /// Whether the child's standard streams are captured
    pub fn is_redirected(&self) -> bool {
        self.inner.redirect
    }

    /// Whether the caller gave up interest in the exit notification
    pub fn is_detached(&self) -> bool {
        self.inner.state.lock().detached
    }

    /// Final exit record, once terminated
    pub fn exit_signal(&self) -> Option<ExitSignal> {
        self.inner.exit_tx.borrow().clone()
    }

    /// Wait until the child was reaped and return its exit record
    ///
    /// Never resolves for a handle that is never launched.
    pub async fn wait(&self) -> Result<ExitSignal> {
        let mut rx = self.inner.exit_tx.subscribe();
        let signal = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|e| CoreError::ProcessWait(e.to_string()))?;
        signal
            .clone()
            .ok_or_else(|| CoreError::ProcessWait("exit record missing".to_string()))
    }

    /// Change the priority hint; only allowed before the child is spawned
    pub fn set_priority(&self, priority: u32) -> Result<()> {
        if priority > PRIORITY_MAX {
            return Err(CoreError::ValidationError(format!(
                "priority must be 0..={}, got {}",
                PRIORITY_MAX, priority
            )));
        }
        let mut state = self.inner.state.lock();
        if !state.lifecycle.is_configurable() {
            return Err(CoreError::InvalidState(format!(
                "priority can only be changed before spawn (state: {})",
                state.lifecycle
            )));
        }
        state.priority = priority;
        Ok(())
    }

    /// Record the pid of the freshly spawned child and start tracking it
    ///
    /// Called once by the launcher. Registers the handle in `registry` unless
    /// it was detached already.
    pub fn bind_launch_result(&self, registry: &ProcessRegistry, pid: u32) -> Result<()> {
        if pid == 0 || i32::try_from(pid).is_err() {
            return Err(CoreError::AlreadyBound(format!("invalid process id {}", pid)));
        }

        let mut state = self.inner.state.lock();
        if let Some(existing) = state.pid {
            return Err(CoreError::AlreadyBound(format!(
                "handle is already bound to process {}",
                existing
            )));
        }
        if !state.lifecycle.is_configurable() {
            return Err(CoreError::AlreadyBound(format!(
                "handle is {}, cannot bind process {}",
                state.lifecycle, pid
            )));
        }

        state.pid = Some(pid);
        state.lifecycle = ProcessState::Running;
        if !state.detached {
            registry.register(pid, self);
            state.registry = Some(registry.clone());
        }
        debug!("Bound process {} (detached: {})", pid, state.detached);
        Ok(())
    }

    /// Attach the child's pipes; the launcher calls this right after binding
    pub fn set_pipes(
        &self,
        stdout: Option<PipeReader>,
        stdin: Option<PipeWriter>,
        stderr: Option<PipeReader>,
    ) -> Result<()> {
        match &self.inner.streams {
            Some(streams) => streams.set_pipes(stdout, stdin, stderr),
            None => Err(CoreError::NotRedirected(format!(
                "handle for process {:?} was created without redirection",
                self.pid()
            ))),
        }
    }

    /// Give up interest in the exit notification; idempotent
    ///
    /// The OS process is not affected. Once detached, the eventual
    /// termination is handled silently.
    ///
    /// Returns `true` when this call suppressed the notification, i.e. it
    /// detached the handle before termination. Returns `false` when the
    /// handle was already detached or already terminated.
    pub fn detach(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.detached {
            return false;
        }
        state.detached = true;

        match state.lifecycle {
            ProcessState::Running => {
                if let (Some(pid), Some(registry)) = (state.pid, state.registry.take()) {
                    registry.unregister(pid, &self.inner);
                    debug!("Detached from running process {}", pid);
                }
                true
            }
            ProcessState::Created => {
                debug!("Detached handle before launch");
                true
            }
            ProcessState::Terminated => {
                debug!("Detached from already terminated process {:?}", state.pid);
                false
            }
        }
    }

    /// Finalize the handle after its child was reaped
    ///
    /// Invoked exactly once per handle by whoever observed the exit: the
    /// launcher's reaper calls it on the handle it launched, pid-only reapers
    /// go through [`ProcessRegistry::dispatch_termination`]. In order, it:
    ///
    /// - removes this handle's registry entry (identity-checked, so a newer
    ///   registration for a reused pid survives)
    /// - moves the state to `Terminated` and records the exit
    /// - wakes every [`ProcessHandle::wait`] caller
    /// - closes stdin and gives the drain tasks their grace period
    /// - delivers the [`ExitSignal`] to the dispatcher, unless the handle was
    ///   detached before the state changed
    ///
    /// The detach decision and the state change happen under the same lock,
    /// so a concurrent [`ProcessHandle::detach`] either suppresses the
    /// notification or reports that it came too late.
    ///
    /// ## Arguments
    ///
    /// * `termination` - How the child ended; a plain `i32` is taken as a
    ///   normal exit code
    ///
    /// ## Error Handling
    ///
    /// - `DoubleTermination` on a second call; this is a defect in the caller
    ///   and nothing is delivered again
    /// - `InvalidState` when the handle was never bound to a pid
    ///
    /// ## Example
    ///
    /// ```rust
    /// use brood_core::{ProcessHandle, ProcessRegistry, ProcessState, Termination};
    ///
    /// let registry = ProcessRegistry::new();
    /// let handle = ProcessHandle::create(false);
    /// handle.bind_launch_result(&registry, 4242)?;
    /// handle.handle_termination(Termination::signaled(15))?;
    /// assert_eq!(handle.state(), ProcessState::Terminated);
    /// assert_eq!(handle.exit_signal().map(|exit| exit.exit_code), Some(-1));
    /// # Ok::<(), brood_core::CoreError>(())
    /// ```
    pub fn handle_termination(&self, termination: impl Into<Termination>) -> Result<()> {
        let termination = termination.into();

        let (signal, notify) = {
            let mut state = self.inner.state.lock();
            let pid = match (state.lifecycle, state.pid) {
                (ProcessState::Running, Some(pid)) => pid,
                (ProcessState::Terminated, pid) => {
                    let pid = pid.unwrap_or_default();
                    error!("Process {} terminated twice", pid);
                    return Err(CoreError::DoubleTermination(pid));
                }
                (lifecycle, _) => {
                    return Err(CoreError::InvalidState(format!(
                        "cannot terminate a handle that is {}",
                        lifecycle
                    )));
                }
            };

            if let Some(registry) = state.registry.take() {
                registry.unregister(pid, &self.inner);
            }
            state.lifecycle = ProcessState::Terminated;
            (termination.into_signal(pid), !state.detached)
        };

        self.inner.exit_tx.send_replace(Some(signal.clone()));
        if let Some(streams) = &self.inner.streams {
            streams.release(self.inner.drain_grace);
        }

        if notify {
            info!(
                "Process {} terminated with exit code {}",
                signal.pid, signal.exit_code
            );
            self.inner.dispatcher.deliver(signal);
        } else {
            debug!(
                "Process {} terminated while detached, notification suppressed",
                signal.pid
            );
        }
        Ok(())
    }

    /// Redirected stream bundle, if redirection was requested
    pub fn streams(&self) -> Option<&StreamBundle> {
        self.inner.streams.as_ref()
    }

    /// Reader over the child's stdout
    pub fn stdout(&self) -> Option<OutputReader> {
        self.streams().and_then(StreamBundle::stdout)
    }

    /// Reader over the child's stderr
    pub fn stderr(&self) -> Option<OutputReader> {
        self.streams().and_then(StreamBundle::stderr)
    }

    /// True while the child's stdin has not been closed
    pub fn is_input_open(&self) -> bool {
        self.streams().is_some_and(StreamBundle::is_input_open)
    }

    /// True iff stdout has at least one byte ready
    pub fn is_output_available(&self) -> bool {
        self.streams().is_some_and(StreamBundle::is_output_available)
    }

    /// True iff stderr has at least one byte ready
    pub fn is_error_available(&self) -> bool {
        self.streams().is_some_and(StreamBundle::is_error_available)
    }

    /// Buffer status of stdout; `EndOfStream` without redirection
    pub fn output_status(&self) -> PipeStatus {
        self.streams()
            .map(StreamBundle::output_status)
            .unwrap_or(PipeStatus::EndOfStream)
    }

    /// Buffer status of stderr; `EndOfStream` without redirection
    pub fn error_status(&self) -> PipeStatus {
        self.streams()
            .map(StreamBundle::error_status)
            .unwrap_or(PipeStatus::EndOfStream)
    }

    /// Close the child's stdin; idempotent, no-op without redirection
    pub fn close_output(&self) {
        if let Some(streams) = self.streams() {
            streams.close_output();
        }
    }

    /// Write to the child's stdin
    pub async fn write_input(&self, data: &[u8]) -> Result<()> {
        match self.streams() {
            Some(streams) => streams.write_input(data).await,
            None => Err(CoreError::NotRedirected(
                "cannot write to stdin of a child without redirection".to_string(),
            )),
        }
    }

    /// Send `signal` to the bound child
    ///
    /// A failed delivery leaves the handle untouched so the caller can retry
    /// or escalate.
    pub fn send_signal(&self, signal: SignalKind, flags: KillFlags) -> Result<()> {
        self.send_signal_with(control::platform(), signal, flags)
    }

    /// Send `signal` to the bound child through `control`
    pub fn send_signal_with(
        &self,
        control: &dyn ProcessControl,
        signal: SignalKind,
        flags: KillFlags,
    ) -> Result<()> {
        let (lifecycle, pid) = {
            let state = self.inner.state.lock();
            (state.lifecycle, state.pid)
        };
        match (lifecycle, pid) {
            (ProcessState::Running, Some(pid)) => Ok(control.kill(pid, signal, flags)?),
            _ => Err(CoreError::InvalidState(format!(
                "cannot signal a handle that is {}",
                lifecycle
            ))),
        }
    }

    /// Send `signal` to an arbitrary process
    pub fn kill(pid: u32, signal: SignalKind, flags: KillFlags) -> std::result::Result<(), KillError> {
        control::platform().kill(pid, signal, flags)
    }

    /// Send `signal` to an arbitrary process through `control`
    pub fn kill_with(
        control: &dyn ProcessControl,
        pid: u32,
        signal: SignalKind,
        flags: KillFlags,
    ) -> std::result::Result<(), KillError> {
        control.kill(pid, signal, flags)
    }

    /// Whether a process with this pid exists
    ///
    /// A process we may not query is reported as absent.
    pub fn exists(pid: u32) -> bool {
        control::platform().exists(pid)
    }

    /// Whether a process with this pid exists, according to `control`
    pub fn exists_with(control: &dyn ProcessControl, pid: u32) -> bool {
        control.exists(pid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::MockProcessControl;
    use crate::dispatch::RecordingDispatcher;
    use std::sync::Arc;
    use tokio::io::{duplex, AsyncWriteExt};

    fn recorded_handle(redirect: bool) -> (ProcessHandle, Arc<RecordingDispatcher>) {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let handle = ProcessHandle::builder()
            .redirect(redirect)
            .dispatcher(dispatcher.clone())
            .build();
        (handle, dispatcher)
    }

    #[test]
    fn test_new_handle_is_created() {
        let handle = ProcessHandle::create(false);
        assert_eq!(handle.state(), ProcessState::Created);
        assert_eq!(handle.pid(), None);
        assert_eq!(handle.priority(), PRIORITY_DEFAULT);
        assert!(!handle.is_redirected());
        assert!(!handle.is_detached());
        assert!(handle.streams().is_none());
        assert!(handle.exit_signal().is_none());
    }

    #[test]
    fn test_priority_mutable_only_before_bind() {
        let registry = ProcessRegistry::new();
        let handle = ProcessHandle::create(false);

        handle.set_priority(80).unwrap();
        assert_eq!(handle.priority(), 80);

        handle.bind_launch_result(&registry, 1234).unwrap();
        assert_eq!(handle.priority(), 80);

        let err = handle.set_priority(10).unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));
        assert_eq!(handle.priority(), 80);
    }

    #[test]
    fn test_priority_out_of_range_rejected() {
        let handle = ProcessHandle::create(false);
        let err = handle.set_priority(PRIORITY_MAX + 1).unwrap_err();
        assert!(matches!(err, CoreError::ValidationError(_)));

        let clamped = ProcessHandle::builder().priority(500).build();
        assert_eq!(clamped.priority(), PRIORITY_MAX);
    }

    #[test]
    fn test_bind_registers_and_runs() {
        let registry = ProcessRegistry::new();
        let handle = ProcessHandle::create(false);

        handle.bind_launch_result(&registry, 4321).unwrap();
        assert_eq!(handle.state(), ProcessState::Running);
        assert_eq!(handle.pid(), Some(4321));
        assert!(registry.contains(4321));
        assert!(registry.lookup(4321).unwrap().ptr_eq(&handle));
    }

    #[test]
    fn test_bind_twice_fails() {
        let registry = ProcessRegistry::new();
        let handle = ProcessHandle::create(false);
        handle.bind_launch_result(&registry, 10).unwrap();

        let err = handle.bind_launch_result(&registry, 11).unwrap_err();
        assert!(matches!(err, CoreError::AlreadyBound(_)));
        assert_eq!(handle.pid(), Some(10));
        assert!(!registry.contains(11));
    }

    #[test]
    fn test_bind_invalid_pid_fails() {
        let registry = ProcessRegistry::new();
        let handle = ProcessHandle::create(false);

        assert!(matches!(
            handle.bind_launch_result(&registry, 0),
            Err(CoreError::AlreadyBound(_))
        ));
        assert!(matches!(
            handle.bind_launch_result(&registry, u32::MAX),
            Err(CoreError::AlreadyBound(_))
        ));
        assert_eq!(handle.state(), ProcessState::Created);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_termination_notifies_once() {
        let registry = ProcessRegistry::new();
        let (handle, dispatcher) = recorded_handle(false);
        handle.bind_launch_result(&registry, 77).unwrap();

        handle.handle_termination(7).unwrap();
        assert_eq!(handle.state(), ProcessState::Terminated);
        assert!(!registry.contains(77));

        let delivered = dispatcher.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!((delivered[0].pid, delivered[0].exit_code), (77, 7));
        assert_eq!(handle.exit_signal().unwrap().exit_code, 7);
    }

    #[test]
    fn test_double_termination_is_an_error() {
        let registry = ProcessRegistry::new();
        let (handle, dispatcher) = recorded_handle(false);
        handle.bind_launch_result(&registry, 78).unwrap();

        handle.handle_termination(0).unwrap();
        let err = handle.handle_termination(0).unwrap_err();
        assert!(matches!(err, CoreError::DoubleTermination(78)));
        assert_eq!(dispatcher.count(), 1);
    }

    #[test]
    fn test_termination_before_bind_is_invalid() {
        let (handle, dispatcher) = recorded_handle(false);
        let err = handle.handle_termination(0).unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));
        assert_eq!(handle.state(), ProcessState::Created);
        assert_eq!(dispatcher.count(), 0);
    }

    #[test]
    fn test_detach_before_termination_suppresses_notification() {
        let registry = ProcessRegistry::new();
        let (handle, dispatcher) = recorded_handle(false);
        handle.bind_launch_result(&registry, 90).unwrap();

        assert!(handle.detach());
        assert!(handle.is_detached());
        assert!(!handle.detach());
        assert!(!registry.contains(90));

        handle.handle_termination(0).unwrap();
        assert_eq!(handle.state(), ProcessState::Terminated);
        assert_eq!(dispatcher.count(), 0);
    }

    #[test]
    fn test_detach_after_termination_has_no_effect() {
        let registry = ProcessRegistry::new();
        let (handle, dispatcher) = recorded_handle(false);
        handle.bind_launch_result(&registry, 91).unwrap();

        handle.handle_termination(3).unwrap();
        assert!(!handle.detach());
        assert!(!handle.detach());
        assert_eq!(dispatcher.count(), 1);
        assert_eq!(handle.state(), ProcessState::Terminated);
    }

    #[test]
    fn test_detach_before_bind_skips_registration() {
        let registry = ProcessRegistry::new();
        let (handle, dispatcher) = recorded_handle(false);
        handle.detach();
        handle.bind_launch_result(&registry, 92).unwrap();
        assert!(!registry.contains(92));

        handle.handle_termination(0).unwrap();
        assert_eq!(dispatcher.count(), 0);
    }

    #[test]
    fn test_concurrent_detach_and_termination_decide_exactly_once() {
        for round in 0..200u32 {
            let registry = ProcessRegistry::new();
            let (handle, dispatcher) = recorded_handle(false);
            let pid = 1000 + round;
            handle.bind_launch_result(&registry, pid).unwrap();

            let detacher = {
                let handle = handle.clone();
                std::thread::spawn(move || handle.detach())
            };
            let reaper = {
                let handle = handle.clone();
                std::thread::spawn(move || handle.handle_termination(0))
            };
            let suppressed = detacher.join().unwrap();
            reaper.join().unwrap().unwrap();

            // Exactly one side won: detach suppressed it, or it was delivered
            assert_eq!(handle.state(), ProcessState::Terminated);
            assert_eq!(dispatcher.count(), if suppressed { 0 } else { 1 });
            assert!(!registry.contains(pid));
        }
    }

    #[test]
    fn test_signaled_termination_record() {
        let registry = ProcessRegistry::new();
        let (handle, dispatcher) = recorded_handle(false);
        handle.bind_launch_result(&registry, 93).unwrap();

        handle.handle_termination(Termination::signaled(9)).unwrap();
        let signal = dispatcher.delivered().remove(0);
        assert_eq!(signal.exit_code, ABNORMAL_EXIT_CODE);
        assert_eq!(signal.signal, Some(9));
    }

    #[tokio::test]
    async fn test_wait_resolves_after_termination() {
        let registry = ProcessRegistry::new();
        let handle = ProcessHandle::create(false);
        handle.bind_launch_result(&registry, 94).unwrap();

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait().await })
        };
        tokio::task::yield_now().await;
        handle.handle_termination(5).unwrap();

        let signal = waiter.await.unwrap().unwrap();
        assert_eq!((signal.pid, signal.exit_code), (94, 5));
        // Already terminated: resolves immediately
        assert_eq!(handle.wait().await.unwrap().exit_code, 5);
    }

    #[tokio::test]
    async fn test_set_pipes_requires_redirection() {
        let handle = ProcessHandle::create(false);
        let err = handle.set_pipes(None, None, None).unwrap_err();
        assert!(matches!(err, CoreError::NotRedirected(_)));

        let err = handle.write_input(b"x").await.unwrap_err();
        assert!(matches!(err, CoreError::NotRedirected(_)));
        assert!(!handle.is_input_open());
        assert!(!handle.is_output_available());
        assert_eq!(handle.output_status(), PipeStatus::EndOfStream);
        handle.close_output();
    }

    #[tokio::test]
    async fn test_termination_closes_stdin_and_keeps_output() {
        let registry = ProcessRegistry::new();
        let (handle, _dispatcher) = recorded_handle(true);
        handle.bind_launch_result(&registry, 95).unwrap();

        let (mut child_out, parent_out) = duplex(64);
        let (parent_in, _child_in) = duplex(64);
        handle
            .set_pipes(Some(Box::pin(parent_out)), Some(Box::pin(parent_in)), None)
            .unwrap();
        assert!(handle.is_input_open());

        child_out.write_all(b"bye").await.unwrap();
        drop(child_out);
        handle.handle_termination(0).unwrap();

        assert!(!handle.is_input_open());
        let stdout = handle.stdout().unwrap();
        assert_eq!(stdout.read_to_end().await, b"bye".to_vec());
        assert!(!handle.is_output_available());
    }

    #[test]
    fn test_failed_signal_leaves_handle_running() {
        let registry = ProcessRegistry::new();
        let control = MockProcessControl::new();
        let handle = ProcessHandle::create(false);
        handle.bind_launch_result(&registry, 96).unwrap();

        let err = handle
            .send_signal_with(&control, SignalKind::Term, KillFlags::NoChildren)
            .unwrap_err();
        assert_eq!(err.code(), "KILL001");
        assert_eq!(handle.state(), ProcessState::Running);

        control.add_process(96);
        handle
            .send_signal_with(&control, SignalKind::Term, KillFlags::NoChildren)
            .unwrap();
        assert_eq!(control.calls(), vec![(96, SignalKind::Term, KillFlags::NoChildren)]);
    }

    #[test]
    fn test_signal_requires_running_handle() {
        let control = MockProcessControl::new();
        let handle = ProcessHandle::create(false);
        let err = handle
            .send_signal_with(&control, SignalKind::Kill, KillFlags::NoChildren)
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));
        assert!(control.calls().is_empty());
    }

    #[test]
    fn test_static_kill_and_exists_delegate() {
        let control = MockProcessControl::new();
        control.add_process(500);
        assert!(ProcessHandle::exists_with(&control, 500));
        assert!(!ProcessHandle::exists_with(&control, 501));
        assert_eq!(
            ProcessHandle::kill_with(&control, 501, SignalKind::Term, KillFlags::NoChildren),
            Err(KillError::NoSuchProcess(501))
        );
    }
}

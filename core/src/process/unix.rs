//! Unix spawning and signalling
//!
//! Children are started with `tokio::process` and, unless configured
//! otherwise, placed in a new session via `setsid()` so that the whole tree
//! can be signalled through its process group.
//!
//! ## Process Groups
//!
//! When a process calls `setsid()`, it:
//! - Creates a new session and becomes the session leader
//! - Creates a new process group and becomes the process group leader
//! - Has no controlling terminal
//!
//! [`UnixProcessControl`] uses this with [`KillFlags::Children`]: the group
//! is signalled first and the root pid afterwards.

// setsid/setpriority run in the forked child before exec
#![allow(unsafe_code)]

use crate::control::ProcessControl;
use crate::{CoreError, KillError, Result};
use nix::errno::Errno;
use nix::sys::signal::{self, killpg, Signal};
use nix::unistd::Pid;
use schema::{CommandSpec, KillFlags, SignalKind, PRIORITY_DEFAULT, PRIORITY_MAX};
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, error, warn};

/// How to start one child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Pipe stdin/stdout/stderr instead of inheriting them
    pub redirect: bool,
    /// Priority hint in `0..=100`
    pub priority: u32,
    /// Run the child in its own session and process group
    pub new_process_group: bool,
}

impl Default for SpawnOptions {
    fn default() -> Self {
        Self {
            redirect: false,
            priority: PRIORITY_DEFAULT,
            new_process_group: true,
        }
    }
}

/// A spawned, not yet reaped child
#[derive(Debug)]
pub struct ChildProcess {
    pid: Pid,
    group_leader: bool,
    child: Child,
}

impl ChildProcess {
    /// Get the process ID
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    /// Whether the child leads its own process group
    pub fn is_group_leader(&self) -> bool {
        self.group_leader
    }

    /// Wait for the process to exit and return its exit status
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        self.child.wait().await.map_err(|e| {
            CoreError::ProcessWait(format!("Failed to wait for process {}: {}", self.pid, e))
        })
    }

    /// Ask the OS to kill the child without waiting for it
    pub fn start_kill(&mut self) -> Result<()> {
        self.child.start_kill().map_err(CoreError::from)
    }

    /// Take the stdin handle, if piped
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    /// Take the stdout handle, if piped
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    /// Take the stderr handle, if piped
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }
}

/// Nice value for a priority hint, or `None` to leave the inherited one
///
/// 0 maps to the lowest scheduling priority (nice 19), 100 to the highest
/// (nice -20).
pub fn priority_to_nice(priority: u32) -> Option<i32> {
    if priority == PRIORITY_DEFAULT {
        return None;
    }
    let priority = priority.min(PRIORITY_MAX) as i32;
    Some((20 - 2 * priority / 5).clamp(-20, 19))
}

/// Spawn `spec` according to `options`
///
/// The program is executed directly, never through a shell. With
/// `new_process_group` the child calls `setsid()` before `exec`, becoming
/// the leader of a new session and process group so that
/// [`KillFlags::Children`] reaches everything it starts. A priority other
/// than the default is applied as a nice value in the same pre-exec hook.
///
/// ## Arguments
///
/// * `spec` - Program, argument vector, extra environment and working directory
/// * `options` - Redirection, priority hint and process-group placement
///
/// ## Safety
///
/// The pre-exec hook runs between `fork` and `exec` and only calls
/// `setsid()` and `setpriority()`, both async-signal-safe.
///
/// ## Error Handling
///
/// - `ValidationError` for an empty program name
/// - `ProcessSpawn` when the OS refuses to start the program (not found,
///   not executable, `setsid()` failed)
///
/// Must be called from within a tokio runtime.
///
/// ## Example
///
/// ```rust,no_run
/// use brood_core::process::unix::{spawn, SpawnOptions};
/// use brood_core::CommandSpec;
///
/// # async fn run() -> brood_core::Result<()> {
/// let mut child = spawn(&CommandSpec::new("echo").args(["hello", "world"]), &SpawnOptions::default())?;
/// println!("Spawned process with PID: {}", child.pid());
/// child.wait().await?;
/// # Ok(())
/// # }
/// ```
pub fn spawn(spec: &CommandSpec, options: &SpawnOptions) -> Result<ChildProcess> {
    if spec.program.is_empty() {
        return Err(CoreError::ValidationError("program must not be empty".to_string()));
    }
    debug!("Spawning process: {} {:?}", spec.program, spec.args);

    let mut command = Command::new(&spec.program);
    command.args(&spec.args);
    command.envs(&spec.environment);
    if let Some(dir) = &spec.working_directory {
        command.current_dir(dir);
    }

    if options.redirect {
        command.stdin(Stdio::piped());
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
    } else {
        command.stdin(Stdio::inherit());
        command.stdout(Stdio::inherit());
        command.stderr(Stdio::inherit());
    }

    let new_group = options.new_process_group;
    let nice = priority_to_nice(options.priority);
    if new_group || nice.is_some() {
        // Safety: setsid() and setpriority() are async-signal-safe
        #[deny(unsafe_op_in_unsafe_fn)]
        unsafe {
            command.pre_exec(move || {
                if new_group && libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                if let Some(nice) = nice {
                    // Raising priority needs privileges we may lack; the child runs regardless
                    let _ = libc::setpriority(libc::PRIO_PROCESS, 0, nice);
                }
                Ok(())
            });
        }
    }

    let child = command.spawn().map_err(|e| {
        error!("Failed to spawn process '{}': {}", spec.program, e);
        CoreError::ProcessSpawn(format!("Failed to spawn '{}': {}", spec.program, e))
    })?;

    let raw_pid = child
        .id()
        .ok_or_else(|| CoreError::ProcessSpawn("Spawned child did not have a PID".to_string()))?;
    let raw_pid = i32::try_from(raw_pid)
        .map_err(|_| CoreError::ProcessSpawn(format!("PID {} out of range", raw_pid)))?;
    let pid = Pid::from_raw(raw_pid);
    debug!(
        "Spawned process {} (new group: {}, nice: {:?})",
        pid, new_group, nice
    );

    Ok(ChildProcess {
        pid,
        group_leader: new_group,
        child,
    })
}

/// [`ProcessControl`] backed by `kill(2)` and `killpg(2)`
#[derive(Debug, Default, Clone, Copy)]
pub struct UnixProcessControl;

impl ProcessControl for UnixProcessControl {
    /// Send `kind` to `pid`, and to its process group with [`KillFlags::Children`]
    ///
    /// With `Children` the group is signalled first, best effort: a failure
    /// is logged and the root pid is still signalled directly, and that
    /// direct outcome is returned. If the group signal succeeded but the
    /// root is already gone by the time of the direct signal (e.g. a
    /// `SIGKILL` let the reaper collect it in between), the call succeeds.
    ///
    /// ## Arguments
    ///
    /// * `pid` - Target process; 0 and values beyond `i32::MAX` are rejected
    ///   so that no process group is ever addressed by accident
    /// * `kind` - Signal to send; [`SignalKind::None`] only checks that the target exists
    /// * `flags` - Whether to include the target's process group
    ///
    /// ## Error Handling
    ///
    /// - `ESRCH` → [`KillError::NoSuchProcess`]
    /// - `EPERM` → [`KillError::AccessDenied`]
    /// - `EINVAL` and [`SignalKind::Emt`] → [`KillError::OperationNotSupported`]
    /// - anything else → [`KillError::Failed`]
    fn kill(&self, pid: u32, kind: SignalKind, flags: KillFlags) -> std::result::Result<(), KillError> {
        let target = to_pid(pid).ok_or(KillError::NoSuchProcess(pid))?;
        let sig = to_signal(kind)?;

        let group_signalled = if flags == KillFlags::Children {
            match killpg(target, sig) {
                Ok(()) => {
                    debug!("Sent {} to process group {}", kind, pid);
                    true
                }
                Err(e) => {
                    warn!(
                        "Failed to send {} to process group {}: {}; signalling the process directly",
                        kind, pid, e
                    );
                    false
                }
            }
        } else {
            false
        };

        settle_direct_kill(pid, group_signalled, signal::kill(target, sig))?;
        debug!("Sent {} to process {}", kind, pid);
        Ok(())
    }

    fn exists(&self, pid: u32) -> bool {
        let Some(target) = to_pid(pid) else {
            return false;
        };
        match signal::kill(target, None) {
            Ok(()) => true,
            Err(Errno::EPERM) => {
                debug!("Process {} exists but is not ours, reporting absent", pid);
                false
            }
            Err(_) => false,
        }
    }
}

/// Positive pids only: 0 and negative values would address process groups
fn to_pid(pid: u32) -> Option<Pid> {
    match i32::try_from(pid) {
        Ok(raw) if raw > 0 => Some(Pid::from_raw(raw)),
        _ => None,
    }
}

fn to_signal(kind: SignalKind) -> std::result::Result<Option<Signal>, KillError> {
    let signal = match kind {
        SignalKind::None => return Ok(None),
        SignalKind::Hup => Signal::SIGHUP,
        SignalKind::Int => Signal::SIGINT,
        SignalKind::Quit => Signal::SIGQUIT,
        SignalKind::Ill => Signal::SIGILL,
        SignalKind::Trap => Signal::SIGTRAP,
        SignalKind::Abrt => Signal::SIGABRT,
        SignalKind::Emt => {
            return Err(KillError::OperationNotSupported(kind.name().to_string()));
        }
        SignalKind::Fpe => Signal::SIGFPE,
        SignalKind::Kill => Signal::SIGKILL,
        SignalKind::Bus => Signal::SIGBUS,
        SignalKind::Segv => Signal::SIGSEGV,
        SignalKind::Sys => Signal::SIGSYS,
        SignalKind::Pipe => Signal::SIGPIPE,
        SignalKind::Alrm => Signal::SIGALRM,
        SignalKind::Term => Signal::SIGTERM,
    };
    Ok(Some(signal))
}

/// Outcome of the direct kill, given whether the group signal already landed
fn settle_direct_kill(
    pid: u32,
    group_signalled: bool,
    direct: nix::Result<()>,
) -> std::result::Result<(), KillError> {
    match direct {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) if group_signalled => {
            debug!("Process {} exited after its group was signalled", pid);
            Ok(())
        }
        Err(e) => Err(map_errno(pid, e)),
    }
}

fn map_errno(pid: u32, errno: Errno) -> KillError {
    match errno {
        Errno::ESRCH => KillError::NoSuchProcess(pid),
        Errno::EPERM => KillError::AccessDenied(pid),
        Errno::EINVAL => KillError::OperationNotSupported(errno.to_string()),
        other => KillError::Failed {
            pid,
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_to_nice() {
        assert_eq!(priority_to_nice(PRIORITY_DEFAULT), None);
        assert_eq!(priority_to_nice(0), Some(19));
        assert_eq!(priority_to_nice(100), Some(-20));
        assert_eq!(priority_to_nice(25), Some(10));
        assert_eq!(priority_to_nice(75), Some(-10));
        assert_eq!(priority_to_nice(500), Some(-20));
    }

    #[test]
    fn test_signal_mapping() {
        assert_eq!(to_signal(SignalKind::None), Ok(None));
        assert_eq!(to_signal(SignalKind::Term), Ok(Some(Signal::SIGTERM)));
        assert_eq!(to_signal(SignalKind::Alrm), Ok(Some(Signal::SIGALRM)));
        assert!(matches!(
            to_signal(SignalKind::Emt),
            Err(KillError::OperationNotSupported(_))
        ));
    }

    #[test]
    fn test_errno_mapping() {
        assert_eq!(map_errno(5, Errno::ESRCH), KillError::NoSuchProcess(5));
        assert_eq!(map_errno(5, Errno::EPERM), KillError::AccessDenied(5));
        assert!(matches!(
            map_errno(5, Errno::EINVAL),
            KillError::OperationNotSupported(_)
        ));
        assert!(matches!(map_errno(5, Errno::EIO), KillError::Failed { pid: 5, .. }));
    }

    #[test]
    fn test_root_gone_after_group_signal_is_success() {
        assert_eq!(settle_direct_kill(7, true, Err(Errno::ESRCH)), Ok(()));
        assert_eq!(
            settle_direct_kill(7, false, Err(Errno::ESRCH)),
            Err(KillError::NoSuchProcess(7))
        );
        assert_eq!(
            settle_direct_kill(7, true, Err(Errno::EPERM)),
            Err(KillError::AccessDenied(7))
        );
        assert_eq!(settle_direct_kill(7, false, Ok(())), Ok(()));
    }

    #[test]
    fn test_invalid_pids_never_reach_the_os() {
        let control = UnixProcessControl;
        assert_eq!(
            control.kill(0, SignalKind::Term, KillFlags::Children),
            Err(KillError::NoSuchProcess(0))
        );
        assert_eq!(
            control.kill(u32::MAX, SignalKind::Term, KillFlags::NoChildren),
            Err(KillError::NoSuchProcess(u32::MAX))
        );
        assert!(!control.exists(0));
        assert!(!control.exists(u32::MAX));
    }

    #[test]
    fn test_signal_none_checks_self() {
        let control = UnixProcessControl;
        assert!(control.exists(std::process::id()));
        control
            .kill(std::process::id(), SignalKind::None, KillFlags::NoChildren)
            .unwrap();
    }

    #[tokio::test]
    async fn test_spawn_and_wait() {
        let mut child = spawn(&CommandSpec::new("true"), &SpawnOptions::default())
            .expect("Failed to spawn true");
        assert!(child.pid() > 0);
        assert!(child.is_group_leader());
        let status = child.wait().await.expect("Failed to wait for process");
        assert!(status.success());
    }

    #[tokio::test]
    async fn test_spawn_in_new_group() {
        let mut child = spawn(&CommandSpec::new("sleep").arg("5"), &SpawnOptions::default())
            .expect("Failed to spawn sleep");
        let pgid = nix::unistd::getpgid(Some(Pid::from_raw(child.pid() as i32))).unwrap();
        assert_eq!(pgid.as_raw() as u32, child.pid());

        UnixProcessControl
            .kill(child.pid(), SignalKind::Kill, KillFlags::Children)
            .unwrap();
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_command() {
        let result = spawn(
            &CommandSpec::new("nonexistent_command_12345"),
            &SpawnOptions::default(),
        );
        match result.unwrap_err() {
            CoreError::ProcessSpawn(_) => {}
            e => panic!("Expected ProcessSpawn error, got: {}", e),
        }
    }

    #[tokio::test]
    async fn test_spawn_empty_program() {
        let result = spawn(&CommandSpec::default(), &SpawnOptions::default());
        assert!(matches!(result, Err(CoreError::ValidationError(_))));
    }

    #[tokio::test]
    async fn test_redirected_spawn_pipes_everything() {
        let options = SpawnOptions {
            redirect: true,
            priority: 10,
            new_process_group: false,
        };
        let mut child = spawn(&CommandSpec::new("true"), &options).unwrap();
        assert!(!child.is_group_leader());
        assert!(child.take_stdin().is_some());
        assert!(child.take_stdout().is_some());
        assert!(child.take_stderr().is_some());
        assert!(child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_environment_and_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let options = SpawnOptions {
            redirect: true,
            ..SpawnOptions::default()
        };
        let spec = CommandSpec::new("sh")
            .args(["-c", "test \"$BROOD_MARK\" = yes && test \"$(pwd -P)\" = \"$EXPECTED\""])
            .env("BROOD_MARK", "yes")
            .env(
                "EXPECTED",
                dir.path().canonicalize().unwrap().to_string_lossy().to_string(),
            )
            .current_dir(dir.path().to_string_lossy().to_string());
        let mut child = spawn(&spec, &options).unwrap();
        assert!(child.wait().await.unwrap().success());
    }
}

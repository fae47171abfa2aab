//! Launching children and reaping them
//!
//! The [`Launcher`] ties the pieces together: it spawns the OS process,
//! binds the pid into the caller's handle, wires the pipes and starts one
//! reaper task per child. The reaper owns a clone of the handle until the
//! child exits, so the caller may drop its own clone at any time without
//! losing the exit notification.

use crate::config::RuntimeConfig;
use crate::handle::{HandleBuilder, ProcessHandle, Termination};
use crate::process::unix::{self, ChildProcess, SpawnOptions};
use crate::registry::ProcessRegistry;
use crate::streams::{PipeReader, PipeWriter};
use crate::{CoreError, Result};
use schema::{CommandSpec, ABNORMAL_EXIT_CODE};
use tracing::{debug, error, info, warn};

/// Spawns children into [`ProcessHandle`]s
#[derive(Debug, Clone)]
pub struct Launcher {
    registry: ProcessRegistry,
    config: RuntimeConfig,
}

impl Launcher {
    /// Launch into `registry` with `config`
    pub fn new(registry: ProcessRegistry, config: RuntimeConfig) -> Self {
        Self { registry, config }
    }

    /// Registry the launched handles are tracked in
    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Active configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Handle builder preset from the configuration
    pub fn handle_builder(&self) -> HandleBuilder {
        ProcessHandle::builder()
            .priority(self.config.default_priority)
            .drain_chunk_size(self.config.drain_chunk_size)
            .max_buffered_bytes(self.config.max_buffered_bytes)
            .drain_grace(self.config.drain_grace())
    }

    /// Start `spec` as the child of `handle` and return its pid
    ///
    /// The child inherits the handle's priority and redirection setting. When
    /// the handle is redirected its pipes are attached before this returns;
    /// a failure to attach them is logged and the child keeps running
    /// without captured streams. A reaper task then waits for the child and
    /// finalizes `handle` when it exits.
    ///
    /// ## Arguments
    ///
    /// * `handle` - A handle in state `Created`
    /// * `spec` - Program, arguments, environment and working directory
    ///
    /// ## Error Handling
    ///
    /// - `InitializationError` when called outside a tokio runtime
    /// - `InvalidState` when the handle was already launched
    /// - `ValidationError` / `ProcessSpawn` when the OS process could not be
    ///   started; the handle stays `Created` and may be launched again
    /// - `AlreadyBound` when a concurrent launch bound the handle first; the
    ///   extra child is killed
    ///
    /// ## Example
    ///
    /// ```rust,no_run
    /// use brood_core::{CommandSpec, Launcher, ProcessHandle, ProcessRegistry, RuntimeConfig};
    ///
    /// # async fn run() -> brood_core::Result<()> {
    /// let launcher = Launcher::new(ProcessRegistry::new(), RuntimeConfig::default());
    /// let handle = ProcessHandle::create(false);
    /// let pid = launcher.launch(&handle, &CommandSpec::new("sleep").arg("1"))?;
    /// println!("Launched {}", pid);
    /// handle.wait().await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn launch(&self, handle: &ProcessHandle, spec: &CommandSpec) -> Result<u32> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            CoreError::InitializationError(format!("launching needs a tokio runtime: {}", e))
        })?;

        let state = handle.state();
        if !state.is_configurable() {
            return Err(CoreError::InvalidState(format!(
                "cannot launch a handle that is {}",
                state
            )));
        }

        let options = SpawnOptions {
            redirect: handle.is_redirected(),
            priority: handle.priority(),
            new_process_group: self.config.new_process_group,
        };
        let mut child = unix::spawn(spec, &options)?;
        let pid = child.pid();

        if let Err(e) = handle.bind_launch_result(&self.registry, pid) {
            // Lost a race with another launch of the same handle
            if let Err(kill_err) = child.start_kill() {
                warn!("Failed to kill unbound process {}: {}", pid, kill_err);
            }
            return Err(e);
        }

        if options.redirect {
            let stdout = child.take_stdout().map(|pipe| Box::pin(pipe) as PipeReader);
            let stdin = child.take_stdin().map(|pipe| Box::pin(pipe) as PipeWriter);
            let stderr = child.take_stderr().map(|pipe| Box::pin(pipe) as PipeReader);
            if let Err(e) = handle.set_pipes(stdout, stdin, stderr) {
                warn!("Process {} runs without captured streams: {}", pid, e);
            }
        }

        info!("Launched process {}: {} {:?}", pid, spec.program, spec.args);
        spawn_reaper(&runtime, handle.clone(), pid, child);
        Ok(pid)
    }

    /// Launch `spec` with redirected streams and the configured priority
    pub fn open(&self, spec: &CommandSpec) -> Result<ProcessHandle> {
        let handle = self.handle_builder().redirect(true).build();
        self.launch(&handle, spec)?;
        Ok(handle)
    }
}

/// Wait for `child` and finalize the handle it was launched into
///
/// The reaper finalizes its own handle rather than whatever the registry
/// holds for `pid`: by the time the exit is observed the OS may have reused
/// the pid for a child registered by someone else.
fn spawn_reaper(runtime: &tokio::runtime::Handle, handle: ProcessHandle, pid: u32, mut child: ChildProcess) {
    runtime.spawn(async move {
        let termination = match child.wait().await {
            Ok(status) => Termination::from_status(status),
            Err(e) => {
                error!("{}", e);
                Termination::exited(ABNORMAL_EXIT_CODE)
            }
        };
        debug!("Reaped process {}: {:?}", pid, termination);

        if let Err(e) = handle.handle_termination(termination) {
            debug!("Process {} already finalized: {}", pid, e);
        }
    });
}

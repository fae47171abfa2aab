//! Core functionality for Brood
//!
//! Asynchronous child-process handles: a [`ProcessHandle`] tracks one child
//! from launch to reaping, optionally captures its standard streams, and
//! hands exactly one [`ExitSignal`] to its [`NotificationDispatcher`] unless
//! the caller detached first.
//!
//! ```rust,no_run
//! use brood_core::{CommandSpec, Launcher, ProcessRegistry, RuntimeConfig};
//!
//! # async fn run() -> brood_core::Result<()> {
//! let launcher = Launcher::new(ProcessRegistry::new(), RuntimeConfig::default());
//! let handle = launcher.open(&CommandSpec::new("echo").arg("hello"))?;
//! if let Some(stdout) = handle.stdout() {
//!     let output = stdout.read_to_end().await;
//!     println!("{}", String::from_utf8_lossy(&output));
//! }
//! let exit = handle.wait().await?;
//! println!("exit code {}", exit.exit_code);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod handle;
#[cfg(unix)]
pub mod launcher;
#[cfg(unix)]
pub mod process;
pub mod registry;
pub mod streams;


// Re-export schema types for convenience
pub use schema::*;

pub use config::{load_runtime_config_from_toml_path, load_runtime_config_from_toml_str, RuntimeConfig};
pub use control::{MockProcessControl, ProcessControl};
pub use dispatch::{
    BroadcastDispatcher, CallbackDispatcher, ChannelDispatcher, NotificationDispatcher, NullDispatcher,
    RecordingDispatcher,
};
pub use error::{CoreError, KillError, Result};
pub use handle::{HandleBuilder, ProcessHandle, Termination};
#[cfg(unix)]
pub use launcher::Launcher;
pub use registry::ProcessRegistry;
pub use streams::{OutputReader, PipeStatus, StreamBundle};

/// Core utilities and helper functions
pub mod utils {
    use tracing::info;

    /// Initialize tracing for the application
    ///
    /// `RUST_LOG` wins over `level` when set.
    pub fn init_tracing(level: &str) -> crate::Result<()> {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

        fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| crate::CoreError::InitializationError(e.to_string()))?;

        info!("Tracing initialized with level: {}", level);
        Ok(())
    }

    /// Validate `config` and initialize tracing with its log level
    pub fn init_from_config(config: &crate::RuntimeConfig) -> crate::Result<()> {
        config.validate()?;
        init_tracing(&config.log_level)
    }
}

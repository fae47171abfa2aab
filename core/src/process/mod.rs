//! Platform-specific spawning and signalling
//!
//! - **Unix**: `tokio::process` with `setsid()`/`setpriority()` in the child,
//!   signals via `nix`

#[cfg(unix)]
pub mod unix;

#[cfg(unix)]
pub use unix::*;

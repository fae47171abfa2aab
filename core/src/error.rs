//! Core error types and utilities

use thiserror::Error;

/// Core-specific error types
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Initialization error: {0}")]
    InitializationError(String),

    /// Launch result bound twice, or bound with an unusable pid
    #[error("Already bound: {0}")]
    AlreadyBound(String),

    /// Mutation attempted outside the window in which it is allowed
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Pipe operation on a handle created without redirection
    #[error("Not redirected: {0}")]
    NotRedirected(String),

    /// A handle was asked to terminate twice; this is a programming defect
    #[error("Double termination of process {0}")]
    DoubleTermination(u32),

    #[error("Process spawn error: {0}")]
    ProcessSpawn(String),

    #[error("Process wait error: {0}")]
    ProcessWait(String),

    #[error("Kill failed: {0}")]
    Kill(#[from] KillError),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Generic error: {0}")]
    Other(String),
}

impl CoreError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::ConfigurationError(_) => "CORE001",
            CoreError::ValidationError(_) => "CORE002",
            CoreError::InitializationError(_) => "CORE003",
            CoreError::AlreadyBound(_) => "CORE010",
            CoreError::InvalidState(_) => "CORE011",
            CoreError::NotRedirected(_) => "CORE012",
            CoreError::DoubleTermination(_) => "CORE013",
            CoreError::ProcessSpawn(_) => "CORE020",
            CoreError::ProcessWait(_) => "CORE021",
            CoreError::Kill(e) => e.code(),
            CoreError::IoError(_) => "CORE005",
            CoreError::SerializationError(_) => "CORE006",
            CoreError::Other(_) => "CORE999",
        }
    }
}

/// Outcome of a failed kill request
///
/// Probing and signalling arbitrary pids is best effort, so these are
/// returned as values and never escalated to panics.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KillError {
    /// Target process does not exist (or already exited and was reaped)
    #[error("no such process: {0}")]
    NoSuchProcess(u32),

    /// Caller lacks the privilege to signal the target
    #[error("access denied signalling process {0}")]
    AccessDenied(u32),

    /// Signal kind cannot be delivered on this platform
    #[error("operation not supported: {0}")]
    OperationNotSupported(String),

    /// Any other OS failure
    #[error("kill of process {pid} failed: {reason}")]
    Failed {
        /// Target pid
        pid: u32,
        /// OS error description
        reason: String,
    },
}

impl KillError {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            KillError::NoSuchProcess(_) => "KILL001",
            KillError::AccessDenied(_) => "KILL002",
            KillError::OperationNotSupported(_) => "KILL003",
            KillError::Failed { .. } => "KILL999",
        }
    }

    /// Whether retrying with more privilege could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, KillError::AccessDenied(_))
    }
}

/// Core-specific result type
pub type Result<T> = std::result::Result<T, CoreError>;

// Convenience implementations
impl From<&str> for CoreError {
    fn from(s: &str) -> Self {
        CoreError::Other(s.to_string())
    }
}

impl From<String> for CoreError {
    fn from(s: String) -> Self {
        CoreError::Other(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(CoreError::ConfigurationError("test".to_string()).code(), "CORE001");
        assert_eq!(CoreError::ValidationError("test".to_string()).code(), "CORE002");
        assert_eq!(CoreError::AlreadyBound("test".to_string()).code(), "CORE010");
        assert_eq!(CoreError::InvalidState("test".to_string()).code(), "CORE011");
        assert_eq!(CoreError::NotRedirected("test".to_string()).code(), "CORE012");
        assert_eq!(CoreError::DoubleTermination(1).code(), "CORE013");
        assert_eq!(CoreError::Other("test".to_string()).code(), "CORE999");
    }

    #[test]
    fn test_kill_error_codes_pass_through() {
        let err: CoreError = KillError::NoSuchProcess(7).into();
        assert_eq!(err.code(), "KILL001");
        let err: CoreError = KillError::AccessDenied(7).into();
        assert_eq!(err.code(), "KILL002");
    }

    #[test]
    fn test_error_display() {
        let error = CoreError::InvalidState("priority is fixed once spawned".to_string());
        assert_eq!(error.to_string(), "Invalid state: priority is fixed once spawned");

        let error = CoreError::DoubleTermination(42);
        assert_eq!(error.to_string(), "Double termination of process 42");
    }
}

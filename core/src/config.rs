//! Runtime configuration loading and validation
//!
//! This module parses a TOML document into [`RuntimeConfig`], applies
//! defaults through serde, and performs strict validation with field-path
//! error messages.

use crate::{CoreError, Result};
use schema::{PRIORITY_DEFAULT, PRIORITY_MAX};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Tunables shared by the launcher, stream bundles and reapers
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Default tracing filter when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Priority given to handles created by [`crate::Launcher::open`]
    #[serde(default = "default_priority")]
    pub default_priority: u32,
    /// Read size used by the stdout/stderr drain tasks
    #[serde(default = "default_drain_chunk_size")]
    pub drain_chunk_size: usize,
    /// Cap on bytes buffered per output stream; draining pauses when reached
    #[serde(default = "default_max_buffered_bytes")]
    pub max_buffered_bytes: usize,
    /// How long drain tasks may keep reading after the child was reaped
    #[serde(default = "default_drain_grace_ms")]
    pub drain_grace_ms: u64,
    /// Start each child in its own session and process group
    #[serde(default = "default_new_process_group")]
    pub new_process_group: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            default_priority: default_priority(),
            drain_chunk_size: default_drain_chunk_size(),
            max_buffered_bytes: default_max_buffered_bytes(),
            drain_grace_ms: default_drain_grace_ms(),
            new_process_group: default_new_process_group(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_priority() -> u32 {
    PRIORITY_DEFAULT
}

fn default_drain_chunk_size() -> usize {
    8 * 1024
}

fn default_max_buffered_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_drain_grace_ms() -> u64 {
    500
}

fn default_new_process_group() -> bool {
    true
}

impl RuntimeConfig {
    /// Grace period for drain tasks as a Duration
    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    /// Validate the configuration and return `Result<()>` with field-path errors
    pub fn validate(&self) -> Result<()> {
        if self.log_level.trim().is_empty() {
            return Err(CoreError::ValidationError(
                "logLevel: cannot be empty".to_string(),
            ));
        }
        if self.default_priority > PRIORITY_MAX {
            return Err(CoreError::ValidationError(format!(
                "defaultPriority: must be 0..={}, got {}",
                PRIORITY_MAX, self.default_priority
            )));
        }
        if self.drain_chunk_size == 0 {
            return Err(CoreError::ValidationError(
                "drainChunkSize: must be > 0".to_string(),
            ));
        }
        if self.max_buffered_bytes == 0 {
            return Err(CoreError::ValidationError(
                "maxBufferedBytes: must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load runtime config from a TOML file path
pub fn load_runtime_config_from_toml_path(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    let data = fs::read_to_string(&path).map_err(|e| {
        CoreError::ConfigurationError(format!("Failed to read config {:?}: {}", path.as_ref(), e))
    })?;
    load_runtime_config_from_toml_str(&data)
}

/// Load runtime config from a TOML string
pub fn load_runtime_config_from_toml_str(input: &str) -> Result<RuntimeConfig> {
    let cfg: RuntimeConfig = toml::from_str(input)
        .map_err(|e| CoreError::ConfigurationError(format!("TOML parse error: {}", e)))?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_yields_defaults() {
        let cfg = load_runtime_config_from_toml_str("").expect("should parse");
        assert_eq!(cfg, RuntimeConfig::default());
        assert_eq!(cfg.default_priority, PRIORITY_DEFAULT);
        assert_eq!(cfg.drain_grace(), Duration::from_millis(500));
        assert_eq!(cfg.max_buffered_bytes, 4 * 1024 * 1024);
        assert!(cfg.new_process_group);
    }

    #[test]
    fn parses_camel_case_fields() {
        let input = r#"
        logLevel = "debug"
        defaultPriority = 80
        drainChunkSize = 1024
        maxBufferedBytes = 65536
        drainGraceMs = 50
        newProcessGroup = false
        "#;
        let cfg = load_runtime_config_from_toml_str(input).expect("should parse");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.default_priority, 80);
        assert_eq!(cfg.drain_chunk_size, 1024);
        assert_eq!(cfg.max_buffered_bytes, 65536);
        assert_eq!(cfg.drain_grace_ms, 50);
        assert!(!cfg.new_process_group);
    }

    #[test]
    fn errors_on_priority_out_of_range() {
        let err = load_runtime_config_from_toml_str("defaultPriority = 101").unwrap_err();
        assert!(format!("{}", err).contains("defaultPriority"));
    }

    #[test]
    fn errors_on_zero_chunk_size() {
        let err = load_runtime_config_from_toml_str("drainChunkSize = 0").unwrap_err();
        assert!(format!("{}", err).contains("drainChunkSize: must be > 0"));
    }

    #[test]
    fn errors_on_zero_buffer_cap() {
        let err = load_runtime_config_from_toml_str("maxBufferedBytes = 0").unwrap_err();
        assert!(format!("{}", err).contains("maxBufferedBytes: must be > 0"));
    }

    #[test]
    fn errors_on_unknown_field() {
        let err = load_runtime_config_from_toml_str("bogus = 1").unwrap_err();
        assert!(matches!(err, CoreError::ConfigurationError(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "drainGraceMs = 10").expect("write config");
        let cfg = load_runtime_config_from_toml_path(file.path()).expect("should load");
        assert_eq!(cfg.drain_grace_ms, 10);
    }

    #[test]
    fn missing_file_is_configuration_error() {
        let err = load_runtime_config_from_toml_path("/nonexistent/brood.toml").unwrap_err();
        assert_eq!(err.code(), "CORE001");
    }
}

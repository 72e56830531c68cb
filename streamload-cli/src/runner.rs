//! CLI runner for common setup.
//!
//! Loads and validates the engine configuration and initializes logging so
//! command handlers can start from a ready [`EngineConfig`].

use std::path::{Path, PathBuf};
use tracing::info;

use streamload::config::EngineConfig;
use streamload::logging::{default_log_dir, default_log_file, init_logging, LoggingGuard};

use crate::error::CliError;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "streamload.ini";

/// Runner that owns the logging guard for the lifetime of a command.
pub struct CliRunner {
    /// Keeps the file writer alive while the runner exists
    #[allow(dead_code)]
    logging_guard: LoggingGuard,
    config: EngineConfig,
}

impl CliRunner {
    /// Loads configuration and initializes logging under `log_dir`.
    pub fn new(config_path: Option<&Path>, log_dir: Option<&Path>) -> Result<Self, CliError> {
        let config = load_config(config_path)?;

        let log_dir = log_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(default_log_dir()));
        let logging_guard = init_logging(&log_dir, default_log_file())
            .map_err(|e| CliError::LoggingInit(e.to_string()))?;

        Ok(Self {
            logging_guard,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Log startup information for a command.
    pub fn log_startup(&self, command: &str) {
        info!("streamload v{}", streamload::VERSION);
        info!(command, "streamload CLI starting");
    }
}

/// Loads and validates the configuration, falling back to the default file.
pub fn load_config(path: Option<&Path>) -> Result<EngineConfig, CliError> {
    let path = path
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = EngineConfig::load_from(&path)?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_missing_file_yields_defaults() {
        let temp = tempfile::tempdir().unwrap();
        let config = load_config(Some(&temp.path().join("absent.ini"))).unwrap();
        assert_eq!(config.queue.shards_per_stream, 1);
    }

    #[test]
    fn test_file_values_are_applied() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("streamload.ini");
        fs::write(&path, "[queue]\nshards_per_stream = 3\n").unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.queue.shards_per_stream, 3);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("streamload.ini");
        fs::write(&path, "[queue]\nshards_per_stream = 0\n").unwrap();

        let err = load_config(Some(&path)).err().unwrap();
        assert!(matches!(err, CliError::Config(ref m) if m.contains("shards_per_stream")));
    }
}

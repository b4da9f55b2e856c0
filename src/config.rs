//! Configuration parsing and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_http_port() -> u16 {
    3000
}

fn default_flush_timeout_ms() -> u64 {
    2000
}

/// Configuration parsed from `config.toml`. Every field has a default.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct CureConfig {
    /// Directory holding `error.log`.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// HTTP port for the demo server.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// Upper bound on waiting for the error log to drain before a trapped exit.
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
}

impl Default for CureConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            http_port: default_http_port(),
            flush_timeout_ms: default_flush_timeout_ms(),
        }
    }
}

impl CureConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or is invalid.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            AppError::Config(format!("cannot read config {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.log_dir.as_os_str().is_empty() {
            return Err(AppError::Config("log_dir must not be empty".into()));
        }
        if self.log_dir.is_file() {
            return Err(AppError::Config(format!(
                "log_dir {} is a file",
                self.log_dir.display()
            )));
        }
        if self.flush_timeout_ms == 0 {
            return Err(AppError::Config(
                "flush_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Path of the error log file.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(crate::sink::LOG_FILE_NAME)
    }

    /// Flush timeout as a [`Duration`].
    #[must_use]
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

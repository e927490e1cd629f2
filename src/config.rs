//! Bridge configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

fn default_connection_timeout_seconds() -> u64 {
    90
}

/// Client-side configuration parsed from `bridge.toml`.
///
/// Describes how to launch the worker process and how long the session
/// facade waits for it to complete the handshake.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct BridgeConfig {
    /// Worker executable launched for each session.
    pub worker_path: PathBuf,
    /// Extra arguments placed before the protocol arguments.
    #[serde(default)]
    pub worker_args: Vec<String>,
    /// How long the facade waits for the handshake to succeed.
    #[serde(default = "default_connection_timeout_seconds")]
    pub connection_timeout_seconds: u64,
    /// Diagnostics log forwarded to the worker as `/diag:<path>`.
    #[serde(default)]
    pub diagnostics_log: Option<PathBuf>,
    /// Whether `/parentprocessid:<pid>` is passed to the worker. Off by
    /// default, leaving `/port:<n>` as the only protocol argument.
    #[serde(default)]
    pub inherit_parent_process_id: bool,
    /// Additional environment variables for the worker process.
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

impl BridgeConfig {
    /// Build a configuration with defaults for everything but the worker path.
    #[must_use]
    pub fn new(worker_path: impl Into<PathBuf>) -> Self {
        Self {
            worker_path: worker_path.into(),
            worker_args: Vec::new(),
            connection_timeout_seconds: default_connection_timeout_seconds(),
            diagnostics_log: None,
            inherit_parent_process_id: false,
            environment: HashMap::new(),
        }
    }

    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Handshake timeout used by the session facade.
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_seconds)
    }

    fn validate(&self) -> Result<()> {
        if self.worker_path.as_os_str().is_empty() {
            return Err(AppError::Config("worker_path must not be empty".into()));
        }

        if self.connection_timeout_seconds == 0 {
            return Err(AppError::Config(
                "connection_timeout_seconds must be greater than zero".into(),
            ));
        }

        Ok(())
    }
}

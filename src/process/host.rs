//! Launching custom test hosts requested by the worker.
//!
//! During a custom-host run the worker sends a process start description and
//! expects the client to start that process and report its id.
//! [`CommandHostLauncher`] is a ready-made [`TestHostLauncher`] that does this
//! with a plain child process.

use std::collections::HashMap;
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;
use tracing::info;

use crate::protocol::message::TestProcessStartInfo;
use crate::{AppError, Result};

/// Launches a custom test host on behalf of the worker.
pub trait TestHostLauncher: Send {
    /// Start the process described by `start_info` and return its process id.
    ///
    /// # Errors
    ///
    /// Returns an error if the process could not be started. The worker is
    /// told about the failure and the run continues.
    fn launch_test_host(&mut self, start_info: &TestProcessStartInfo) -> Result<i32>;

    /// Whether the launched host will have a debugger attached.
    fn is_debug(&self) -> bool {
        false
    }
}

impl<F> TestHostLauncher for F
where
    F: FnMut(&TestProcessStartInfo) -> Result<i32> + Send,
{
    fn launch_test_host(&mut self, start_info: &TestProcessStartInfo) -> Result<i32> {
        self(start_info)
    }
}

/// Typed view of the start description fields the launcher uses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProcessStartFields {
    file_name: String,
    #[serde(default)]
    arguments: Option<String>,
    #[serde(default)]
    working_directory: Option<String>,
    #[serde(default)]
    environment_variables: Option<HashMap<String, String>>,
}

/// [`TestHostLauncher`] that spawns the described process directly.
///
/// Must be used from within a tokio runtime. Launched hosts are not killed
/// when the launcher is dropped; the worker owns their lifetime.
#[derive(Debug, Default)]
pub struct CommandHostLauncher {
    launched: Vec<u32>,
}

impl CommandHostLauncher {
    /// Create a launcher with no launched hosts.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of every host this launcher started.
    #[must_use]
    pub fn launched(&self) -> &[u32] {
        &self.launched
    }
}

impl TestHostLauncher for CommandHostLauncher {
    fn launch_test_host(&mut self, start_info: &TestProcessStartInfo) -> Result<i32> {
        let fields: ProcessStartFields = serde_json::from_value(start_info.clone())
            .map_err(|err| AppError::Protocol(format!("invalid process start info: {err}")))?;

        let mut cmd = Command::new(&fields.file_name);
        cmd.args(split_arguments(fields.arguments.as_deref().unwrap_or_default()))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(ref dir) = fields.working_directory {
            cmd.current_dir(dir);
        }
        if let Some(ref vars) = fields.environment_variables {
            cmd.envs(vars);
        }

        let child = cmd.spawn().map_err(|err| {
            AppError::Process(format!(
                "failed to launch test host '{}': {err}",
                fields.file_name
            ))
        })?;

        let pid = child
            .id()
            .ok_or_else(|| AppError::Process("test host exited before reporting a pid".into()))?;
        self.launched.push(pid);
        info!(pid, file_name = fields.file_name, "custom test host launched");

        i32::try_from(pid).map_err(|_| AppError::Process(format!("pid {pid} out of range")))
    }
}

/// Split a command-line string on whitespace, keeping double-quoted runs
/// together and dropping the quotes.
fn split_arguments(raw: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for ch in raw.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}

//! Worker command-line arguments.
//!
//! The worker is told where to connect with a single `/port:<n>` argument.
//! Optional `/parentprocessid:<pid>` and `/diag:<path>` arguments let the
//! worker watch the client and write a diagnostics log.

use std::path::PathBuf;

use crate::config::BridgeConfig;
use crate::{AppError, Result};

const PORT_PREFIX: &str = "/port:";
const PARENT_PROCESS_ID_PREFIX: &str = "/parentprocessid:";
const DIAG_PREFIX: &str = "/diag:";

/// Parameters forwarded to a worker on its command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsoleParameters {
    /// Port returned by the session driver's `initialize_communication`.
    pub port: u16,
    /// Client process id, so the worker can exit if the client dies.
    pub parent_process_id: Option<u32>,
    /// Diagnostics log path for the worker.
    pub log_file_path: Option<PathBuf>,
}

impl ConsoleParameters {
    /// Parameters carrying only the connection port.
    #[must_use]
    pub fn for_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Parameters for a worker described by `config`, connecting on `port`.
    #[must_use]
    pub fn from_config(port: u16, config: &BridgeConfig) -> Self {
        Self {
            port,
            parent_process_id: config.inherit_parent_process_id.then(std::process::id),
            log_file_path: config.diagnostics_log.clone(),
        }
    }

    /// Render the protocol arguments in the order the worker expects.
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(3);
        if let Some(pid) = self.parent_process_id {
            args.push(format!("{PARENT_PROCESS_ID_PREFIX}{pid}"));
        }
        args.push(format_port_argument(self.port));
        if let Some(ref path) = self.log_file_path {
            args.push(format!("{DIAG_PREFIX}{}", path.display()));
        }
        args
    }
}

/// Format the connection argument for `port`.
#[must_use]
pub fn format_port_argument(port: u16) -> String {
    format!("{PORT_PREFIX}{port}")
}

/// Parse a `/port:<n>` argument. The prefix is matched case-insensitively.
///
/// # Errors
///
/// Returns `AppError::Config` if `arg` is not a port argument or the port is
/// not a valid non-zero `u16`.
pub fn parse_port_argument(arg: &str) -> Result<u16> {
    let value = strip_prefix_ignore_case(arg, PORT_PREFIX)
        .ok_or_else(|| AppError::Config(format!("expected {PORT_PREFIX}<n>, got '{arg}'")))?;

    match value.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(AppError::Config(format!("invalid port '{value}'"))),
    }
}

fn strip_prefix_ignore_case<'a>(arg: &'a str, prefix: &str) -> Option<&'a str> {
    let head = arg.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        arg.get(prefix.len()..)
    } else {
        None
    }
}

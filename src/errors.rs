//! Error types shared across the crate.

use std::fmt::{Display, Formatter};

/// Shared crate result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Error enumeration covering every failure mode of a worker session.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Socket or channel failure while listening, accepting, sending, or receiving.
    Transport(String),
    /// Version negotiation failed, or an operation ran before it succeeded.
    Handshake(String),
    /// Malformed envelope or payload for a recognised message type.
    Protocol(String),
    /// Worker or custom host process could not be started or stopped.
    Process(String),
    /// Call made in a session state that forbids it.
    InvalidState(String),
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Handshake(msg) => write!(f, "handshake: {msg}"),
            Self::Protocol(msg) => write!(f, "protocol: {msg}"),
            Self::Process(msg) => write!(f, "process: {msg}"),
            Self::InvalidState(msg) => write!(f, "invalid state: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Protocol(format!("json: {err}"))
    }
}

/// Socket reads and writes surface `io::Error` through the framed codec.
impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

#![forbid(unsafe_code)]

//! Client side of an out-of-process test session.
//!
//! A client launches a worker process, accepts its connection on a loopback
//! port, negotiates a protocol version, and then issues discovery and run
//! requests whose progress streams back as newline-delimited JSON messages.
//!
//! Most callers use [`wrapper::ConsoleWrapper`]. The lower layers
//! ([`session::driver::SessionDriver`], [`channel::Channel`],
//! [`process::manager::WorkerProcessManager`]) are public for callers that
//! manage the worker themselves.

pub mod channel;
pub mod config;
pub mod errors;
pub mod process;
pub mod protocol;
pub mod session;
pub mod wrapper;

pub use config::BridgeConfig;
pub use errors::{AppError, Result};

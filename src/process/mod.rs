//! Worker and custom test host processes.
//!
//! - `args`: the worker command line (`/port:<n>` and friends).
//! - `manager`: [`WorkerProcessManager`](manager::WorkerProcessManager),
//!   which starts, watches, and stops the worker.
//! - `host`: launching custom test hosts on the worker's behalf.

pub mod args;
pub mod host;
pub mod manager;

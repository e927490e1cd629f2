//! Worker process lifecycle.
//!
//! [`WorkerProcessManager`] starts the worker executable with the session's
//! protocol arguments, watches it from a background monitor task, and
//! reports its exit exactly once as [`WorkerEvent::Exited`].
//!
//! The monitor task owns the [`Child`]. It races the natural exit of the
//! process against a stop request; whichever wins produces the notification,
//! and a shared [`AtomicBool`] gate guarantees a second one is never sent.
//!
//! Notifications are offered to the event channel without waiting. A full or
//! closed channel drops the event with a warning, so a caller that does not
//! drain its events never blocks [`WorkerProcessManager::stop`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::BridgeConfig;
use crate::process::args::ConsoleParameters;
use crate::{AppError, Result};

/// Notifications emitted by [`WorkerProcessManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// The worker process is gone, either on its own or because it was stopped.
    Exited {
        /// OS process id, if it was known.
        pid: Option<u32>,
        /// Exit code, if the process exited normally.
        exit_code: Option<i32>,
        /// Human-readable reason.
        reason: String,
    },
}

/// Handle to a started worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerHandle {
    /// OS process id.
    pub pid: Option<u32>,
}

#[derive(Debug)]
struct RunningWorker {
    pid: Option<u32>,
    stop: CancellationToken,
    exited: Arc<AtomicBool>,
    monitor: JoinHandle<()>,
}

/// Starts, watches, and stops one worker process at a time.
#[derive(Debug)]
pub struct WorkerProcessManager {
    program: PathBuf,
    base_args: Vec<String>,
    environment: HashMap<String, String>,
    events: mpsc::Sender<WorkerEvent>,
    running: Mutex<Option<RunningWorker>>,
}

impl WorkerProcessManager {
    /// Create a manager for `program`. Exit notifications go to `events`.
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, events: mpsc::Sender<WorkerEvent>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            environment: HashMap::new(),
            events,
            running: Mutex::new(None),
        }
    }

    /// Create a manager from the worker settings in `config`.
    #[must_use]
    pub fn from_config(config: &BridgeConfig, events: mpsc::Sender<WorkerEvent>) -> Self {
        Self {
            program: config.worker_path.clone(),
            base_args: config.worker_args.clone(),
            environment: config.environment.clone(),
            events,
            running: Mutex::new(None),
        }
    }

    /// Start the worker with the protocol arguments in `params`.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidState` if a worker started by this manager is
    ///   still running.
    /// - `AppError::Process` if the OS refuses to spawn the executable.
    pub fn start(&self, params: &ConsoleParameters) -> Result<WorkerHandle> {
        let mut slot = self
            .running
            .lock()
            .map_err(|_| AppError::Process("worker state lock poisoned".into()))?;

        if let Some(ref running) = *slot {
            if !running.exited.load(Ordering::Acquire) {
                return Err(AppError::InvalidState(format!(
                    "worker process {:?} is already running",
                    running.pid
                )));
            }
        }

        let args: Vec<String> = self
            .base_args
            .iter()
            .cloned()
            .chain(params.to_args())
            .collect();

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .envs(&self.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Process(format!(
                "failed to spawn worker '{}': {err}",
                self.program.display()
            ))
        })?;

        let pid = child.id();
        info!(?pid, program = %self.program.display(), ?args, "worker process started");

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout, pid, "stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr, pid, "stderr"));
        }

        let stop = CancellationToken::new();
        let exited = Arc::new(AtomicBool::new(false));
        let monitor = tokio::spawn(
            monitor_exit(
                child,
                pid,
                stop.clone(),
                Arc::clone(&exited),
                self.events.clone(),
            )
            .instrument(info_span!("worker_monitor", ?pid)),
        );

        *slot = Some(RunningWorker {
            pid,
            stop,
            exited,
            monitor,
        });

        Ok(WorkerHandle { pid })
    }

    /// Forcibly terminate the worker and wait until its exit is reported.
    ///
    /// No-op when no worker was started or it already exited.
    pub async fn stop(&self) {
        let running = self.running.lock().ok().and_then(|mut slot| slot.take());
        let Some(running) = running else {
            return;
        };

        if running.exited.load(Ordering::Acquire) {
            debug!(pid = ?running.pid, "stop requested for exited worker");
            return;
        }

        running.stop.cancel();
        if let Err(err) = running.monitor.await {
            warn!(pid = ?running.pid, %err, "worker monitor task failed");
        }
    }

    /// Whether a worker was started and has not exited yet.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.running.lock().is_ok_and(|slot| {
            slot.as_ref()
                .is_some_and(|running| !running.exited.load(Ordering::Acquire))
        })
    }

    /// Process id of the current worker, if one was started.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.running
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(|running| running.pid))
    }
}

impl Drop for WorkerProcessManager {
    fn drop(&mut self) {
        if let Ok(Some(running)) = self.running.get_mut() {
            running.stop.cancel();
        }
    }
}

// ── Exit monitor ─────────────────────────────────────────────────────────────

/// Wait for the worker to exit or for a stop request, then report the exit.
async fn monitor_exit(
    mut child: Child,
    pid: Option<u32>,
    stop: CancellationToken,
    exited: Arc<AtomicBool>,
    events: mpsc::Sender<WorkerEvent>,
) {
    let (exit_code, reason) = tokio::select! {
        result = child.wait() => match result {
            Ok(status) => {
                let code = status.code();
                let reason = code.map_or_else(
                    || "process terminated by signal".to_owned(),
                    |c| format!("process exited with code {c}"),
                );
                (code, reason)
            }
            Err(err) => {
                warn!(%err, "error waiting for worker process");
                (None, format!("wait error: {err}"))
            }
        },
        () = stop.cancelled() => {
            if let Err(err) = child.kill().await {
                warn!(%err, "failed to kill worker process");
            }
            (None, "process stopped by client".to_owned())
        }
    };

    notify_exited(&exited, &events, pid, exit_code, reason);
}

/// Deliver [`WorkerEvent::Exited`] unless it was already delivered.
fn notify_exited(
    exited: &AtomicBool,
    events: &mpsc::Sender<WorkerEvent>,
    pid: Option<u32>,
    exit_code: Option<i32>,
    reason: String,
) {
    if exited
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    info!(?pid, ?exit_code, reason, "worker process exited");

    let event = WorkerEvent::Exited {
        pid,
        exit_code,
        reason,
    };
    match events.try_send(event) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(?pid, "worker event channel is full; exit notification dropped");
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            warn!(?pid, "worker event receiver dropped; exit notification discarded");
        }
    }
}

/// Forward a worker output stream to the log, one line per event.
async fn forward_output<R>(stream: R, pid: Option<u32>, name: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(?pid, stream = name, "{line}"),
            Ok(None) => break,
            Err(err) => {
                debug!(?pid, stream = name, %err, "worker output closed with error");
                break;
            }
        }
    }
}

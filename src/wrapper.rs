//! Console wrapper: the session facade most callers use.
//!
//! [`ConsoleWrapper`] pairs a [`WorkerProcessManager`] with a
//! [`SessionDriver`]. Every request first makes sure a worker is running and
//! has completed the handshake, starting a fresh one when needed, then
//! forwards to the driver.
//!
//! If the worker exits between requests, the next request starts a new
//! worker and a new session. The old driver is closed. The same happens after
//! an abort the worker never answered: that session cannot take another
//! request until the worker speaks again, so it is replaced.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::channel::socket::SocketChannel;
use crate::config::BridgeConfig;
use crate::process::args::ConsoleParameters;
use crate::process::host::TestHostLauncher;
use crate::process::manager::{WorkerEvent, WorkerProcessManager};
use crate::protocol::message::TestCase;
use crate::session::driver::SessionDriver;
use crate::session::{
    DiscoveryEventsHandler, DiscoveryResult, HandshakeState, RunEventsHandler, RunResult,
};
use crate::{AppError, Result};

/// Session facade that launches the worker on demand.
#[derive(Debug)]
pub struct ConsoleWrapper {
    config: BridgeConfig,
    process: WorkerProcessManager,
    session: Mutex<Option<Arc<SessionDriver>>>,
}

impl ConsoleWrapper {
    /// Create a facade for the worker described by `config`. Worker exits are
    /// reported on `events`.
    #[must_use]
    pub fn new(config: BridgeConfig, events: mpsc::Sender<WorkerEvent>) -> Self {
        let process = WorkerProcessManager::from_config(&config, events);
        Self {
            config,
            process,
            session: Mutex::new(None),
        }
    }

    /// Configuration this facade was built with.
    #[must_use]
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Process id of the current worker, if one was started.
    #[must_use]
    pub fn worker_pid(&self) -> Option<u32> {
        self.process.pid()
    }

    /// Start the worker and complete the handshake without issuing a request.
    ///
    /// # Errors
    ///
    /// See [`ConsoleWrapper::discover_tests`].
    pub async fn start_session(&self) -> Result<()> {
        self.ensure_initialized().await.map(|_| ())
    }

    /// Ask the worker to load extensions from `paths`.
    ///
    /// # Errors
    ///
    /// Returns the startup errors of [`ConsoleWrapper::discover_tests`], or
    /// `AppError::Transport` if the request cannot be sent.
    pub async fn initialize_extensions(&self, paths: &[String]) -> Result<()> {
        let driver = self.ensure_initialized().await?;
        driver.initialize_extensions(paths).await
    }

    /// Discover tests in `sources`.
    ///
    /// # Errors
    ///
    /// - `AppError::Process` if the worker cannot be started.
    /// - `AppError::Handshake` if the worker does not complete the handshake
    ///   within the configured timeout.
    /// - `AppError::InvalidState` if another operation is in flight.
    pub async fn discover_tests<H>(
        &self,
        sources: &[String],
        run_settings: Option<&str>,
        handler: &mut H,
    ) -> Result<DiscoveryResult>
    where
        H: DiscoveryEventsHandler + ?Sized,
    {
        let driver = self.ensure_initialized().await?;
        driver.discover_tests(sources, run_settings, handler).await
    }

    /// Run every test in `sources`.
    ///
    /// # Errors
    ///
    /// See [`ConsoleWrapper::discover_tests`].
    pub async fn run_tests<H>(
        &self,
        sources: &[String],
        run_settings: Option<&str>,
        handler: &mut H,
    ) -> Result<RunResult>
    where
        H: RunEventsHandler + ?Sized,
    {
        let driver = self.ensure_initialized().await?;
        driver.start_test_run(sources, run_settings, handler).await
    }

    /// Run the given `test_cases`.
    ///
    /// # Errors
    ///
    /// See [`ConsoleWrapper::discover_tests`].
    pub async fn run_tests_with_test_cases<H>(
        &self,
        test_cases: &[TestCase],
        run_settings: Option<&str>,
        handler: &mut H,
    ) -> Result<RunResult>
    where
        H: RunEventsHandler + ?Sized,
    {
        let driver = self.ensure_initialized().await?;
        driver
            .start_test_run_with_test_cases(test_cases, run_settings, handler)
            .await
    }

    /// Run every test in `sources` in a host started by `launcher`.
    ///
    /// # Errors
    ///
    /// See [`ConsoleWrapper::discover_tests`].
    pub async fn run_tests_with_custom_host<H>(
        &self,
        sources: &[String],
        run_settings: Option<&str>,
        handler: &mut H,
        launcher: &mut dyn TestHostLauncher,
    ) -> Result<RunResult>
    where
        H: RunEventsHandler + ?Sized,
    {
        let driver = self.ensure_initialized().await?;
        driver
            .start_test_run_with_custom_host(sources, run_settings, handler, launcher)
            .await
    }

    /// Run the given `test_cases` in a host started by `launcher`.
    ///
    /// # Errors
    ///
    /// See [`ConsoleWrapper::discover_tests`].
    pub async fn run_test_cases_with_custom_host<H>(
        &self,
        test_cases: &[TestCase],
        run_settings: Option<&str>,
        handler: &mut H,
        launcher: &mut dyn TestHostLauncher,
    ) -> Result<RunResult>
    where
        H: RunEventsHandler + ?Sized,
    {
        let driver = self.ensure_initialized().await?;
        driver
            .start_test_run_with_test_cases_and_custom_host(
                test_cases,
                run_settings,
                handler,
                launcher,
            )
            .await
    }

    /// Ask the worker to cancel the current run.
    ///
    /// # Errors
    ///
    /// - `AppError::InvalidState` if no session is active.
    /// - `AppError::Transport` if the request cannot be sent.
    pub async fn cancel_test_run(&self) -> Result<()> {
        let driver = self
            .current()
            .await
            .ok_or_else(|| AppError::InvalidState("no active session".into()))?;
        driver.cancel_test_run().await
    }

    /// Unblock the caller of the operation in flight. No-op without a session.
    pub async fn abort_test_run(&self) {
        if let Some(driver) = self.current().await {
            driver.abort_test_run();
        }
    }

    /// End the session and stop the worker. Safe to call more than once.
    pub async fn end_session(&self) {
        let driver = self.session.lock().await.take();
        if let Some(driver) = driver {
            driver.end_session().await;
        }
        self.process.stop().await;
        info!("console session ended");
    }

    // ── Private helpers ──────────────────────────────────────────────────────

    async fn current(&self) -> Option<Arc<SessionDriver>> {
        self.session.lock().await.clone()
    }

    /// Return a ready driver, starting a worker and negotiating first when
    /// there is no live one.
    async fn ensure_initialized(&self) -> Result<Arc<SessionDriver>> {
        let mut slot = self.session.lock().await;

        if let Some(ref driver) = *slot {
            if self.process.is_initialized()
                && driver.handshake_state() == HandshakeState::Succeeded
                && !driver.has_abandoned_receive()
            {
                return Ok(Arc::clone(driver));
            }
        }

        if let Some(stale) = slot.take() {
            if stale.has_abandoned_receive() {
                info!("previous operation was aborted; restarting worker");
            }
            debug!("discarding stale session");
            stale.close().await;
            self.process.stop().await;
        }

        let driver = Arc::new(SessionDriver::new(Arc::new(SocketChannel::new())));
        let port = driver.initialize_communication().await?;

        let params = ConsoleParameters::from_config(port, &self.config);

        if let Err(err) = self.process.start(&params) {
            driver.close().await;
            return Err(err);
        }

        let timeout = self.config.connection_timeout();
        let connected = driver
            .wait_for_connection(timeout)
            .instrument(info_span!("wait_for_worker", port))
            .await;
        if !connected {
            warn!(port, ?timeout, "worker did not complete the handshake");
            driver.close().await;
            self.process.stop().await;
            return Err(AppError::Handshake(format!(
                "worker did not complete the handshake within {}s",
                timeout.as_secs()
            )));
        }

        info!(port, pid = ?self.process.pid(), "console session ready");
        *slot = Some(Arc::clone(&driver));
        Ok(driver)
    }
}

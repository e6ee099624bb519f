//! The public session controller.
//!
//! `BotSession` owns the configuration and the callback of one bot. Each
//! `start` spawns a fresh poller and dispatcher with their own offset, bound to
//! a run-scoped child of the session's root cancellation token; `stop` cancels
//! that token and returns without waiting for the tasks to exit.

use super::lifecycle::{LoopSpawnParams, SessionLoops};
use crate::api::client::{HttpUpdateSource, UpdateSource};
use crate::api::metrics::{SourceMetrics, SourceMetricsSnapshot};
use crate::poller::offset::OffsetTracker;
use crate::runtime::bot::LongPollingBot;
use crate::runtime::config::SessionConfig;
use crate::runtime::telemetry::Telemetry;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::Dispatch;

/// Misuse of the session lifecycle. Never retried internally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    AlreadyRunning,
    NotRunning,
    TokenAlreadySet,
    CallbackAlreadySet,
    MissingCallback,
    /// No token was set and no custom update source was injected.
    MissingToken,
    /// `start` was called outside a tokio runtime.
    NoRuntime,
    /// The default HTTP update source could not be built.
    SourceSetup(String),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::AlreadyRunning => write!(f, "session already running"),
            SessionError::NotRunning => write!(f, "session not running"),
            SessionError::TokenAlreadySet => write!(f, "token already set"),
            SessionError::CallbackAlreadySet => write!(f, "callback already set"),
            SessionError::MissingCallback => write!(f, "no callback set"),
            SessionError::MissingToken => {
                write!(f, "no token set and no custom update source provided")
            }
            SessionError::NoRuntime => write!(f, "no tokio runtime available to host the session"),
            SessionError::SourceSetup(reason) => {
                write!(f, "failed to build update source: {reason}")
            }
        }
    }
}

impl std::error::Error for SessionError {}

pub struct BotSession {
    config: SessionConfig,
    token: Option<String>,
    callback: Option<Arc<dyn LongPollingBot>>,
    source: Option<Arc<dyn UpdateSource>>,
    logger: Option<Dispatch>,
    shutdown_root: CancellationToken,
    offset: Arc<OffsetTracker>,
    source_metrics: Option<Arc<SourceMetrics>>,
    telemetry: Arc<Telemetry>,
    running: bool,
    loops: Option<SessionLoops>,
}

impl Default for BotSession {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl BotSession {
    /// Creates an idle session with its own root cancellation token.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_cancellation_token(config, CancellationToken::new())
    }

    /// Creates an idle session whose runs are children of `shutdown_token`.
    ///
    /// Cancelling the root ends the loops of the current run but leaves the
    /// session marked as running until `stop` is called.
    pub fn with_cancellation_token(config: SessionConfig, shutdown_token: CancellationToken) -> Self {
        Self {
            config,
            token: None,
            callback: None,
            source: None,
            logger: None,
            shutdown_root: shutdown_token,
            offset: Arc::new(OffsetTracker::default()),
            source_metrics: None,
            telemetry: Arc::new(Telemetry::default()),
            running: false,
            loops: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn set_token(&mut self, token: impl Into<String>) -> Result<(), SessionError> {
        if self.token.is_some() {
            return Err(SessionError::TokenAlreadySet);
        }
        self.token = Some(token.into());
        Ok(())
    }

    pub fn set_callback(&mut self, callback: Arc<dyn LongPollingBot>) -> Result<(), SessionError> {
        if self.callback.is_some() {
            return Err(SessionError::CallbackAlreadySet);
        }
        self.callback = Some(callback);
        Ok(())
    }

    /// Replaces the default HTTP update source. Takes effect on the next `start`.
    pub fn set_update_source(&mut self, source: Arc<dyn UpdateSource>) {
        self.source = Some(source);
    }

    /// Routes the session's logs to `logger` instead of the dispatcher that is
    /// current when `start` is called. Takes effect on the next `start`.
    pub fn set_logger(&mut self, logger: Dispatch) {
        self.logger = Some(logger);
    }

    /// Replaces the root shutdown token used to derive per-run cancellation tokens.
    /// This must only be called while the session is idle (i.e. between `stop` and `start`).
    pub fn replace_shutdown_root(&mut self, shutdown: CancellationToken) {
        debug_assert!(
            !self.running,
            "shutdown token should not change while the session is running"
        );
        self.shutdown_root = shutdown;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Whether tasks of the most recent run may still be executing.
    pub fn has_active_loops(&self) -> bool {
        self.loops
            .as_ref()
            .map(|loops| !loops.is_finished())
            .unwrap_or(false)
    }

    /// Highest update id accepted so far in the current (or last) run.
    pub fn last_offset(&self) -> i64 {
        self.offset.current()
    }

    /// Request counters of the default HTTP source used by the current (or last)
    /// run. `None` when an update source was injected or nothing was started.
    pub fn source_metrics(&self) -> Option<SourceMetricsSnapshot> {
        self.source_metrics.as_ref().map(|metrics| metrics.snapshot())
    }

    /// Returns a clone of the telemetry handle for observability.
    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Launches the poller and dispatcher and returns without waiting for them.
    pub fn start(&mut self) -> Result<(), SessionError> {
        if self.running {
            return Err(SessionError::AlreadyRunning);
        }

        let bot = self.callback.clone().ok_or(SessionError::MissingCallback)?;
        Handle::try_current().map_err(|_| SessionError::NoRuntime)?;
        let (source, source_metrics) = self.resolve_source()?;
        let logger = self
            .logger
            .clone()
            .unwrap_or_else(|| tracing::dispatcher::get_default(Dispatch::clone));

        // A stopped run may still be finishing a batch against its own tracker.
        self.offset = Arc::new(OffsetTracker::default());
        self.source_metrics = source_metrics.clone();
        let loops = SessionLoops::spawn(LoopSpawnParams {
            shutdown_root: &self.shutdown_root,
            config: &self.config,
            bot: bot.clone(),
            source,
            source_metrics,
            offset: self.offset.clone(),
            telemetry: self.telemetry.clone(),
            logger: logger.clone(),
        });
        self.loops = Some(loops);
        self.running = true;

        tracing::dispatcher::with_default(&logger, || {
            tracing::info!(
                bot = bot.bot_username(),
                limit = self.config.limit(),
                long_poll_timeout_secs = self.config.long_poll_timeout().as_secs(),
                "bot session started"
            );
        });
        Ok(())
    }

    /// Signals both loops to exit and runs the bot's `on_closing` hook.
    ///
    /// Does not wait for the loops; see [`Self::wait_stopped`].
    pub fn stop(&mut self) -> Result<(), SessionError> {
        if !self.running {
            return Err(SessionError::NotRunning);
        }

        self.running = false;
        if let Some(loops) = &self.loops {
            loops.cancel();
        }

        self.with_logger(|| {
            tracing::info!(offset = self.offset.current(), "bot session stopping");
        });
        if let Some(bot) = &self.callback {
            bot.on_closing();
        }
        Ok(())
    }

    /// Waits for the tasks of the most recent run to exit.
    ///
    /// Returns immediately while the session is running or when nothing was started.
    pub async fn wait_stopped(&mut self) {
        if self.running {
            return;
        }
        if let Some(loops) = self.loops.take() {
            loops.join().await;
        }
    }

    fn resolve_source(
        &self,
    ) -> Result<(Arc<dyn UpdateSource>, Option<Arc<SourceMetrics>>), SessionError> {
        if let Some(source) = &self.source {
            return Ok((source.clone(), None));
        }

        let token = self.token.as_deref().ok_or(SessionError::MissingToken)?;
        let source = HttpUpdateSource::from_config(token, &self.config)
            .map_err(|err| SessionError::SourceSetup(format!("{err:#}")))?;
        let metrics = source.metrics_handle();
        Ok((Arc::new(source), Some(metrics)))
    }

    fn with_logger<T>(&self, f: impl FnOnce() -> T) -> T {
        match &self.logger {
            Some(logger) => tracing::dispatcher::with_default(logger, f),
            None => f(),
        }
    }
}

impl Drop for BotSession {
    fn drop(&mut self) {
        if let Some(loops) = &self.loops {
            loops.cancel();
        }
    }
}

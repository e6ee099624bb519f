use crate::api::client::UpdateSource;
use crate::runtime::bot::LongPollingBot;
use crate::runtime::config::SessionConfig;
use crate::runtime::session::{BotSession, SessionError};
use anyhow::Result;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Creates a session for `bot`, wires its token and callback, and starts it.
pub fn register_bot(
    bot: Arc<dyn LongPollingBot>,
    config: SessionConfig,
) -> Result<BotSession, SessionError> {
    let mut session = BotSession::new(config);
    session.set_token(bot.bot_token())?;
    session.set_callback(bot)?;
    session.start()?;
    Ok(session)
}

/// Keeps a bot session alive until Ctrl-C (SIGINT) or an external cancellation.
pub struct Runner {
    session: BotSession,
    shutdown: CancellationToken,
}

impl Runner {
    /// Creates a runner whose session polls the remote API with the bot's own token.
    pub fn new(config: SessionConfig, bot: Arc<dyn LongPollingBot>) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let mut session = BotSession::with_cancellation_token(config, shutdown.clone());
        session.set_token(bot.bot_token())?;
        session.set_callback(bot)?;
        Ok(Self { session, shutdown })
    }

    /// Creates a runner whose session reads from `source` instead of the HTTP API.
    pub fn with_update_source(
        config: SessionConfig,
        bot: Arc<dyn LongPollingBot>,
        source: Arc<dyn UpdateSource>,
    ) -> Result<Self> {
        let shutdown = CancellationToken::new();
        let mut session = BotSession::with_cancellation_token(config, shutdown.clone());
        session.set_callback(bot)?;
        session.set_update_source(source);
        Ok(Self { session, shutdown })
    }

    /// Returns a clone of the root shutdown token so external callers can integrate
    /// with their own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn session(&self) -> &BotSession {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut BotSession {
        &mut self.session
    }

    /// Starts the underlying session. Calling it on a running session is a no-op.
    pub fn start(&mut self) -> Result<()> {
        if self.session.is_running() {
            return Ok(());
        }

        self.session.start()?;
        Ok(())
    }

    /// Stops the session gracefully and waits for its loops to exit.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.session.is_running() {
            return Ok(());
        }

        self.shutdown.cancel();
        self.session.stop()?;
        self.session.wait_stopped().await;
        self.reinitialize_shutdown_token();
        Ok(())
    }

    /// Runs until a Ctrl-C (SIGINT) is received or the shutdown token is cancelled elsewhere.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start()?;
        tracing::info!("runner started; waiting for Ctrl-C (SIGINT) to initiate shutdown");

        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Ctrl-C received; shutting down runner");
            }
            _ = self.shutdown.cancelled() => {
                tracing::info!("runner shutdown token cancelled");
            }
        }

        self.stop().await
    }

    fn reinitialize_shutdown_token(&mut self) {
        self.shutdown = CancellationToken::new();
        self.session.replace_shutdown_root(self.shutdown.clone());
    }
}

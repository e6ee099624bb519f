use crate::api::payload::Update;
use anyhow::Error as AnyError;
use core::future::Future;
use core::pin::Pin;

pub type BotFuture<'a> = Pin<Box<dyn Future<Output = Result<(), BotError>> + Send + 'a>>;

/// Error returned by bot handlers. The dispatcher logs it and keeps running.
#[derive(Debug)]
pub struct BotError {
    update_id: Option<i64>,
    source: AnyError,
}

impl BotError {
    pub fn new(source: AnyError) -> Self {
        Self {
            update_id: None,
            source,
        }
    }

    /// Attaches the id of the update that was being handled.
    pub fn for_update(update_id: i64, source: AnyError) -> Self {
        Self {
            update_id: Some(update_id),
            source,
        }
    }

    pub fn update_id(&self) -> Option<i64> {
        self.update_id
    }

    pub fn into_source(self) -> AnyError {
        self.source
    }
}

impl From<AnyError> for BotError {
    fn from(source: AnyError) -> Self {
        Self::new(source)
    }
}

impl core::fmt::Display for BotError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.update_id {
            Some(id) => write!(f, "bot handler failed on update {id}: {}", self.source),
            None => write!(f, "bot handler failed: {}", self.source),
        }
    }
}

impl std::error::Error for BotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}

/// Application callback fed by a long-polling session.
pub trait LongPollingBot: Send + Sync + 'static {
    /// Used as a log field on every session task.
    fn bot_username(&self) -> &str;

    fn bot_token(&self) -> &str;

    /// Handles a single update.
    fn on_update_received<'a>(&'a self, update: Update) -> BotFuture<'a>;

    /// Handles a whole drained batch, invoked once per dispatcher iteration
    /// with a non-empty batch.
    ///
    /// The default forwards each update to [`Self::on_update_received`] in
    /// order and stops at the first error.
    fn on_updates_received<'a>(&'a self, updates: Vec<Update>) -> BotFuture<'a> {
        Box::pin(async move {
            for update in updates {
                self.on_update_received(update).await?;
            }
            Ok(())
        })
    }

    /// Called exactly once per session stop, from the caller of `stop`.
    fn on_closing(&self) {}
}

pub mod api;
pub mod dispatch;
pub mod poller;
pub mod runtime;

pub use api::{
    source_fn, FetchError, FetchOutcome, FetchRequest, HttpSourceOptions, HttpUpdateSource,
    SourceMetricsSnapshot, Update, UpdateSource, MAX_FETCH_LIMIT,
};
pub use poller::{BackoffPolicy, ExponentialBackoff};
pub use runtime::bot::{BotError, BotFuture, LongPollingBot};
pub use runtime::config::{SessionConfig, SessionConfigBuilder, SessionConfigParams};
pub use runtime::runner::{register_bot, Runner};
pub use runtime::session::{BotSession, SessionError};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};

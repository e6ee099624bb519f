//! Update sources consumed by the poller: the `UpdateSource` seam, its request
//! and outcome types, and `HttpUpdateSource`, the default `getUpdates`
//! long-poll client.

use crate::api::metrics::{SourceMetrics, SourceMetricsSnapshot};
use crate::api::options::HttpSourceOptions;
use crate::api::payload::{decode_updates, DecodedResponse, GetUpdatesBody, Update};
use crate::runtime::config::SessionConfig;
use anyhow::{anyhow, bail, Context, Result};
use futures::future::BoxFuture;
use std::future::Future;
use std::{fmt, sync::Arc, time::Duration};
use tokio::time::{timeout, Instant};

/// Largest batch the remote service accepts for a single `getUpdates` call.
pub const MAX_FETCH_LIMIT: u32 = 100;

/// Parameters of one long-poll cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchRequest {
    /// First update id the caller wants to see (last offset + 1).
    pub offset: i64,
    pub limit: u32,
    /// How long the server may hold the request open waiting for updates.
    pub timeout: Duration,
}

impl FetchRequest {
    pub fn validate(&self) -> Result<(), FetchError> {
        if self.limit == 0 || self.limit > MAX_FETCH_LIMIT {
            return Err(FetchError::Validation {
                code: None,
                message: format!(
                    "limit must be between 1 and {MAX_FETCH_LIMIT}, got {}",
                    self.limit
                ),
            });
        }
        Ok(())
    }
}

/// Non-failure results of a fetch.
///
/// A 5xx status and an undecodable body are reported here rather than as
/// [`FetchError`] because the poller retries them without touching its backoff.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Updates(Vec<Update>),
    ServerError { status: u16, body: String },
    Undecodable { reason: String },
}

#[derive(Debug)]
pub enum FetchError {
    Timeout,
    Io(anyhow::Error),
    Validation { code: Option<i64>, message: String },
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Timeout => write!(f, "getUpdates request timed out"),
            FetchError::Io(err) => write!(f, "getUpdates transport failure: {err:#}"),
            FetchError::Validation {
                code: Some(code),
                message,
            } => write!(f, "getUpdates rejected (code={code}): {message}"),
            FetchError::Validation {
                code: None,
                message,
            } => write!(f, "getUpdates rejected: {message}"),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FetchError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

/// Pluggable producer of update batches.
pub trait UpdateSource: Send + Sync {
    fn fetch<'a>(&'a self, request: FetchRequest) -> BoxFuture<'a, Result<FetchOutcome, FetchError>>;
}

/// Adapts a plain async closure into an [`UpdateSource`].
pub struct SourceFn<F>(F);

pub fn source_fn<F, Fut>(f: F) -> SourceFn<F>
where
    F: Fn(FetchRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<FetchOutcome, FetchError>> + Send + 'static,
{
    SourceFn(f)
}

impl<F, Fut> UpdateSource for SourceFn<F>
where
    F: Fn(FetchRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<FetchOutcome, FetchError>> + Send + 'static,
{
    fn fetch<'a>(&'a self, request: FetchRequest) -> BoxFuture<'a, Result<FetchOutcome, FetchError>> {
        Box::pin((self.0)(request))
    }
}

#[derive(Debug, Clone)]
pub struct HttpUpdateSource {
    endpoint: Arc<String>,
    client: reqwest::Client,
    options: HttpSourceOptions,
    metrics: Arc<SourceMetrics>,
}

impl UpdateSource for HttpUpdateSource {
    fn fetch<'a>(&'a self, request: FetchRequest) -> BoxFuture<'a, Result<FetchOutcome, FetchError>> {
        Box::pin(self.get_updates(request))
    }
}

impl HttpUpdateSource {
    pub fn new(token: impl AsRef<str>) -> Result<Self> {
        Self::with_options(token, HttpSourceOptions::default())
    }

    pub fn with_options(token: impl AsRef<str>, options: HttpSourceOptions) -> Result<Self> {
        options.validate()?;

        let token = token.as_ref();
        if token.trim().is_empty() {
            bail!("bot token cannot be empty");
        }

        let client = reqwest::Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(|err| anyhow!("failed to build HTTP client: {err}"))?;

        Ok(Self {
            endpoint: Arc::new(options.endpoint(token)),
            client,
            options,
            metrics: Arc::new(SourceMetrics::default()),
        })
    }

    pub fn from_config(token: impl AsRef<str>, config: &SessionConfig) -> Result<Self> {
        config.validate()?;
        let options = HttpSourceOptions {
            base_url: config.base_url().to_owned(),
            connect_timeout: config.connect_timeout(),
            socket_slack: config.socket_slack(),
            allowed_updates: config.allowed_updates().to_vec(),
        };
        Self::with_options(token, options).context("failed to build default update source")
    }

    pub fn metrics(&self) -> SourceMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Shared counters that keep updating after the source is moved into a run.
    pub(crate) fn metrics_handle(&self) -> Arc<SourceMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Issues a single `getUpdates` long-poll request.
    pub async fn get_updates(&self, request: FetchRequest) -> Result<FetchOutcome, FetchError> {
        request.validate()?;

        let body = GetUpdatesBody {
            offset: request.offset,
            limit: request.limit,
            timeout: request.timeout.as_secs(),
            allowed_updates: self.options.allowed_updates.clone(),
        };
        let request_timeout = request.timeout.saturating_add(self.options.socket_slack);
        let start = Instant::now();

        let exchange = async {
            let response = self
                .client
                .post(self.endpoint.as_str())
                .json(&body)
                .send()
                .await?;
            let status = response.status();
            let bytes = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, bytes))
        };

        let (status, bytes) = match timeout(request_timeout, exchange).await {
            Ok(Ok(exchanged)) => exchanged,
            Ok(Err(err)) => {
                let elapsed = start.elapsed();
                let err = map_transport_error(err);
                if matches!(err, FetchError::Timeout) {
                    self.metrics.record_timeout(elapsed);
                } else {
                    self.metrics.record_failure(elapsed);
                }
                return Err(err);
            }
            Err(_) => {
                self.metrics.record_timeout(start.elapsed());
                return Err(FetchError::Timeout);
            }
        };
        let elapsed = start.elapsed();

        if status.is_server_error() {
            self.metrics.record_server_error(elapsed);
            return Ok(FetchOutcome::ServerError {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&bytes).into_owned(),
            });
        }

        match decode_updates(&bytes) {
            Ok(DecodedResponse::Updates(updates)) => {
                self.metrics.record_success(elapsed);
                tracing::trace!(
                    offset = request.offset,
                    count = updates.len(),
                    "getUpdates call completed"
                );
                Ok(FetchOutcome::Updates(updates))
            }
            Ok(DecodedResponse::Rejected { code, description }) => {
                self.metrics.record_failure(elapsed);
                Err(FetchError::Validation {
                    code,
                    message: description,
                })
            }
            Err(err) => {
                self.metrics.record_failure(elapsed);
                Ok(FetchOutcome::Undecodable {
                    reason: format!("status {status}: {err}"),
                })
            }
        }
    }
}

fn map_transport_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Io(anyhow::Error::new(err).context("getUpdates request failed"))
    }
}

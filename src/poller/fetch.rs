//! The long-poll loop: fetches batches, filters stale ids against the offset,
//! hands survivors to the dispatcher and paces retries.

use super::backoff::{sleep_with_cancellation, ExponentialBackoff, WaitOutcome};
use super::offset::OffsetTracker;
use crate::api::client::{FetchError, FetchOutcome, FetchRequest, UpdateSource};
use crate::api::payload::Update;
use crate::dispatch::queue::UpdateSender;
use crate::runtime::config::SessionConfig;
use crate::runtime::telemetry::Telemetry;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PollSettings {
    pub limit: u32,
    pub long_poll_timeout: Duration,
    pub idle_poll_delay: Duration,
    pub server_error_delay: Duration,
}

impl PollSettings {
    pub(crate) fn from_config(config: &SessionConfig) -> Self {
        Self {
            limit: config.limit(),
            long_poll_timeout: config.long_poll_timeout(),
            idle_poll_delay: config.idle_poll_delay(),
            server_error_delay: config.server_error_delay(),
        }
    }
}

pub(crate) struct PollerParams {
    pub source: Arc<dyn UpdateSource>,
    pub queue: UpdateSender,
    pub offset: Arc<OffsetTracker>,
    pub backoff: ExponentialBackoff,
    pub settings: PollSettings,
    pub shutdown: CancellationToken,
    pub telemetry: Arc<Telemetry>,
}

pub(crate) struct Poller {
    source: Arc<dyn UpdateSource>,
    queue: UpdateSender,
    offset: Arc<OffsetTracker>,
    backoff: ExponentialBackoff,
    settings: PollSettings,
    shutdown: CancellationToken,
    telemetry: Arc<Telemetry>,
}

impl Poller {
    pub(crate) fn new(params: PollerParams) -> Self {
        let PollerParams {
            source,
            queue,
            offset,
            backoff,
            settings,
            shutdown,
            telemetry,
        } = params;

        Self {
            source,
            queue,
            offset,
            backoff,
            settings,
            shutdown,
            telemetry,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::info!(offset = self.offset.current(), "poller started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let request = FetchRequest {
                offset: self.offset.current().saturating_add(1),
                limit: self.settings.limit,
                timeout: self.settings.long_poll_timeout,
            };

            let result = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                result = self.source.fetch(request) => result,
            };

            let Some(delay) = self.handle_result(result) else {
                continue;
            };

            if sleep_with_cancellation(delay, &self.shutdown).await == WaitOutcome::Cancelled {
                break;
            }
        }

        tracing::info!(offset = self.offset.current(), "poller stopped");
    }

    /// Applies one fetch result and returns how long to pause before the next
    /// request, if at all.
    fn handle_result(&mut self, result: Result<FetchOutcome, FetchError>) -> Option<Duration> {
        match result {
            Ok(FetchOutcome::Updates(updates)) => {
                self.backoff.reset();
                if updates.is_empty() {
                    return Some(self.settings.idle_poll_delay);
                }
                self.accept_batch(updates);
                None
            }
            Ok(FetchOutcome::ServerError { status, body }) => {
                self.telemetry.record_server_error();
                tracing::warn!(
                    status,
                    body = %body,
                    retry_in = ?self.settings.server_error_delay,
                    "getUpdates returned a server error"
                );
                Some(self.settings.server_error_delay)
            }
            Ok(FetchOutcome::Undecodable { reason }) => {
                self.telemetry.record_undecodable();
                tracing::error!(
                    reason = %reason,
                    "failed to decode getUpdates response; treating it as an empty batch"
                );
                Some(self.settings.idle_poll_delay)
            }
            Err(err) => {
                let delay = self.backoff.next_delay();
                if matches!(err, FetchError::Timeout) {
                    self.telemetry.record_fetch_timeout();
                    tracing::debug!(backoff = ?delay, "getUpdates timed out");
                } else {
                    self.telemetry.record_fetch_error();
                    tracing::error!(error = %err, backoff = ?delay, "getUpdates failed");
                }
                Some(delay)
            }
        }
    }

    fn accept_batch(&mut self, updates: Vec<Update>) {
        let fetched = updates.len();
        let offset = self.offset.current();
        let (fresh, max_id) = retain_fresh(updates, offset);
        let discarded = fetched - fresh.len();

        self.telemetry.record_fetched(fetched);
        self.telemetry.record_discarded(discarded);
        if discarded > 0 {
            tracing::debug!(discarded, offset, "dropping updates older than the offset");
        }

        let Some(max_id) = max_id else {
            return;
        };
        let offset = self.offset.advance_to(max_id);
        let count = fresh.len();

        if self.queue.push_batch(fresh) {
            tracing::debug!(count, offset, "queued update batch");
        } else {
            tracing::warn!(count, offset, "update queue closed; dropping batch");
        }
    }
}

/// Keeps updates whose id is not below `offset`, in their original order,
/// and returns the highest surviving id.
pub(crate) fn retain_fresh(updates: Vec<Update>, offset: i64) -> (Vec<Update>, Option<i64>) {
    let fresh: Vec<Update> = updates
        .into_iter()
        .filter(|update| update.id() >= offset)
        .collect();
    let max_id = fresh.iter().map(Update::id).max();
    (fresh, max_id)
}

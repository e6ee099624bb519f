use crate::api::metrics::SourceMetrics;
use crate::dispatch::queue::QueueDepth;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing_subscriber::EnvFilter;

/// Interval suggested for the metrics reporter when enabling it.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(60);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Rolling counters shared by the poller and the dispatcher of one session.
///
/// Counters accumulate across restarts of the same session.
#[derive(Default, Debug)]
pub struct Telemetry {
    fetched_updates: AtomicU64,
    discarded_updates: AtomicU64,
    delivered_updates: AtomicU64,
    delivered_batches: AtomicU64,
    dropped_on_shutdown: AtomicU64,
    fetch_errors: AtomicU64,
    fetch_timeouts: AtomicU64,
    server_errors: AtomicU64,
    undecodable_responses: AtomicU64,
    callback_failures: AtomicU64,
}

impl Telemetry {
    pub fn record_fetched(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.fetched_updates
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_discarded(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.discarded_updates
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, count: usize) {
        self.delivered_updates
            .fetch_add(count as u64, Ordering::Relaxed);
        self.delivered_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_on_shutdown(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.dropped_on_shutdown
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_fetch_error(&self) {
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_timeout(&self) {
        self.fetch_timeouts.fetch_add(1, Ordering::Relaxed);
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_server_error(&self) {
        self.server_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_undecodable(&self) {
        self.undecodable_responses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_callback_failure(&self) {
        self.callback_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            fetched_updates: self.fetched_updates.load(Ordering::Relaxed),
            discarded_updates: self.discarded_updates.load(Ordering::Relaxed),
            delivered_updates: self.delivered_updates.load(Ordering::Relaxed),
            delivered_batches: self.delivered_batches.load(Ordering::Relaxed),
            dropped_on_shutdown: self.dropped_on_shutdown.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            fetch_timeouts: self.fetch_timeouts.load(Ordering::Relaxed),
            server_errors: self.server_errors.load(Ordering::Relaxed),
            undecodable_responses: self.undecodable_responses.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub fetched_updates: u64,
    pub discarded_updates: u64,
    pub delivered_updates: u64,
    pub delivered_batches: u64,
    pub dropped_on_shutdown: u64,
    /// Includes timeouts.
    pub fetch_errors: u64,
    pub fetch_timeouts: u64,
    pub server_errors: u64,
    pub undecodable_responses: u64,
    pub callback_failures: u64,
}

/// Spawns a background task that periodically logs throughput, queue depth, and fetch errors.
///
/// When the run polls through the default HTTP source its request counters are
/// logged as well. The task logs through the dispatcher that is current when
/// this is called.
pub(crate) fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    depth: QueueDepth,
    source_metrics: Option<Arc<SourceMetrics>>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    let report = async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "tgpoll::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current_snapshot = telemetry.snapshot();
                    let delivered_delta = current_snapshot
                        .delivered_updates
                        .saturating_sub(last_snapshot.delivered_updates);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        delivered_delta as f64 / elapsed
                    };

                    tracing::info!(
                        target: "tgpoll::metrics",
                        throughput = format!("{throughput:.2}"),
                        fetched = current_snapshot.fetched_updates,
                        delivered = current_snapshot.delivered_updates,
                        discarded = current_snapshot.discarded_updates,
                        queue_depth = depth.get(),
                        fetch_errors = current_snapshot.fetch_errors,
                        fetch_timeouts = current_snapshot.fetch_timeouts,
                        server_errors = current_snapshot.server_errors,
                        callback_failures = current_snapshot.callback_failures,
                        "session metrics snapshot"
                    );
                    if let Some(source) = source_metrics.as_ref().map(|metrics| metrics.snapshot()) {
                        tracing::info!(
                            target: "tgpoll::metrics",
                            requests = source.total_requests,
                            errors = source.total_errors,
                            timeouts = source.total_timeouts,
                            server_errors = source.total_server_errors,
                            error_rate = format!("{:.3}", source.error_rate),
                            avg_latency_ms = format!("{:.1}", source.average_latency_ms),
                            "http source snapshot"
                        );
                    }

                    last_snapshot = current_snapshot;
                    last_tick = Instant::now();
                }
            }
        }
    };

    tokio::spawn(report.with_current_subscriber())
}

/// In-memory log sink for asserting on formatted output in unit tests.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

#[cfg(test)]
impl CapturedLogs {
    pub(crate) fn dispatch(&self) -> tracing::Dispatch {
        let writer = self.clone();
        tracing::Dispatch::new(
            tracing_subscriber::fmt()
                .with_ansi(false)
                .with_max_level(tracing::Level::TRACE)
                .with_writer(move || writer.clone())
                .finish(),
        )
    }

    pub(crate) fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().expect("log buffer lock")).into_owned()
    }
}

#[cfg(test)]
impl std::io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .expect("log buffer lock")
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

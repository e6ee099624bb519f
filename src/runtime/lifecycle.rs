//! Spawns and tracks the worker tasks of one session run.

use crate::api::client::UpdateSource;
use crate::api::metrics::SourceMetrics;
use crate::dispatch::dispatcher::Dispatcher;
use crate::dispatch::queue::update_queue;
use crate::poller::backoff::ExponentialBackoff;
use crate::poller::fetch::{PollSettings, Poller, PollerParams};
use crate::poller::offset::OffsetTracker;
use crate::runtime::bot::LongPollingBot;
use crate::runtime::config::SessionConfig;
use crate::runtime::telemetry::{self, Telemetry};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Instrument};

pub(crate) struct SessionLoops {
    run_token: CancellationToken,
    logger: Dispatch,
    poller_handle: Option<JoinHandle<()>>,
    dispatcher_handle: Option<JoinHandle<()>>,
    metrics_handle: Option<JoinHandle<()>>,
}

pub(crate) struct LoopSpawnParams<'a> {
    pub shutdown_root: &'a CancellationToken,
    pub config: &'a SessionConfig,
    pub bot: Arc<dyn LongPollingBot>,
    pub source: Arc<dyn UpdateSource>,
    pub source_metrics: Option<Arc<SourceMetrics>>,
    pub offset: Arc<OffsetTracker>,
    pub telemetry: Arc<Telemetry>,
    pub logger: Dispatch,
}

impl SessionLoops {
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(params: LoopSpawnParams<'_>) -> Self {
        let LoopSpawnParams {
            shutdown_root,
            config,
            bot,
            source,
            source_metrics,
            offset,
            telemetry,
            logger,
        } = params;

        let run_token = shutdown_root.child_token();
        let (sender, receiver) = update_queue();
        let depth = sender.depth();
        let bot_name = bot.bot_username().to_owned();

        let poller = Poller::new(PollerParams {
            source,
            queue: sender,
            offset,
            backoff: ExponentialBackoff::new(config.backoff_policy()),
            settings: PollSettings::from_config(config),
            shutdown: run_token.clone(),
            telemetry: telemetry.clone(),
        });
        let dispatcher = Dispatcher::new(bot, receiver, run_token.clone(), telemetry.clone());

        tracing::dispatcher::with_default(&logger, || {
            let poller_span = tracing::info_span!("poller", bot = %bot_name);
            let dispatcher_span = tracing::info_span!("dispatcher", bot = %bot_name);

            let poller_handle =
                tokio::spawn(poller.run().instrument(poller_span).with_current_subscriber());
            let dispatcher_handle = tokio::spawn(
                dispatcher
                    .run()
                    .instrument(dispatcher_span)
                    .with_current_subscriber(),
            );
            let metrics_handle = config.metrics_interval().map(|interval| {
                telemetry::spawn_metrics_reporter(
                    telemetry,
                    depth,
                    source_metrics,
                    run_token.clone(),
                    interval,
                )
            });

            Self {
                run_token: run_token.clone(),
                logger: logger.clone(),
                poller_handle: Some(poller_handle),
                dispatcher_handle: Some(dispatcher_handle),
                metrics_handle,
            }
        })
    }

    pub(crate) fn cancel(&self) {
        self.run_token.cancel();
    }

    pub(crate) fn is_finished(&self) -> bool {
        [
            &self.poller_handle,
            &self.dispatcher_handle,
            &self.metrics_handle,
        ]
        .into_iter()
        .flatten()
        .all(JoinHandle::is_finished)
    }

    /// Waits for every task of this run to exit.
    pub(crate) async fn join(mut self) {
        let handles = [
            ("poller", self.poller_handle.take()),
            ("dispatcher", self.dispatcher_handle.take()),
            ("metrics reporter", self.metrics_handle.take()),
        ];

        for (task, handle) in handles {
            let Some(handle) = handle else {
                continue;
            };
            if let Err(err) = handle.await {
                tracing::dispatcher::with_default(&self.logger, || {
                    tracing::warn!(task, error = %err, "session task panicked");
                });
            }
        }
    }
}

use super::queue::UpdateReceiver;
use crate::api::payload::Update;
use crate::runtime::bot::LongPollingBot;
use crate::runtime::telemetry::Telemetry;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Drains the update queue and hands each drained batch to the bot.
pub(crate) struct Dispatcher {
    bot: Arc<dyn LongPollingBot>,
    queue: UpdateReceiver,
    shutdown: CancellationToken,
    telemetry: Arc<Telemetry>,
}

impl Dispatcher {
    pub(crate) fn new(
        bot: Arc<dyn LongPollingBot>,
        queue: UpdateReceiver,
        shutdown: CancellationToken,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            bot,
            queue,
            shutdown,
            telemetry,
        }
    }

    pub(crate) async fn run(mut self) {
        tracing::info!("dispatcher started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            let mut batch = self.queue.drain();
            if batch.is_empty() {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    received = self.queue.wait_for_updates() => match received {
                        Some(received) => batch = received,
                        None => {
                            tracing::debug!("update queue closed by the poller");
                            break;
                        }
                    },
                }
                if batch.is_empty() {
                    continue;
                }
            }

            self.deliver(batch).await;
        }

        let dropped = self.queue.close_and_discard();
        if dropped > 0 {
            self.telemetry.record_dropped_on_shutdown(dropped);
            tracing::info!(dropped, "discarding undelivered updates on shutdown");
        }
        tracing::info!("dispatcher stopped");
    }

    async fn deliver(&self, batch: Vec<Update>) {
        let count = batch.len();
        let first_id = batch.first().map(Update::id);
        let last_id = batch.last().map(Update::id);

        let outcome = AssertUnwindSafe(self.bot.on_updates_received(batch))
            .catch_unwind()
            .await;
        self.telemetry.record_delivered(count);

        match outcome {
            Ok(Ok(())) => {
                tracing::debug!(count, first_id, last_id, "delivered update batch");
            }
            Ok(Err(err)) => {
                self.telemetry.record_callback_failure();
                tracing::error!(
                    count,
                    first_id,
                    last_id,
                    update_id = err.update_id(),
                    error = %err,
                    "bot failed to handle update batch"
                );
            }
            Err(panic) => {
                self.telemetry.record_callback_failure();
                tracing::error!(
                    count,
                    first_id,
                    last_id,
                    panic = panic_message(panic.as_ref()),
                    "bot panicked while handling update batch"
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}

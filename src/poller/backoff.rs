use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Parameters for [`ExponentialBackoff`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            multiplier: 1.5,
            max: Duration::from_secs(60 * 60),
        }
    }
}

/// Stateful retry delay used by the poller after failed fetches.
///
/// `next_delay` hands out the current interval and then grows it by the
/// multiplier, clamped to the cap. `reset` returns to the initial interval.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    policy: BackoffPolicy,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            current: policy.initial.min(policy.max),
            policy,
        }
    }

    pub fn policy(&self) -> BackoffPolicy {
        self.policy
    }

    /// Interval the next call to [`Self::next_delay`] will return.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = next_backoff(delay, self.policy.multiplier, self.policy.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.policy.initial.min(self.policy.max);
    }
}

fn next_backoff(current: Duration, multiplier: f64, max: Duration) -> Duration {
    if current.is_zero() {
        return max.min(Duration::from_millis(1));
    }

    let next_secs = current.as_secs_f64() * multiplier;
    if !next_secs.is_finite() || next_secs >= max.as_secs_f64() {
        return max;
    }

    Duration::from_secs_f64(next_secs).max(current)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    Elapsed,
    Cancelled,
}

/// Sleeps for `delay` unless `token` fires first.
pub(crate) async fn sleep_with_cancellation(
    delay: Duration,
    token: &CancellationToken,
) -> WaitOutcome {
    if delay.is_zero() {
        yield_now().await;
        return if token.is_cancelled() {
            WaitOutcome::Cancelled
        } else {
            WaitOutcome::Elapsed
        };
    }

    tokio::select! {
        biased;
        _ = token.cancelled() => WaitOutcome::Cancelled,
        _ = sleep(delay) => WaitOutcome::Elapsed,
    }
}

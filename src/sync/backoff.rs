use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

pub(crate) const FAILURE_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
pub(crate) const FAILURE_BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Exponential delay applied after consecutive failed cycles.
#[derive(Debug, Clone)]
pub(crate) struct FailureBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    current: Option<Duration>,
}

impl Default for FailureBackoff {
    fn default() -> Self {
        Self::new(FAILURE_BACKOFF_INITIAL, FAILURE_BACKOFF_MAX)
    }
}

impl FailureBackoff {
    pub(crate) fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            max_delay: max_delay.max(initial_delay),
            current: None,
        }
    }

    /// Delay to wait after one more failure.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = match self.current {
            None => self.initial_delay,
            Some(current) => next_backoff(current, self.max_delay),
        };
        self.current = Some(delay);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.current = None;
    }
}

/// Sleeps for `delay` unless `token` fires first. Returns `false` when
/// cancelled.
pub(crate) async fn sleep_with_cancellation(delay: Duration, token: &CancellationToken) -> bool {
    if delay.is_zero() {
        yield_now().await;
        return !token.is_cancelled();
    }

    tokio::select! {
        _ = token.cancelled() => false,
        _ = sleep(delay) => true,
    }
}

fn next_backoff(current: Duration, max_backoff: Duration) -> Duration {
    if current.is_zero() {
        return max_backoff.min(Duration::from_millis(1));
    }

    let mut next = current.saturating_mul(2);
    if next > max_backoff {
        next = max_backoff;
    }
    next
}

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Rolling window the call limit applies to.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

/// Default calls per window for the source listing API.
pub const DEFAULT_SOURCE_RATE_LIMIT: usize = 15;

/// Default calls per window for the target storage API.
pub const DEFAULT_TARGET_RATE_LIMIT: usize = 12;

/// Caps outbound calls to at most `limit` per rolling window.
///
/// One instance is shared by every caller that talks to the same platform.
/// Pruning the window, counting entries, and recording a new call happen
/// under a single lock, so the cap holds no matter how many tasks call
/// [`RateLimiter::acquire`] at once. Callers that find the window full sleep
/// until its oldest entry expires instead of spinning.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(limit: usize) -> Self {
        Self::with_window(limit, DEFAULT_WINDOW)
    }

    pub fn with_window(limit: usize, window: Duration) -> Self {
        let limit = limit.max(1);
        let window = if window.is_zero() {
            Duration::from_millis(1)
        } else {
            window
        };

        Self {
            limit,
            window,
            calls: Mutex::new(VecDeque::with_capacity(limit)),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Waits until a call may be issued and records it. Never fails.
    pub async fn acquire(&self) {
        self.acquire_slot().await;
    }

    /// Number of calls recorded inside the current window.
    pub fn recent_calls(&self) -> usize {
        let mut calls = self.calls.lock().expect("rate limiter mutex poisoned");
        self.prune(&mut calls, Instant::now());
        calls.len()
    }

    async fn acquire_slot(&self) -> Instant {
        loop {
            let wait = {
                let mut calls = self.calls.lock().expect("rate limiter mutex poisoned");
                let now = Instant::now();
                self.prune(&mut calls, now);

                if calls.len() < self.limit {
                    calls.push_back(now);
                    return now;
                }

                match calls.front() {
                    Some(oldest) => (*oldest + self.window).saturating_duration_since(now),
                    None => Duration::ZERO,
                }
            };

            tracing::trace!(
                limit = self.limit,
                wait_ms = wait.as_millis() as u64,
                "rate limit window full; waiting"
            );
            sleep(wait).await;
        }
    }

    fn prune(&self, calls: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = calls.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                calls.pop_front();
            } else {
                break;
            }
        }
    }
}

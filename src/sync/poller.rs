use crate::api::rate_limiter::RateLimiter;
use crate::api::source::{EventSource, TriggerEvent};
use crate::store::cursor::PolicyCursor;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Result of fetching one listing page.
#[derive(Debug, Default)]
pub struct PolledPage {
    pub events: Vec<TriggerEvent>,
    /// More pages are available after this one.
    pub more: bool,
    /// The listing call failed; the page is empty and the policy counts as
    /// drained for this cycle.
    pub failed: bool,
}

/// Walks a policy's listing pages one at a time, advancing its cursor.
pub struct Poller {
    source: Arc<dyn EventSource>,
    limiter: Arc<RateLimiter>,
    debounce: Duration,
}

impl Poller {
    pub fn new(source: Arc<dyn EventSource>, limiter: Arc<RateLimiter>, debounce: Duration) -> Self {
        Self {
            source,
            limiter,
            debounce,
        }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    /// True when the policy was never drained or its last drain is at least
    /// one debounce interval old.
    pub fn is_due(&self, cursor: &PolicyCursor, now: DateTime<Utc>) -> bool {
        match cursor.last_drained_at {
            None => true,
            Some(drained) => match now.signed_duration_since(drained).to_std() {
                Ok(elapsed) => elapsed >= self.debounce,
                Err(_) => false,
            },
        }
    }

    /// Fetches the page at `cursor.offset`.
    ///
    /// `has_next` advances the offset; the last page stamps the drain time.
    /// A failed listing call is logged and treated as the last page.
    pub async fn next_page(&self, cursor: &mut PolicyCursor) -> PolledPage {
        self.limiter.acquire().await;

        match self.source.list_events(&cursor.policy_id, cursor.offset).await {
            Ok(page) => {
                if page.has_next {
                    cursor.advance();
                } else {
                    cursor.mark_drained(Utc::now());
                }
                PolledPage {
                    events: page.events,
                    more: page.has_next,
                    failed: false,
                }
            }
            Err(err) => {
                tracing::error!(
                    policy_id = %cursor.policy_id,
                    classification = %cursor.classification,
                    offset = cursor.offset,
                    error = %format!("{err:#}"),
                    "policy listing failed; ending pagination for this cycle"
                );
                cursor.mark_drained(Utc::now());
                PolledPage {
                    events: Vec::new(),
                    more: false,
                    failed: true,
                }
            }
        }
    }
}

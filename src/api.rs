//! HTTP plumbing for both vendor platforms: the shared call-rate limiter,
//! authentication headers, request metrics, and the listing (source) and
//! label-apply (target) clients consumed by the sync engine.

pub mod auth;
pub mod error;
pub(crate) mod http;
pub mod metrics;
pub mod options;
pub mod rate_limiter;
pub mod source;
pub mod target;

pub use error::ApiError;
pub use metrics::ApiMetricsSnapshot;
pub use options::ApiClientOptions;
pub use rate_limiter::RateLimiter;
pub use source::{EventPage, EventSource, SourceClient, TriggerEvent};
pub use target::{DelegatedHandle, FileInfo, LabelTarget, LabelWrite, OwnerAccount, TargetClient};

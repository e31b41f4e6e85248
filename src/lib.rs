pub mod api;
pub mod runtime;
pub mod store;
pub mod sync;


pub use api::{
    ApiClientOptions, ApiError, ApiMetricsSnapshot, DelegatedHandle, EventPage, EventSource,
    FileInfo, LabelTarget, LabelWrite, OwnerAccount, RateLimiter, SourceClient, TargetClient,
    TriggerEvent,
};
pub use runtime::config::{PolicyMapping, SyncConfig, SyncConfigBuilder, SyncConfigParams};
pub use runtime::runner::Runner;
pub use runtime::settings::Settings;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use store::{
    AssignmentAttempt, AttemptStore, CursorStore, Database, PolicyCursor, RetrySweep, StoreError,
};
pub use sync::{
    ApplyOutcome, ApplyTask, ConcurrentExecutor, CredentialCache, CycleReport, PolledPage,
    Poller, SyncEngine,
};

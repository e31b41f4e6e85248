//! Synchronization engine: credential resolution, listing pagination,
//! bounded label-apply fan-out, and the outer loop that ties them to storage.

pub(crate) mod backoff;
pub mod credentials;
pub mod engine;
pub mod executor;
pub mod poller;

pub use credentials::CredentialCache;
pub use engine::{CycleReport, SyncEngine};
pub use executor::{ApplyOutcome, ApplyTask, ConcurrentExecutor};
pub use poller::{PolledPage, Poller};

//! Bounded fan-out of label-apply calls for one batch of records.

use crate::api::error::ApiError;
use crate::api::rate_limiter::RateLimiter;
use crate::api::target::{DelegatedHandle, LabelTarget, LabelWrite};
use crate::store::record::AssignmentAttempt;
use futures::FutureExt;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// A record paired with the handle its apply call runs under.
#[derive(Debug, Clone)]
pub struct ApplyTask {
    pub handle: DelegatedHandle,
    pub record: AssignmentAttempt,
}

/// What a worker observed for one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied {
        write: LabelWrite,
        file_name: Option<String>,
    },
    Forbidden(String),
    Failed(String),
}

impl ApplyOutcome {
    fn from_error(err: anyhow::Error) -> Self {
        if ApiError::is_forbidden(&err) {
            ApplyOutcome::Forbidden(format!("{err:#}"))
        } else {
            ApplyOutcome::Failed(format!("{err:#}"))
        }
    }

    /// Folds the outcome into `record`.
    pub fn apply_to(self, record: &mut AssignmentAttempt) {
        match self {
            ApplyOutcome::Applied { file_name, .. } => {
                if file_name.is_some() {
                    record.file_name = file_name;
                }
                record.mark_applied();
            }
            ApplyOutcome::Forbidden(_) => record.mark_forbidden(),
            ApplyOutcome::Failed(message) => record.record_failure(message),
        }
    }
}

/// Runs apply tasks with at most `worker_count` in flight.
///
/// Workers only talk to the target platform; every record mutation happens
/// on the calling task once the whole batch has finished.
pub struct ConcurrentExecutor {
    target: Arc<dyn LabelTarget>,
    limiter: Arc<RateLimiter>,
    permits: Arc<Semaphore>,
    worker_count: usize,
}

impl ConcurrentExecutor {
    pub fn new(target: Arc<dyn LabelTarget>, limiter: Arc<RateLimiter>, worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        Self {
            target,
            limiter,
            permits: Arc::new(Semaphore::new(worker_count)),
            worker_count,
        }
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Applies every task and returns the updated records in submission
    /// order once all of them have finished.
    pub async fn dispatch(&self, tasks: Vec<ApplyTask>) -> Vec<AssignmentAttempt> {
        if tasks.is_empty() {
            return Vec::new();
        }

        let mut records = Vec::with_capacity(tasks.len());
        let mut handles = Vec::with_capacity(tasks.len());

        for ApplyTask { handle, record } in tasks {
            let permit = match self.permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    records.push(record);
                    handles.push(None);
                    continue;
                }
            };

            let target = self.target.clone();
            let limiter = self.limiter.clone();
            let file_id = record.file_id.clone();
            let label = record.classification.clone();
            records.push(record);

            handles.push(Some(tokio::spawn(async move {
                let result = std::panic::AssertUnwindSafe(apply_one(
                    target.as_ref(),
                    limiter.as_ref(),
                    &handle,
                    &file_id,
                    &label,
                ))
                .catch_unwind()
                .await;
                drop(permit);

                match result {
                    Ok(outcome) => outcome,
                    Err(panic_payload) => {
                        let panic_msg = panic_message(panic_payload.as_ref());
                        tracing::error!(file_id = %file_id, panic = %panic_msg, "apply task panicked");
                        ApplyOutcome::Failed(format!("apply task panicked: {panic_msg}"))
                    }
                }
            })));
        }

        for (record, handle) in records.iter_mut().zip(handles) {
            let outcome = match handle {
                Some(handle) => match handle.await {
                    Ok(outcome) => outcome,
                    Err(err) => ApplyOutcome::Failed(format!("apply task aborted: {err}")),
                },
                None => ApplyOutcome::Failed("apply worker pool is closed".to_owned()),
            };
            log_outcome(record, &outcome);
            outcome.apply_to(record);
        }

        records
    }
}

async fn apply_one(
    target: &dyn LabelTarget,
    limiter: &RateLimiter,
    handle: &DelegatedHandle,
    file_id: &str,
    label: &str,
) -> ApplyOutcome {
    limiter.acquire().await;
    let file = match target.fetch_file(handle, file_id).await {
        Ok(file) => file,
        Err(err) => return ApplyOutcome::from_error(err),
    };

    limiter.acquire().await;
    match target.apply_label(handle, file_id, label).await {
        Ok(write) => ApplyOutcome::Applied {
            write,
            file_name: file.name,
        },
        Err(err) => ApplyOutcome::from_error(err),
    }
}

fn log_outcome(record: &AssignmentAttempt, outcome: &ApplyOutcome) {
    match outcome {
        ApplyOutcome::Applied { write, file_name } => tracing::info!(
            file_id = %record.file_id,
            file_name = file_name.as_deref().unwrap_or(""),
            owner = %record.file_owner,
            label = %record.classification,
            write = ?write,
            "applied classification"
        ),
        ApplyOutcome::Forbidden(message) => tracing::warn!(
            file_id = %record.file_id,
            owner = %record.file_owner,
            label = %record.classification,
            error = %message,
            "classification forbidden for file owner"
        ),
        ApplyOutcome::Failed(message) => tracing::warn!(
            file_id = %record.file_id,
            owner = %record.file_owner,
            label = %record.classification,
            attempts = record.attempts,
            error = %message,
            "classification apply failed; will retry"
        ),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

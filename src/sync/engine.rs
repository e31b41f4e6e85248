//! The outer sync loop: poll every due policy to exhaustion, apply labels for
//! each page, persist the batch and then the cursor, and finally sweep
//! failed attempts for another try.

use crate::api::rate_limiter::RateLimiter;
use crate::api::source::{EventSource, SourceClient};
use crate::api::target::{LabelTarget, TargetClient};
use crate::runtime::config::{PolicyMapping, SyncConfig};
use crate::runtime::telemetry::Telemetry;
use crate::store::attempts::AttemptStore;
use crate::store::cursor::{CursorStore, PolicyCursor};
use crate::store::record::AssignmentAttempt;
use crate::store::Database;
use crate::sync::backoff::{sleep_with_cancellation, FailureBackoff};
use crate::sync::credentials::CredentialCache;
use crate::sync::executor::{ApplyTask, ConcurrentExecutor};
use crate::sync::poller::Poller;
use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Counters for one outer cycle.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub pages: usize,
    pub listing_failures: usize,
    pub events: usize,
    pub policies_not_due: usize,
    pub applied: usize,
    pub forbidden: usize,
    pub no_identity: usize,
    pub failed: usize,
    /// Size of every retry chunk processed, in sweep order.
    pub retry_chunks: Vec<usize>,
    /// The cycle stopped early because shutdown was requested.
    pub interrupted: bool,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.events == 0 && self.retry_chunks.is_empty() && self.listing_failures == 0
    }

    fn tally(&mut self, records: &[AssignmentAttempt], telemetry: &Telemetry) {
        let mut applied = 0;
        let mut forbidden = 0;
        let mut no_identity = 0;
        let mut failed = 0;
        for record in records {
            if record.applied {
                applied += 1;
            } else if record.is_forbidden() {
                forbidden += 1;
            } else if record.is_no_identity() {
                no_identity += 1;
            } else {
                failed += 1;
            }
        }

        self.applied += applied;
        self.forbidden += forbidden;
        self.no_identity += no_identity;
        self.failed += failed;
        telemetry.record_applied(applied as u64);
        telemetry.record_forbidden(forbidden as u64);
        telemetry.record_no_identity(no_identity as u64);
        telemetry.record_apply_failures(failed as u64);
    }
}

pub struct SyncEngine {
    config: SyncConfig,
    database: Database,
    attempts: AttemptStore,
    cursors: CursorStore,
    credentials: CredentialCache,
    poller: Poller,
    executor: ConcurrentExecutor,
    telemetry: Arc<Telemetry>,
    last_exhausted: AtomicU64,
}

impl SyncEngine {
    /// Opens the database and builds HTTP clients for both platforms.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let database = Database::connect(config.database_url())
            .await
            .with_context(|| format!("failed to open sync database {}", config.database_url()))?;
        let source = Arc::new(SourceClient::from_config(&config)?);
        let target = Arc::new(TargetClient::from_config(&config)?);
        let source_metrics = source.metrics_handle();
        let target_metrics = target.metrics_handle();

        let engine = Self::new(config, source, target, database);
        engine.telemetry.register_api_client("source", source_metrics);
        engine.telemetry.register_api_client("target", target_metrics);
        Ok(engine)
    }

    /// Wires the engine around already-built collaborators.
    pub fn new(
        config: SyncConfig,
        source: Arc<dyn EventSource>,
        target: Arc<dyn LabelTarget>,
        database: Database,
    ) -> Self {
        let source_limiter = Arc::new(RateLimiter::new(config.source_rate_limit()));
        let target_limiter = Arc::new(RateLimiter::new(config.target_rate_limit()));

        Self {
            attempts: database.attempts(config.max_attempts()),
            cursors: database.cursors(),
            credentials: CredentialCache::new(target.clone(), target_limiter.clone()),
            poller: Poller::new(source, source_limiter, config.debounce()),
            executor: ConcurrentExecutor::new(target, target_limiter, config.worker_count()),
            telemetry: Arc::new(Telemetry::default()),
            last_exhausted: AtomicU64::new(0),
            database,
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn attempts(&self) -> &AttemptStore {
        &self.attempts
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    pub fn credentials(&self) -> &CredentialCache {
        &self.credentials
    }

    pub fn telemetry(&self) -> Arc<Telemetry> {
        self.telemetry.clone()
    }

    /// Runs cycles until `shutdown` is cancelled.
    ///
    /// A failed cycle is logged and followed by an exponential backoff; work
    /// that was not committed is picked up again by the next cycle.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut backoff = FailureBackoff::default();
        tracing::info!(
            mappings = self.config.mappings().len(),
            workers = self.executor.worker_count(),
            "sync loop started"
        );

        while !shutdown.is_cancelled() {
            let delay = match self.run_cycle(&shutdown).await {
                Ok(report) => {
                    backoff.reset();
                    if report.is_idle() {
                        tracing::debug!(?report, "sync cycle finished");
                    } else {
                        tracing::info!(
                            pages = report.pages,
                            events = report.events,
                            applied = report.applied,
                            forbidden = report.forbidden,
                            no_identity = report.no_identity,
                            failed = report.failed,
                            retry_chunks = report.retry_chunks.len(),
                            "sync cycle finished"
                        );
                    }
                    self.config.cycle_interval()
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    tracing::error!(
                        error = %format!("{err:#}"),
                        retry_in_ms = delay.as_millis() as u64,
                        "sync cycle aborted"
                    );
                    delay
                }
            };

            if !sleep_with_cancellation(delay, &shutdown).await {
                break;
            }
        }

        tracing::info!("sync loop stopped");
        Ok(())
    }

    /// One pass over every mapping followed by a retry sweep.
    pub async fn run_cycle(&self, shutdown: &CancellationToken) -> Result<CycleReport> {
        let mut report = CycleReport::default();

        for mapping in self.config.mappings() {
            self.sync_mapping(mapping, shutdown, &mut report)
                .await
                .with_context(|| {
                    format!(
                        "sync failed for policy {} ({})",
                        mapping.policy_id, mapping.classification
                    )
                })?;
            if report.interrupted {
                return Ok(report);
            }
        }

        self.sweep_retries(shutdown, &mut report)
            .await
            .context("retry sweep failed")?;

        self.telemetry.record_cycle();
        Ok(report)
    }

    async fn sync_mapping(
        &self,
        mapping: &PolicyMapping,
        shutdown: &CancellationToken,
        report: &mut CycleReport,
    ) -> Result<()> {
        let mut cursor = self.cursors.load_or_seed(mapping).await?;
        if !self.poller.is_due(&cursor, Utc::now()) {
            report.policies_not_due += 1;
            tracing::debug!(
                policy_id = %mapping.policy_id,
                classification = %mapping.classification,
                "debounce window has not elapsed; skipping policy"
            );
            return Ok(());
        }

        loop {
            if shutdown.is_cancelled() {
                report.interrupted = true;
                return Ok(());
            }

            let page = self.poller.next_page(&mut cursor).await;
            report.pages += 1;
            report.events += page.events.len();
            self.telemetry.record_page(page.events.len() as u64);
            if page.failed {
                report.listing_failures += 1;
                self.telemetry.record_listing_failure();
            }

            let records = page
                .events
                .iter()
                .map(|event| {
                    tracing::debug!(
                        event_id = %event.event_id,
                        file_id = %event.file_id,
                        owner = %event.owner,
                        policy_id = %mapping.policy_id,
                        "processing policy trigger"
                    );
                    self.attempts.create_pending(
                        &event.file_id,
                        &event.owner,
                        &mapping.classification,
                        &mapping.policy_id,
                    )
                })
                .collect();

            self.process_batch(records, report).await?;
            self.save_cursor(&cursor).await?;

            if !page.more {
                tracing::debug!(
                    policy_id = %mapping.policy_id,
                    offset = cursor.offset,
                    "policy drained"
                );
                return Ok(());
            }
        }
    }

    async fn sweep_retries(
        &self,
        shutdown: &CancellationToken,
        report: &mut CycleReport,
    ) -> Result<()> {
        let mut sweep = self.attempts.retry_eligible(self.config.retry_chunk_size());

        loop {
            if shutdown.is_cancelled() {
                report.interrupted = true;
                return Ok(());
            }

            let Some(mut chunk) = sweep.next_chunk().await? else {
                break;
            };

            report.retry_chunks.push(chunk.len());
            self.telemetry.record_retry_chunk();
            tracing::debug!(records = chunk.len(), "retrying failed assignments");

            for record in chunk.iter_mut() {
                record.begin_retry();
            }
            self.process_batch(chunk, report).await?;
        }

        let exhausted = self.attempts.count_exhausted().await?;
        let previous = self.last_exhausted.swap(exhausted, Ordering::Relaxed);
        if exhausted != previous && exhausted > 0 {
            tracing::warn!(
                exhausted,
                max_attempts = self.attempts.max_attempts(),
                "assignments ran out of retry attempts without being applied"
            );
        }
        Ok(())
    }

    /// Resolves owners, dispatches apply calls and persists the whole batch.
    async fn process_batch(
        &self,
        records: Vec<AssignmentAttempt>,
        report: &mut CycleReport,
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut settled = Vec::new();
        let mut tasks = Vec::new();
        for mut record in records {
            match self.credentials.resolve(&record.file_owner).await {
                Ok(Some(handle)) => tasks.push(ApplyTask { handle, record }),
                Ok(None) => {
                    tracing::info!(
                        file_id = %record.file_id,
                        owner = %record.file_owner,
                        "file owner has no target account"
                    );
                    record.mark_no_identity();
                    settled.push(record);
                }
                Err(err) => {
                    tracing::warn!(
                        file_id = %record.file_id,
                        owner = %record.file_owner,
                        error = %format!("{err:#}"),
                        "owner lookup failed; will retry"
                    );
                    record.record_failure(format!("{err:#}"));
                    settled.push(record);
                }
            }
        }

        settled.extend(self.executor.dispatch(tasks).await);
        report.tally(&settled, &self.telemetry);

        if let Err(err) = self.attempts.bulk_persist(&mut settled).await {
            self.telemetry.record_persist_failure();
            return Err(err).context("failed to persist assignment batch");
        }
        self.telemetry.record_persisted(settled.len() as u64);
        Ok(())
    }

    async fn save_cursor(&self, cursor: &PolicyCursor) -> Result<()> {
        if let Err(err) = self.cursors.save(cursor).await {
            self.telemetry.record_persist_failure();
            return Err(err).context("failed to persist policy cursor");
        }
        Ok(())
    }
}

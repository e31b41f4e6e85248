use std::sync::atomic::{AtomicU64, Ordering};
use crate::api::metrics::{ApiMetrics, ApiMetricsSnapshot};
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(30);

/// Filter applied when neither `RUST_LOG` nor the settings file name one.
pub const DEFAULT_LOG_DIRECTIVE: &str = "info";

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to
/// `fallback` (for example `"info"` or `"labelsync=debug"`).
/// Calling this function multiple times is harmless.
pub fn init_tracing(fallback: &str) {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVE));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Rolling counters for the sync loop.
#[derive(Default, Debug)]
pub struct Telemetry {
    pages_polled: AtomicU64,
    listing_failures: AtomicU64,
    events_seen: AtomicU64,
    applied: AtomicU64,
    forbidden: AtomicU64,
    no_identity: AtomicU64,
    apply_failures: AtomicU64,
    records_persisted: AtomicU64,
    persist_failures: AtomicU64,
    retry_chunks: AtomicU64,
    cycles: AtomicU64,
    api_clients: RwLock<Vec<(&'static str, Arc<ApiMetrics>)>>,
}

impl Telemetry {
    /// Includes `metrics` of the named HTTP client in [`Telemetry::api_snapshots`].
    pub(crate) fn register_api_client(&self, client: &'static str, metrics: Arc<ApiMetrics>) {
        self.api_clients
            .write()
            .expect("telemetry lock poisoned")
            .push((client, metrics));
    }

    /// Request counters of every registered HTTP client, in registration order.
    pub fn api_snapshots(&self) -> Vec<(&'static str, ApiMetricsSnapshot)> {
        self.api_clients
            .read()
            .expect("telemetry lock poisoned")
            .iter()
            .map(|(client, metrics)| (*client, metrics.snapshot()))
            .collect()
    }

    pub fn record_page(&self, events: u64) {
        self.pages_polled.fetch_add(1, Ordering::Relaxed);
        self.events_seen.fetch_add(events, Ordering::Relaxed);
    }

    pub fn record_listing_failure(&self) {
        self.listing_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_applied(&self, count: u64) {
        self.applied.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_forbidden(&self, count: u64) {
        self.forbidden.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_no_identity(&self, count: u64) {
        self.no_identity.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_apply_failures(&self, count: u64) {
        self.apply_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_persisted(&self, count: u64) {
        if count == 0 {
            return;
        }
        self.records_persisted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_persist_failure(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry_chunk(&self) {
        self.retry_chunks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cycle(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            pages_polled: self.pages_polled.load(Ordering::Relaxed),
            listing_failures: self.listing_failures.load(Ordering::Relaxed),
            events_seen: self.events_seen.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            forbidden: self.forbidden.load(Ordering::Relaxed),
            no_identity: self.no_identity.load(Ordering::Relaxed),
            apply_failures: self.apply_failures.load(Ordering::Relaxed),
            records_persisted: self.records_persisted.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
            retry_chunks: self.retry_chunks.load(Ordering::Relaxed),
            cycles: self.cycles.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub pages_polled: u64,
    pub listing_failures: u64,
    pub events_seen: u64,
    pub applied: u64,
    pub forbidden: u64,
    pub no_identity: u64,
    pub apply_failures: u64,
    pub records_persisted: u64,
    pub persist_failures: u64,
    pub retry_chunks: u64,
    pub cycles: u64,
}

impl TelemetrySnapshot {
    /// Counter growth since `earlier`.
    pub fn delta(&self, earlier: &TelemetrySnapshot) -> TelemetrySnapshot {
        TelemetrySnapshot {
            pages_polled: self.pages_polled.saturating_sub(earlier.pages_polled),
            listing_failures: self.listing_failures.saturating_sub(earlier.listing_failures),
            events_seen: self.events_seen.saturating_sub(earlier.events_seen),
            applied: self.applied.saturating_sub(earlier.applied),
            forbidden: self.forbidden.saturating_sub(earlier.forbidden),
            no_identity: self.no_identity.saturating_sub(earlier.no_identity),
            apply_failures: self.apply_failures.saturating_sub(earlier.apply_failures),
            records_persisted: self
                .records_persisted
                .saturating_sub(earlier.records_persisted),
            persist_failures: self.persist_failures.saturating_sub(earlier.persist_failures),
            retry_chunks: self.retry_chunks.saturating_sub(earlier.retry_chunks),
            cycles: self.cycles.saturating_sub(earlier.cycles),
        }
    }
}

/// Spawns a background task that periodically logs apply throughput and the
/// counter deltas since the previous report.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "labelsync::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current_snapshot = telemetry.snapshot();
                    let delta = current_snapshot.delta(&last_snapshot);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        delta.applied as f64 / elapsed
                    };

                    tracing::info!(
                        target: "labelsync::metrics",
                        throughput = format!("{throughput:.2}"),
                        pages = delta.pages_polled,
                        events = delta.events_seen,
                        applied = delta.applied,
                        forbidden = delta.forbidden,
                        no_identity = delta.no_identity,
                        apply_failures = delta.apply_failures,
                        persisted = delta.records_persisted,
                        listing_failures = delta.listing_failures,
                        persist_failures = delta.persist_failures,
                        retry_chunks = delta.retry_chunks,
                        cycles = current_snapshot.cycles,
                        "runtime metrics snapshot"
                    );
                    for (client, api) in telemetry.api_snapshots() {
                        tracing::info!(
                            target: "labelsync::metrics",
                            client,
                            requests = api.total_requests,
                            errors = api.total_errors,
                            timeouts = api.total_timeouts,
                            avg_latency_ms = format!("{:.2}", api.average_latency_ms),
                            error_rate = format!("{:.3}", api.error_rate),
                            "api client metrics"
                        );
                    }

                    last_snapshot = current_snapshot;
                    last_tick = Instant::now();
                }
            }
        }
    })
}

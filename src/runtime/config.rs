use crate::api::rate_limiter::{DEFAULT_SOURCE_RATE_LIMIT, DEFAULT_TARGET_RATE_LIMIT};
use crate::runtime::telemetry;
use crate::store::attempts::{DEFAULT_MAX_ATTEMPTS, MAX_RETRY_CHUNK};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::time::Duration;

const DEFAULT_WORKER_COUNT: usize = 100;
const DEFAULT_DEBOUNCE_SECS: u64 = 60;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_CYCLE_INTERVAL_SECS: u64 = 1;

/// Links one source DLP policy to the classification label applied for it.
///
/// `initial_offset` and `initial_drained_at` only seed the durable cursor the
/// first time the mapping is seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyMapping {
    pub policy_id: String,
    pub classification: String,
    pub initial_offset: u64,
    pub initial_drained_at: Option<DateTime<Utc>>,
}

impl PolicyMapping {
    pub fn new(policy_id: impl Into<String>, classification: impl Into<String>) -> Self {
        Self {
            policy_id: policy_id.into().trim().to_owned(),
            classification: classification.into().trim().to_owned(),
            initial_offset: 0,
            initial_drained_at: None,
        }
    }
}

/// Runtime configuration for the sync engine.
///
/// All instances must be constructed via [`SyncConfig::builder`] or [`SyncConfig::new`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    source_url: String,
    source_token: String,
    target_url: String,
    target_token: String,
    database_url: String,
    mappings: Vec<PolicyMapping>,
    source_rate_limit: usize,
    target_rate_limit: usize,
    worker_count: usize,
    debounce: Duration,
    retry_chunk_size: usize,
    max_attempts: u32,
    request_timeout: Duration,
    cycle_interval: Duration,
    metrics_interval: Duration,
}

pub struct SyncConfigParams {
    pub source_url: String,
    pub source_token: String,
    pub target_url: String,
    pub target_token: String,
    pub database_url: String,
    pub mappings: Vec<PolicyMapping>,
    pub source_rate_limit: usize,
    pub target_rate_limit: usize,
    pub worker_count: usize,
    pub debounce: Duration,
    pub retry_chunk_size: usize,
    pub max_attempts: u32,
    pub request_timeout: Duration,
    pub cycle_interval: Duration,
    pub metrics_interval: Duration,
}

impl SyncConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    ///
    /// Prefer [`SyncConfig::builder`] when most values use defaults.
    pub fn new(params: SyncConfigParams) -> Result<Self> {
        let SyncConfigParams {
            source_url,
            source_token,
            target_url,
            target_token,
            database_url,
            mappings,
            source_rate_limit,
            target_rate_limit,
            worker_count,
            debounce,
            retry_chunk_size,
            max_attempts,
            request_timeout,
            cycle_interval,
            metrics_interval,
        } = params;

        let config = Self {
            source_url: trimmed_url(source_url),
            source_token: trimmed_string(source_token),
            target_url: trimmed_url(target_url),
            target_token: trimmed_string(target_token),
            database_url: trimmed_string(database_url),
            mappings: mappings
                .into_iter()
                .map(|mapping| PolicyMapping {
                    policy_id: trimmed_string(mapping.policy_id),
                    classification: trimmed_string(mapping.classification),
                    ..mapping
                })
                .collect(),
            source_rate_limit,
            target_rate_limit,
            worker_count,
            debounce,
            retry_chunk_size,
            max_attempts,
            request_timeout,
            cycle_interval,
            metrics_interval,
        };

        config.validate()?;
        Ok(config)
    }

    /// Base URL of the source listing API.
    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn source_token(&self) -> &str {
        &self.source_token
    }

    /// Base URL of the target storage API.
    pub fn target_url(&self) -> &str {
        &self.target_url
    }

    pub fn target_token(&self) -> &str {
        &self.target_token
    }

    /// SQLite URL holding attempts and cursors.
    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn mappings(&self) -> &[PolicyMapping] {
        &self.mappings
    }

    /// Source API calls allowed per second.
    pub fn source_rate_limit(&self) -> usize {
        self.source_rate_limit
    }

    /// Target API calls allowed per second.
    pub fn target_rate_limit(&self) -> usize {
        self.target_rate_limit
    }

    /// Maximum label-apply tasks in flight.
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Minimum time between draining a policy and polling it again.
    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    pub fn retry_chunk_size(&self) -> usize {
        self.retry_chunk_size
    }

    /// Attempt count at which a failing record stops being retried.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Pause between two sync cycles.
    pub fn cycle_interval(&self) -> Duration {
        self.cycle_interval
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        validate_url(&self.source_url, "source_url")?;
        validate_url(&self.target_url, "target_url")?;
        ensure_not_empty(&self.source_token, "source_token")?;
        ensure_not_empty(&self.target_token, "target_token")?;
        ensure_not_empty(&self.database_url, "database_url")?;
        if !self.database_url.starts_with("sqlite:") {
            bail!("database_url must start with sqlite:");
        }

        if self.mappings.is_empty() {
            bail!("at least one policy mapping is required");
        }
        let mut seen = HashSet::new();
        for mapping in &self.mappings {
            ensure_not_empty(&mapping.policy_id, "mapping policy_id")?;
            ensure_not_empty(&mapping.classification, "mapping classification")?;
            if !seen.insert((mapping.policy_id.as_str(), mapping.classification.as_str())) {
                bail!(
                    "duplicate mapping for policy {} and classification {}",
                    mapping.policy_id,
                    mapping.classification
                );
            }
        }

        if self.source_rate_limit == 0 {
            bail!("source_rate_limit must be greater than 0");
        }

        if self.target_rate_limit == 0 {
            bail!("target_rate_limit must be greater than 0");
        }

        if self.worker_count == 0 {
            bail!("worker_count must be greater than 0");
        }

        if self.debounce.is_zero() {
            bail!("debounce must be greater than 0");
        }

        if self.retry_chunk_size == 0 || self.retry_chunk_size > MAX_RETRY_CHUNK {
            bail!("retry_chunk_size must be between 1 and {MAX_RETRY_CHUNK}");
        }

        if self.max_attempts == 0 {
            bail!("max_attempts must be greater than 0");
        }

        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }

        if self.cycle_interval.is_zero() {
            bail!("cycle_interval must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct SyncConfigBuilder {
    source_url: Option<String>,
    source_token: Option<String>,
    target_url: Option<String>,
    target_token: Option<String>,
    database_url: Option<String>,
    mappings: Vec<PolicyMapping>,
    source_rate_limit: Option<usize>,
    target_rate_limit: Option<usize>,
    worker_count: Option<usize>,
    debounce: Option<Duration>,
    retry_chunk_size: Option<usize>,
    max_attempts: Option<u32>,
    request_timeout: Option<Duration>,
    cycle_interval: Option<Duration>,
    metrics_interval: Option<Duration>,
}

impl SyncConfigBuilder {
    pub fn source_url(mut self, url: impl Into<String>) -> Self {
        self.source_url = Some(url.into());
        self
    }

    pub fn source_token(mut self, token: impl Into<String>) -> Self {
        self.source_token = Some(token.into());
        self
    }

    pub fn target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = Some(url.into());
        self
    }

    pub fn target_token(mut self, token: impl Into<String>) -> Self {
        self.target_token = Some(token.into());
        self
    }

    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn mapping(mut self, mapping: PolicyMapping) -> Self {
        self.mappings.push(mapping);
        self
    }

    pub fn mappings(mut self, mappings: impl IntoIterator<Item = PolicyMapping>) -> Self {
        self.mappings.extend(mappings);
        self
    }

    pub fn source_rate_limit(mut self, per_second: usize) -> Self {
        self.source_rate_limit = Some(per_second);
        self
    }

    pub fn target_rate_limit(mut self, per_second: usize) -> Self {
        self.target_rate_limit = Some(per_second);
        self
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = Some(debounce);
        self
    }

    pub fn retry_chunk_size(mut self, size: usize) -> Self {
        self.retry_chunk_size = Some(size);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn cycle_interval(mut self, interval: Duration) -> Self {
        self.cycle_interval = Some(interval);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<SyncConfig> {
        let params = SyncConfigParams {
            source_url: self.source_url.context("source_url is required")?,
            source_token: self.source_token.context("source_token is required")?,
            target_url: self.target_url.context("target_url is required")?,
            target_token: self.target_token.context("target_token is required")?,
            database_url: self.database_url.context("database_url is required")?,
            mappings: self.mappings,
            source_rate_limit: self.source_rate_limit.unwrap_or(DEFAULT_SOURCE_RATE_LIMIT),
            target_rate_limit: self.target_rate_limit.unwrap_or(DEFAULT_TARGET_RATE_LIMIT),
            worker_count: self.worker_count.unwrap_or(DEFAULT_WORKER_COUNT),
            debounce: self
                .debounce
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_DEBOUNCE_SECS)),
            retry_chunk_size: self.retry_chunk_size.unwrap_or(MAX_RETRY_CHUNK),
            max_attempts: self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            request_timeout: self
                .request_timeout
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS)),
            cycle_interval: self
                .cycle_interval
                .unwrap_or_else(|| Duration::from_secs(DEFAULT_CYCLE_INTERVAL_SECS)),
            metrics_interval: self
                .metrics_interval
                .unwrap_or(telemetry::DEFAULT_METRICS_INTERVAL),
        };

        SyncConfig::new(params)
    }
}

fn trimmed_string(value: String) -> String {
    value.trim().to_owned()
}

fn trimmed_url(value: String) -> String {
    value.trim().trim_end_matches('/').to_owned()
}

fn ensure_not_empty(value: &str, field: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{field} cannot be empty");
    }
    Ok(())
}

fn validate_url(url: &str, field: &str) -> Result<()> {
    let url = url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("{field} must start with http:// or https://");
    }
    Ok(())
}

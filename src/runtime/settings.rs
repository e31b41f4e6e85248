//! Environment settings files (`<config_dir>/<env>.yml`) and their
//! conversion into a validated [`SyncConfig`].
//!
//! ```yaml
//! mcas:
//!   subdomain: contoso
//!   api_token: "..."
//! box:
//!   access_token: "..."
//!   mcas_classifications:
//!     - box_name: Confidential
//!       mcas_id: 5f1e...
//!       paginate: 0
//!       processed_all_at: 2024-01-01T00:00:00Z
//! sql:
//!   url: sqlite://data/labelsync.db
//! sync:
//!   worker_count: 50
//! log:
//!   level: info
//! ```

use crate::runtime::config::{PolicyMapping, SyncConfig, SyncConfigBuilder};
use crate::runtime::telemetry::DEFAULT_LOG_DIRECTIVE;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_TARGET_URL: &str = "https://api.box.com/2.0";
const SOURCE_PORTAL_DOMAIN: &str = "portal.cloudappsecurity.com";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub mcas: SourceSettings,
    #[serde(rename = "box")]
    pub target: TargetSettings,
    pub sql: SqlSettings,
    #[serde(default)]
    pub sync: TuningSettings,
    #[serde(default)]
    pub log: LogSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceSettings {
    #[serde(default)]
    pub subdomain: Option<String>,
    /// Full base URL; takes precedence over `subdomain`.
    #[serde(default)]
    pub url: Option<String>,
    pub api_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetSettings {
    #[serde(default)]
    pub api_url: Option<String>,
    pub access_token: String,
    pub mcas_classifications: Vec<ClassificationSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClassificationSettings {
    pub box_name: String,
    #[serde(deserialize_with = "de_policy_id")]
    pub mcas_id: String,
    #[serde(default)]
    pub paginate: u64,
    #[serde(default, deserialize_with = "de_optional_timestamp")]
    pub processed_all_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SqlSettings {
    #[serde(default)]
    pub url: Option<String>,
    /// Path of a SQLite file, used when `url` is absent.
    #[serde(default)]
    pub database: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TuningSettings {
    pub source_rate_limit: Option<usize>,
    pub target_rate_limit: Option<usize>,
    pub worker_count: Option<usize>,
    pub debounce_secs: Option<u64>,
    pub retry_chunk_size: Option<usize>,
    pub max_attempts: Option<u32>,
    pub request_timeout_secs: Option<u64>,
    pub cycle_interval_ms: Option<u64>,
    pub metrics_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    DEFAULT_LOG_DIRECTIVE.to_owned()
}

impl Settings {
    /// Path of the settings file for environment `env` inside `config_dir`.
    pub fn path_for(config_dir: &Path, env: &str) -> PathBuf {
        config_dir.join(format!("{env}.yml"))
    }

    pub fn load(config_dir: &Path, env: &str) -> Result<Self> {
        if env.trim().is_empty() || env.contains(['/', '\\']) {
            bail!("invalid environment alias {env:?}");
        }
        let path = Self::path_for(config_dir, env);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read settings file {}", path.display()))?;
        Self::from_yaml(&content)
            .with_context(|| format!("failed to parse settings file {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("invalid YAML settings")
    }

    pub fn log_directive(&self) -> &str {
        &self.log.level
    }

    pub fn source_url(&self) -> Result<String> {
        if let Some(url) = self.mcas.url.as_deref().filter(|url| !url.trim().is_empty()) {
            return Ok(url.trim().to_owned());
        }
        match self.mcas.subdomain.as_deref().map(str::trim) {
            Some(subdomain) if !subdomain.is_empty() => {
                Ok(format!("https://{subdomain}.{SOURCE_PORTAL_DOMAIN}"))
            }
            _ => bail!("mcas.url or mcas.subdomain is required"),
        }
    }

    pub fn database_url(&self) -> Result<String> {
        if let Some(url) = self.sql.url.as_deref().filter(|url| !url.trim().is_empty()) {
            return Ok(url.trim().to_owned());
        }
        match &self.sql.database {
            Some(path) => Ok(format!("sqlite://{}", path.display())),
            None => bail!("sql.url or sql.database is required"),
        }
    }

    pub fn mappings(&self) -> Vec<PolicyMapping> {
        self.target
            .mcas_classifications
            .iter()
            .map(|entry| PolicyMapping {
                policy_id: entry.mcas_id.clone(),
                classification: entry.box_name.clone(),
                initial_offset: entry.paginate,
                initial_drained_at: entry.processed_all_at,
            })
            .collect()
    }

    /// Validated runtime configuration described by these settings.
    pub fn to_config(&self) -> Result<SyncConfig> {
        let target_url = self
            .target
            .api_url
            .clone()
            .unwrap_or_else(|| DEFAULT_TARGET_URL.to_owned());

        let builder = SyncConfig::builder()
            .source_url(self.source_url()?)
            .source_token(self.mcas.api_token.clone())
            .target_url(target_url)
            .target_token(self.target.access_token.clone())
            .database_url(self.database_url()?)
            .mappings(self.mappings());

        self.sync.apply(builder).build()
    }
}

impl TuningSettings {
    fn apply(&self, mut builder: SyncConfigBuilder) -> SyncConfigBuilder {
        if let Some(limit) = self.source_rate_limit {
            builder = builder.source_rate_limit(limit);
        }
        if let Some(limit) = self.target_rate_limit {
            builder = builder.target_rate_limit(limit);
        }
        if let Some(count) = self.worker_count {
            builder = builder.worker_count(count);
        }
        if let Some(secs) = self.debounce_secs {
            builder = builder.debounce(Duration::from_secs(secs));
        }
        if let Some(size) = self.retry_chunk_size {
            builder = builder.retry_chunk_size(size);
        }
        if let Some(attempts) = self.max_attempts {
            builder = builder.max_attempts(attempts);
        }
        if let Some(secs) = self.request_timeout_secs {
            builder = builder.request_timeout(Duration::from_secs(secs));
        }
        if let Some(ms) = self.cycle_interval_ms {
            builder = builder.cycle_interval(Duration::from_millis(ms));
        }
        if let Some(secs) = self.metrics_interval_secs {
            builder = builder.metrics_interval(Duration::from_secs(secs));
        }
        builder
    }
}

fn de_policy_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::String(text) => Ok(text),
        serde_yaml::Value::Number(number) => Ok(number.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a policy id string, got {other:?}"
        ))),
    }
}

/// Accepts RFC 3339 as well as naive `YYYY-MM-DD HH:MM:SS[.f]` timestamps,
/// the latter read as UTC.
fn de_optional_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(text) => parse_timestamp(text).map(Some).map_err(serde::de::Error::custom),
    }
}

fn parse_timestamp(text: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Ok(parsed.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(naive.and_utc());
        }
    }
    Err(format!("unrecognised timestamp {text:?}"))
}

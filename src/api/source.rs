//! Client for the source monitoring platform's file listing endpoint. Each
//! listing call returns one page of files that matched a DLP policy together
//! with a `hasNext` flag; matches are surfaced as [`TriggerEvent`]s.

use crate::api::auth::token_headers;
use crate::api::http::execute;
use crate::api::metrics::{ApiMetrics, ApiMetricsSnapshot};
use crate::api::options::ApiClientOptions;
use crate::runtime::config::SyncConfig;
use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

const LIST_FILES_PATH: &str = "/api/v1/files/";

/// File type class the listing filter always excludes.
pub const EXCLUDED_FILE_TYPE: u8 = 6;

/// A policy match reported by the source platform for one target file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerEvent {
    pub event_id: String,
    pub file_id: String,
    pub owner: String,
}

/// One page of the listing endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventPage {
    pub has_next: bool,
    pub events: Vec<TriggerEvent>,
    /// Entries in the page that lacked a file id or owner.
    pub skipped: usize,
}

/// Paginated access to policy trigger events.
pub trait EventSource: Send + Sync {
    fn list_events<'a>(&'a self, policy_id: &'a str, offset: u64)
        -> BoxFuture<'a, Result<EventPage>>;
}

#[derive(Debug, Clone)]
pub struct SourceClient {
    base_url: Arc<String>,
    client: reqwest::Client,
    metrics: Arc<ApiMetrics>,
}

impl EventSource for SourceClient {
    fn list_events<'a>(
        &'a self,
        policy_id: &'a str,
        offset: u64,
    ) -> BoxFuture<'a, Result<EventPage>> {
        Box::pin(self.list_events(policy_id, offset))
    }
}

impl SourceClient {
    pub fn new(base_url: impl Into<String>, token: impl AsRef<str>) -> Result<Self> {
        Self::with_options(base_url, token, ApiClientOptions::default())
    }

    pub fn with_options(
        base_url: impl Into<String>,
        token: impl AsRef<str>,
        options: ApiClientOptions,
    ) -> Result<Self> {
        options.validate()?;
        let headers = token_headers(token.as_ref())?;
        let client = options
            .client_builder()
            .default_headers(headers)
            .build()
            .map_err(|err| anyhow!("failed to build source HTTP client: {err}"))?;

        Ok(Self {
            base_url: Arc::new(base_url.into().trim_end_matches('/').to_owned()),
            client,
            metrics: Arc::new(ApiMetrics::default()),
        })
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let options = ApiClientOptions {
            request_timeout: config.request_timeout(),
            ..ApiClientOptions::default()
        };
        Self::with_options(config.source_url(), config.source_token(), options)
    }

    pub fn endpoint(&self) -> &str {
        &self.base_url
    }

    pub fn metrics(&self) -> ApiMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub(crate) fn metrics_handle(&self) -> Arc<ApiMetrics> {
        self.metrics.clone()
    }

    /// Fetches the page at `offset` of files matching `policy_id`.
    pub async fn list_events(&self, policy_id: &str, offset: u64) -> Result<EventPage> {
        const METHOD: &str = "list_files";

        let url = format!("{}{}", self.base_url, LIST_FILES_PATH);
        let request = self
            .client
            .post(url)
            .query(&[("skip", offset)])
            .json(&listing_filter(policy_id));

        let response = execute(&self.metrics, METHOD, request).await?;
        let body: ListingResponse = response
            .json()
            .await
            .with_context(|| format!("failed to decode {METHOD} response"))?;

        let page = body.into_page();
        tracing::debug!(
            policy_id,
            offset,
            events = page.events.len(),
            skipped = page.skipped,
            has_next = page.has_next,
            "fetched policy trigger page"
        );
        Ok(page)
    }
}

fn listing_filter(policy_id: &str) -> Value {
    json!({
        "filters": {
            "fileType": { "neq": [EXCLUDED_FILE_TYPE] },
            "policy": { "cabinetmatchedrulesequals": [policy_id] },
        }
    })
}

#[derive(Debug, Deserialize)]
struct ListingResponse {
    #[serde(rename = "hasNext", default)]
    has_next: bool,
    #[serde(default)]
    data: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawTrigger {
    id: Value,
    #[serde(rename = "boxItem")]
    item: RawItem,
}

#[derive(Debug, Deserialize)]
struct RawItem {
    id: Value,
    owned_by: RawOwner,
}

#[derive(Debug, Deserialize)]
struct RawOwner {
    login: String,
}

impl ListingResponse {
    fn into_page(self) -> EventPage {
        let mut events = Vec::with_capacity(self.data.len());
        let mut skipped = 0;

        for entry in self.data {
            match serde_json::from_value::<RawTrigger>(entry) {
                Ok(raw) => match raw.into_event() {
                    Some(event) => events.push(event),
                    None => skipped += 1,
                },
                Err(err) => {
                    tracing::warn!(error = %err, "skipping malformed policy trigger");
                    skipped += 1;
                }
            }
        }

        EventPage {
            has_next: self.has_next,
            events,
            skipped,
        }
    }
}

impl RawTrigger {
    fn into_event(self) -> Option<TriggerEvent> {
        let event_id = scalar_to_string(&self.id)?;
        let file_id = scalar_to_string(&self.item.id)?;
        let owner = self.item.owned_by.login.trim().to_owned();
        if owner.is_empty() {
            tracing::warn!(event_id, file_id, "skipping policy trigger without owner login");
            return None;
        }
        Some(TriggerEvent {
            event_id,
            file_id,
            owner,
        })
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_owned()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

//! Client for the target storage platform: owner directory lookups plus the
//! per-file metadata reads and classification writes that run on behalf of a
//! file owner through the `As-User` header.

use crate::api::auth::{as_user_header, bearer_headers};
use crate::api::error::ApiError;
use crate::api::http::execute;
use crate::api::metrics::{ApiMetrics, ApiMetricsSnapshot};
use crate::api::options::ApiClientOptions;
use crate::runtime::config::SyncConfig;
use anyhow::{anyhow, Context, Result};
use futures::future::BoxFuture;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Metadata template holding the enterprise security classification.
pub const CLASSIFICATION_TEMPLATE: &str = "securityClassification-6VMVochwUWo";

/// Key inside [`CLASSIFICATION_TEMPLATE`] that carries the label name.
pub const CLASSIFICATION_KEY: &str = "Box__Security__Classification__Key";

/// Page size of owner lookups.
const OWNER_LOOKUP_LIMIT: &str = "100";
const JSON_PATCH_CONTENT_TYPE: &str = "application/json-patch+json";

/// Directory entry returned by an owner lookup.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OwnerAccount {
    #[serde(deserialize_with = "de_scalar_id")]
    pub id: String,
    pub login: String,
}

/// Credential scoped to act as a single file owner.
///
/// Plain value: it only names the user the request impersonates. Rate
/// limiting stays with the caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DelegatedHandle {
    pub user_id: String,
    pub login: String,
}

impl From<OwnerAccount> for DelegatedHandle {
    fn from(account: OwnerAccount) -> Self {
        Self {
            user_id: account.id,
            login: account.login,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileInfo {
    #[serde(deserialize_with = "de_scalar_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// How a classification write landed on the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelWrite {
    Created,
    Updated,
}

pub trait LabelTarget: Send + Sync {
    fn find_owner<'a>(&'a self, login: &'a str) -> BoxFuture<'a, Result<Option<OwnerAccount>>>;

    fn fetch_file<'a>(
        &'a self,
        handle: &'a DelegatedHandle,
        file_id: &'a str,
    ) -> BoxFuture<'a, Result<FileInfo>>;

    fn apply_label<'a>(
        &'a self,
        handle: &'a DelegatedHandle,
        file_id: &'a str,
        label: &'a str,
    ) -> BoxFuture<'a, Result<LabelWrite>>;
}

#[derive(Debug, Clone)]
pub struct TargetClient {
    base_url: Arc<String>,
    client: reqwest::Client,
    metrics: Arc<ApiMetrics>,
}

impl LabelTarget for TargetClient {
    fn find_owner<'a>(&'a self, login: &'a str) -> BoxFuture<'a, Result<Option<OwnerAccount>>> {
        Box::pin(self.find_owner(login))
    }

    fn fetch_file<'a>(
        &'a self,
        handle: &'a DelegatedHandle,
        file_id: &'a str,
    ) -> BoxFuture<'a, Result<FileInfo>> {
        Box::pin(self.fetch_file(handle, file_id))
    }

    fn apply_label<'a>(
        &'a self,
        handle: &'a DelegatedHandle,
        file_id: &'a str,
        label: &'a str,
    ) -> BoxFuture<'a, Result<LabelWrite>> {
        Box::pin(self.apply_label(handle, file_id, label))
    }
}

impl TargetClient {
    pub fn new(base_url: impl Into<String>, token: impl AsRef<str>) -> Result<Self> {
        Self::with_options(base_url, token, ApiClientOptions::default())
    }

    pub fn with_options(
        base_url: impl Into<String>,
        token: impl AsRef<str>,
        options: ApiClientOptions,
    ) -> Result<Self> {
        options.validate()?;
        let headers = bearer_headers(token.as_ref())?;
        let client = options
            .client_builder()
            .default_headers(headers)
            .build()
            .map_err(|err| anyhow!("failed to build target HTTP client: {err}"))?;

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
        Self::with_options(config.target_url(), config.target_token(), options)
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

    /// Looks up the directory entry whose login matches `login`.
    ///
    /// The directory filter is a prefix match and may list other users whose
    /// login starts with `login` first, so a full page is requested and only
    /// an entry whose login equals the requested one (ignoring case) is kept.
    pub async fn find_owner(&self, login: &str) -> Result<Option<OwnerAccount>> {
        const METHOD: &str = "find_owner";

        let request = self
            .client
            .get(format!("{}/users", self.base_url))
            .query(&[("filter_term", login), ("limit", OWNER_LOOKUP_LIMIT)]);

        let response = execute(&self.metrics, METHOD, request).await?;
        let body: UserListing = response
            .json()
            .await
            .with_context(|| format!("failed to decode {METHOD} response"))?;

        Ok(body
            .entries
            .into_iter()
            .find(|entry| entry.login.eq_ignore_ascii_case(login)))
    }

    pub async fn fetch_file(&self, handle: &DelegatedHandle, file_id: &str) -> Result<FileInfo> {
        const METHOD: &str = "get_file";

        let (name, value) = as_user_header(&handle.user_id)?;
        let request = self
            .client
            .get(format!("{}/files/{}", self.base_url, file_id))
            .query(&[("fields", "id,name")])
            .header(name, value);

        let response = execute(&self.metrics, METHOD, request).await?;
        response
            .json()
            .await
            .with_context(|| format!("failed to decode {METHOD} response for file {file_id}"))
    }

    /// Writes `label` into the classification template of `file_id`.
    ///
    /// A conflict on create means the file already carries a classification,
    /// which is then replaced in place.
    pub async fn apply_label(
        &self,
        handle: &DelegatedHandle,
        file_id: &str,
        label: &str,
    ) -> Result<LabelWrite> {
        let url = format!(
            "{}/files/{}/metadata/enterprise/{}",
            self.base_url, file_id, CLASSIFICATION_TEMPLATE
        );
        let (name, value) = as_user_header(&handle.user_id)?;

        let create = self
            .client
            .post(&url)
            .header(name.clone(), value.clone())
            .json(&json!({ CLASSIFICATION_KEY: label }));

        match execute(&self.metrics, "create_classification", create).await {
            Ok(_) => return Ok(LabelWrite::Created),
            Err(err) if ApiError::has_status(&err, 409) => {
                tracing::debug!(file_id, label, "classification exists; replacing it");
            }
            Err(err) => return Err(err),
        }

        let patch = serde_json::to_vec(&classification_patch(label))
            .context("failed to encode classification patch")?;
        let update = self
            .client
            .put(&url)
            .header(name, value)
            .header(CONTENT_TYPE, JSON_PATCH_CONTENT_TYPE)
            .body(patch);

        execute(&self.metrics, "update_classification", update).await?;
        Ok(LabelWrite::Updated)
    }
}

fn classification_patch(label: &str) -> Value {
    json!([{
        "op": "replace",
        "path": format!("/{CLASSIFICATION_KEY}"),
        "value": label,
    }])
}

#[derive(Debug, Deserialize)]
struct UserListing {
    #[serde(default)]
    entries: Vec<OwnerAccount>,
}

fn de_scalar_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => Ok(text),
        Value::Number(number) => Ok(number.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

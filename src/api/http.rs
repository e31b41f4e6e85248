use crate::api::error::ApiError;
use crate::api::metrics::ApiMetrics;
use anyhow::{anyhow, Result};
use reqwest::{RequestBuilder, Response};
use std::time::Instant;

/// Sends `request`, records latency, and maps transport failures and
/// non-2xx statuses onto [`ApiError`].
pub(crate) async fn execute(
    metrics: &ApiMetrics,
    method: &'static str,
    request: RequestBuilder,
) -> Result<Response> {
    let start = Instant::now();

    let response = match request.send().await {
        Ok(response) => response,
        Err(err) if err.is_timeout() => {
            metrics.record_timeout(start.elapsed());
            return Err(ApiError::Timeout { method }.into());
        }
        Err(err) => {
            metrics.record_failure(start.elapsed());
            return Err(anyhow!("{method} request failed: {err}"));
        }
    };

    let status = response.status();
    if status.is_success() {
        metrics.record_success(start.elapsed());
        tracing::trace!(method, status = status.as_u16(), "api call completed");
        return Ok(response);
    }

    metrics.record_failure(start.elapsed());
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::from_status(method, status.as_u16(), body).into())
}

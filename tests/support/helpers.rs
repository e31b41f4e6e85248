use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use labelsync::{PolicyMapping, SyncConfig};
use once_cell::sync::Lazy;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use super::mock_platform::MockPlatform;

pub const SOURCE_TOKEN: &str = "source-token";
pub const TARGET_TOKEN: &str = "target-token";

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Config pointing both platforms at the mock server with an in-memory store.
pub fn config_for(url: &str, mappings: Vec<PolicyMapping>) -> Result<SyncConfig> {
    SyncConfig::builder()
        .source_url(url)
        .source_token(SOURCE_TOKEN)
        .target_url(url)
        .target_token(TARGET_TOKEN)
        .database_url("sqlite::memory:")
        .mappings(mappings)
        .source_rate_limit(1_000)
        .target_rate_limit(1_000)
        .worker_count(4)
        .debounce(Duration::from_secs(60))
        .request_timeout(Duration::from_secs(5))
        .cycle_interval(Duration::from_millis(50))
        .metrics_interval(Duration::from_millis(200))
        .build()
}

pub async fn wait_for_label(platform: &MockPlatform, file_id: &str, expected: &str) -> Result<()> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if platform.label_of(file_id).as_deref() == Some(expected) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!(
                "timed out waiting for {file_id} to be labelled {expected}, found {:?}",
                platform.label_of(file_id)
            );
        }
        sleep(Duration::from_millis(20)).await;
    }
}

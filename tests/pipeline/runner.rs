use std::time::Duration;

use crate::support::{
    helpers::{config_for, init_tracing, wait_for_label},
    mock_platform::{MockPlatform, MockPlatformServer},
};
use anyhow::{Context, Result};
use labelsync::{PolicyMapping, Runner};
use tokio::time::timeout;

fn platform() -> MockPlatform {
    MockPlatform::new()
        .with_policy("policy-1", vec![vec![("F1", "alice@example.com")]])
        .with_user("alice@example.com", "11")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_labels_files_and_stops_cleanly() -> Result<()> {
    init_tracing();
    let platform = platform();
    let server = MockPlatformServer::start(platform.clone()).await?;
    let config = config_for(
        server.url(),
        vec![PolicyMapping::new("policy-1", "Confidential")],
    )?;

    let mut runner = Runner::connect(config).await?;
    runner.start()?;
    assert!(runner.is_running());

    wait_for_label(&platform, "F1", "Confidential").await?;
    let telemetry = runner.engine().telemetry().snapshot();
    assert!(telemetry.applied >= 1);

    timeout(Duration::from_secs(5), runner.stop())
        .await
        .context("runner should stop promptly")??;
    assert!(!runner.is_running());

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_exits_when_token_is_cancelled() -> Result<()> {
    init_tracing();
    let platform = platform();
    let server = MockPlatformServer::start(platform.clone()).await?;
    let config = config_for(
        server.url(),
        vec![PolicyMapping::new("policy-1", "Confidential")],
    )?;

    let mut runner = Runner::connect(config).await?;
    let token = runner.cancellation_token();
    let watcher = platform.clone();
    tokio::spawn(async move {
        if wait_for_label(&watcher, "F1", "Confidential").await.is_ok() {
            token.cancel();
        }
    });

    timeout(Duration::from_secs(5), runner.run_until_ctrl_c())
        .await
        .context("runner should exit after cancellation")??;
    assert_eq!(platform.label_of("F1").as_deref(), Some("Confidential"));

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stopped_runner_refuses_to_restart() -> Result<()> {
    init_tracing();
    let platform = platform();
    let server = MockPlatformServer::start(platform.clone()).await?;
    let config = config_for(
        server.url(),
        vec![PolicyMapping::new("policy-1", "Confidential")],
    )?;

    let mut runner = Runner::connect(config).await?;
    runner.start()?;
    wait_for_label(&platform, "F1", "Confidential").await?;
    runner.stop().await?;

    let err = runner
        .start()
        .expect_err("a stopped runner must not start again");
    assert!(format!("{err:#}").contains("already stopped"));
    assert!(!runner.is_running());
    assert!(runner.engine().database().is_closed());

    server.shutdown().await;
    Ok(())
}

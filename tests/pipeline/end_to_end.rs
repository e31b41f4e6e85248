use crate::support::{
    helpers::{config_for, init_tracing, SOURCE_TOKEN, TARGET_TOKEN},
    mock_platform::{MockPlatform, MockPlatformServer},
};
use anyhow::{Context, Result};
use hyper::Method;
use labelsync::{PolicyMapping, SyncEngine};
use tokio_util::sync::CancellationToken;

const POLICY: &str = "policy-confidential";
const LABEL: &str = "Confidential";

async fn engine_for(server: &MockPlatformServer) -> Result<SyncEngine> {
    let config = config_for(server.url(), vec![PolicyMapping::new(POLICY, LABEL)])?;
    SyncEngine::connect(config).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn labels_every_page_then_waits_for_debounce() -> Result<()> {
    init_tracing();
    let platform = MockPlatform::new()
        .with_policy(
            POLICY,
            vec![
                vec![("F1", "alice@example.com"), ("F2", "bob@example.com")],
                vec![("F3", "alice@example.com")],
            ],
        )
        .with_user("alice@example.com", "11")
        .with_user("bob@example.com", "22");
    let server = MockPlatformServer::start(platform.clone()).await?;
    let engine = engine_for(&server).await?;
    let token = CancellationToken::new();

    let report = engine.run_cycle(&token).await?;
    assert_eq!(report.pages, 2);
    assert_eq!(report.events, 3);
    assert_eq!(report.applied, 3);
    assert!(report.retry_chunks.is_empty());

    for file_id in ["F1", "F2", "F3"] {
        assert_eq!(platform.label_of(file_id).as_deref(), Some(LABEL));
        let records = engine.attempts().list_for_file(file_id).await?;
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert!(record.applied, "{file_id} should be applied");
        assert_eq!(record.attempts, 1);
        assert_eq!(record.error_forbidden, None);
        assert_eq!(record.error_no_identity, None);
        assert_eq!(record.error_message, None);
        assert_eq!(record.file_name, Some(format!("{file_id}.pdf")));
    }
    assert!(engine.attempts().retry_eligible(1000).next_chunk().await?.is_none());

    let cursor = engine
        .cursors()
        .load(POLICY, LABEL)
        .await?
        .context("cursor should be persisted")?;
    assert_eq!(cursor.offset, 1);
    assert!(cursor.last_drained_at.is_some());

    // alice is looked up once even though she owns two files
    let lookups = platform.calls_to(Method::GET, "/users");
    assert_eq!(lookups.len(), 2);

    let clients = engine.telemetry().api_snapshots();
    let source = clients
        .iter()
        .find(|(client, _)| *client == "source")
        .map(|(_, snapshot)| *snapshot)
        .context("source client metrics should be registered")?;
    let target = clients
        .iter()
        .find(|(client, _)| *client == "target")
        .map(|(_, snapshot)| *snapshot)
        .context("target client metrics should be registered")?;
    assert_eq!(source.total_requests, 2);
    // 2 owner lookups, then a fetch and a create per file
    assert_eq!(target.total_requests, 8);
    assert_eq!(target.total_errors, 0);

    let second = engine.run_cycle(&token).await?;
    assert_eq!(second.policies_not_due, 1);
    assert_eq!(second.pages, 0);
    assert_eq!(platform.listing_offsets(POLICY), vec![0, 1]);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sends_platform_credentials_and_acts_as_owner() -> Result<()> {
    init_tracing();
    let platform = MockPlatform::new()
        .with_policy(POLICY, vec![vec![("F1", "alice@example.com")]])
        .with_user("alice@example.com", "11");
    let server = MockPlatformServer::start(platform.clone()).await?;
    let engine = engine_for(&server).await?;

    engine.run_cycle(&CancellationToken::new()).await?;

    let listing = platform.calls_to(Method::POST, "/api/v1/files/");
    assert_eq!(listing.len(), 1);
    assert_eq!(
        listing[0].authorization.as_deref(),
        Some(format!("Token {SOURCE_TOKEN}").as_str())
    );
    assert_eq!(listing[0].body["filters"]["fileType"]["neq"][0], 6);

    let file_calls = platform.calls_to(Method::GET, "/files/F1");
    assert_eq!(file_calls.len(), 1);
    assert_eq!(file_calls[0].as_user.as_deref(), Some("11"));
    assert_eq!(
        file_calls[0].authorization.as_deref(),
        Some(format!("Bearer {TARGET_TOKEN}").as_str())
    );

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn forbidden_files_are_never_retried() -> Result<()> {
    init_tracing();
    let platform = MockPlatform::new()
        .with_policy(POLICY, vec![vec![("F1", "alice@example.com")]])
        .with_user("alice@example.com", "11")
        .forbidden_file("F1");
    let server = MockPlatformServer::start(platform.clone()).await?;
    let engine = engine_for(&server).await?;
    let token = CancellationToken::new();

    let report = engine.run_cycle(&token).await?;
    assert_eq!(report.forbidden, 1);
    assert!(report.retry_chunks.is_empty());

    let records = engine.attempts().list_for_file("F1").await?;
    assert_eq!(records.len(), 1);
    assert!(!records[0].applied);
    assert_eq!(records[0].error_forbidden, Some(true));
    assert_eq!(records[0].error_no_identity, None);
    assert_eq!(records[0].error_message, None);
    assert_eq!(records[0].attempts, 1);
    assert!(engine.attempts().retry_eligible(1000).next_chunk().await?.is_none());
    assert!(platform.calls_to(Method::POST, "/files/F1/metadata").is_empty());

    engine.run_cycle(&token).await?;
    assert_eq!(platform.calls_to(Method::GET, "/files/F1").len(), 1);

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_owner_is_recorded_without_touching_files() -> Result<()> {
    init_tracing();
    let platform =
        MockPlatform::new().with_policy(POLICY, vec![vec![("F1", "ghost@example.com")]]);
    let server = MockPlatformServer::start(platform.clone()).await?;
    let engine = engine_for(&server).await?;

    let report = engine.run_cycle(&CancellationToken::new()).await?;
    assert_eq!(report.no_identity, 1);

    let records = engine.attempts().list_for_file("F1").await?;
    assert_eq!(records[0].error_no_identity, Some(true));
    assert_eq!(records[0].attempts, 1);
    assert!(engine.attempts().retry_eligible(1000).next_chunk().await?.is_none());
    assert!(platform.calls_to(Method::GET, "/files/").is_empty());
    assert!(platform.label_of("F1").is_none());

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_failure_is_retried_in_the_same_cycle() -> Result<()> {
    init_tracing();
    let platform = MockPlatform::new()
        .with_policy(POLICY, vec![vec![("F1", "alice@example.com")]])
        .with_user("alice@example.com", "11")
        .flaky_file("F1", 1);
    let server = MockPlatformServer::start(platform.clone()).await?;
    let engine = engine_for(&server).await?;

    let report = engine.run_cycle(&CancellationToken::new()).await?;
    assert_eq!(report.failed, 1);
    assert_eq!(report.applied, 1);
    assert_eq!(report.retry_chunks, vec![1]);

    let records = engine.attempts().list_for_file("F1").await?;
    assert_eq!(records.len(), 1);
    assert!(records[0].applied);
    assert_eq!(records[0].attempts, 2);
    assert!(records[0].error_message.is_none());
    assert_eq!(platform.label_of("F1").as_deref(), Some(LABEL));

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn existing_classification_is_replaced() -> Result<()> {
    init_tracing();
    let platform = MockPlatform::new()
        .with_policy(POLICY, vec![vec![("F1", "alice@example.com")]])
        .with_user("alice@example.com", "11")
        .labelled_file("F1", "Public");
    let server = MockPlatformServer::start(platform.clone()).await?;
    let engine = engine_for(&server).await?;

    let report = engine.run_cycle(&CancellationToken::new()).await?;
    assert_eq!(report.applied, 1);
    assert_eq!(platform.label_of("F1").as_deref(), Some(LABEL));

    let updates = platform.calls_to(Method::PUT, "/files/F1/metadata");
    assert_eq!(updates.len(), 1);
    assert_eq!(
        updates[0].content_type.as_deref(),
        Some("application/json-patch+json")
    );
    assert_eq!(updates[0].body[0]["op"], "replace");
    assert_eq!(updates[0].as_user.as_deref(), Some("11"));

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_listing_does_not_block_other_policies() -> Result<()> {
    init_tracing();
    let platform = MockPlatform::new()
        .failing_listing("policy-broken")
        .with_policy(POLICY, vec![vec![("F1", "alice@example.com")]])
        .with_user("alice@example.com", "11");
    let server = MockPlatformServer::start(platform.clone()).await?;
    let config = config_for(
        server.url(),
        vec![
            PolicyMapping::new("policy-broken", "Restricted"),
            PolicyMapping::new(POLICY, LABEL),
        ],
    )?;
    let engine = SyncEngine::connect(config).await?;

    let report = engine.run_cycle(&CancellationToken::new()).await?;
    assert_eq!(report.listing_failures, 1);
    assert_eq!(report.applied, 1);
    assert_eq!(platform.label_of("F1").as_deref(), Some(LABEL));

    let broken = engine
        .cursors()
        .load("policy-broken", "Restricted")
        .await?
        .context("failed policy should still be drained")?;
    assert!(broken.last_drained_at.is_some());

    server.shutdown().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn owner_is_found_behind_prefix_matching_logins() -> Result<()> {
    init_tracing();
    let platform = MockPlatform::new()
        .with_policy(POLICY, vec![vec![("F1", "alice@example.com")]])
        .with_user("alice@example.com.au", "99")
        .with_user("Alice@Example.com", "11");
    let server = MockPlatformServer::start(platform.clone()).await?;
    let engine = engine_for(&server).await?;

    let report = engine.run_cycle(&CancellationToken::new()).await?;
    assert_eq!(report.applied, 1);
    assert_eq!(report.no_identity, 0);

    let records = engine.attempts().list_for_file("F1").await?;
    assert!(records[0].applied);
    assert_eq!(records[0].error_no_identity, None);

    let writes = platform.calls_to(Method::POST, "/files/F1/metadata");
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].as_user.as_deref(), Some("11"));

    server.shutdown().await;
    Ok(())
}

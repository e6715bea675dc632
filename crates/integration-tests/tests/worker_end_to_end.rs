//! Worker -> PostingDispatcher -> ApiPublisher -> ResilientClient, on SQLite

mod common;

use async_trait::async_trait;
use common::{insert_subject, TestDb};
use marketpost_core::application::{
    ClientConfig, LeaseManager, PostingDispatcher, RateLimiter, ResilientClient, TickOutcome,
    TokenManager, Worker,
};
use marketpost_core::domain::{ApiEnvironment, DestinationLimits, JobStatus, SubjectStatus, TokenGrant};
use marketpost_core::port::automation::mocks::MockAutomation;
use marketpost_core::port::http_transport::mocks::ScriptedTransport;
use marketpost_core::port::id_provider::UuidProvider;
use marketpost_core::port::sleeper::mocks::RecordingSleeper;
use marketpost_core::port::time_provider::mocks::ManualTimeProvider;
use marketpost_core::port::token_endpoint::mocks::CountingTokenEndpoint;
use marketpost_core::port::{HttpMethod, TokenEndpoint};
use marketpost_core::ExternalError;
use marketpost_daemon::ApiPublisher;
use std::collections::HashMap;
use std::sync::Arc;

const START: i64 = 1_700_000_000_000;
const WORKER: &str = "worker-1";

struct Harness {
    db: TestDb,
    clock: Arc<ManualTimeProvider>,
    transport: Arc<ScriptedTransport>,
    leases: Arc<LeaseManager>,
    limiter: Arc<RateLimiter>,
    worker: Worker,
}

/// Grants only for the `renewed` refresh token; every other one was revoked
struct RevokedUntilRenewed;

#[async_trait]
impl TokenEndpoint for RevokedUntilRenewed {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, ExternalError> {
        if refresh_token != "renewed" {
            return Err(ExternalError::RefreshFailed("invalid_grant".into()));
        }
        Ok(TokenGrant {
            access_token: "renewed-access".into(),
            expires_in_secs: 7200,
            refresh_token: None,
            scope: None,
        })
    }

    async fn exchange_code(&self, _code: &str) -> Result<TokenGrant, ExternalError> {
        Err(ExternalError::RefreshFailed("unexpected code exchange".into()))
    }
}

async fn harness(transport: ScriptedTransport) -> Harness {
    harness_with_endpoint(transport, Arc::new(CountingTokenEndpoint::new())).await
}

async fn harness_with_endpoint(
    transport: ScriptedTransport,
    endpoint: Arc<dyn TokenEndpoint>,
) -> Harness {
    let db = TestDb::new().await;
    let clock = Arc::new(ManualTimeProvider::new(START));
    let transport = Arc::new(transport);

    let tokens = TokenManager::new(db.store.clone(), endpoint, clock.clone(), ApiEnvironment::Sandbox);
    tokens
        .store_grant(&TokenGrant {
            access_token: "access".into(),
            expires_in_secs: 7200,
            refresh_token: Some("refresh".into()),
            scope: None,
        })
        .await
        .unwrap();
    let client = Arc::new(ResilientClient::new(
        transport.clone(),
        tokens,
        Arc::new(RecordingSleeper::new()),
        clock.clone(),
        ClientConfig::default(),
    ));

    let mut limits = HashMap::new();
    limits.insert("ebay".to_string(), DestinationLimits::new(10, 15 * 60_000));
    let limiter = Arc::new(RateLimiter::new(
        db.store.clone(),
        clock.clone(),
        Arc::new(UuidProvider),
        limits,
    ));

    let dispatcher = PostingDispatcher::new(limiter.clone()).with_publisher(
        "ebay",
        Arc::new(ApiPublisher::new(
            client,
            HttpMethod::Put,
            "/sell/inventory/v1/inventory_item/{id}",
        )),
    );
    let leases = Arc::new(LeaseManager::new(
        db.store.clone(),
        clock.clone(),
        Arc::new(UuidProvider),
    ));
    let worker = Worker::new(WORKER, leases.clone(), Arc::new(dispatcher));

    Harness {
        db,
        clock,
        transport,
        leases,
        limiter,
        worker,
    }
}

async fn run_one(h: &Harness, subject_id: &str) -> (String, JobStatus) {
    h.leases.enqueue(subject_id).await.unwrap();
    match h.worker.tick().await.unwrap() {
        TickOutcome::Completed { job_id, status } => (job_id, status),
        other => panic!("expected a completed job, got {:?}", other),
    }
}

#[tokio::test]
async fn test_posting_run_updates_job_subject_and_limits() {
    let h = harness(ScriptedTransport::statuses(&[204])).await;
    insert_subject(h.db.store.as_ref(), "SKU-1", &["ebay"]).await;

    let (job_id, status) = run_one(&h, "SKU-1").await;
    assert_eq!(status, JobStatus::Succeeded);

    let job = h.leases.job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(job.lease_owner, None);
    let results = &job.result.unwrap()["destinations"];
    assert_eq!(results[0]["destination"], "ebay");
    assert_eq!(results[0]["outcome"], "posted");

    let subject = h.leases.subject("SKU-1").await.unwrap().unwrap();
    assert_eq!(subject.status, SubjectStatus::Active);
    assert_eq!(subject.active_job_id, None);

    let status = h.limiter.status("ebay", WORKER).await.unwrap();
    assert_eq!(status.daily_count, 1);
    assert_eq!(status.last_post_at, Some(START));
    assert_eq!(h.transport.tokens_seen(), vec!["access".to_string()]);

    assert_eq!(h.worker.tick().await.unwrap(), TickOutcome::Idle);
}

#[tokio::test]
async fn test_transient_failure_is_retried_within_one_run() {
    let h = harness(ScriptedTransport::statuses(&[503, 502, 201])).await;
    insert_subject(h.db.store.as_ref(), "SKU-1", &["ebay"]).await;

    let (_, status) = run_one(&h, "SKU-1").await;
    assert_eq!(status, JobStatus::Succeeded);
    assert_eq!(h.transport.call_count(), 3);
}

#[tokio::test]
async fn test_rejected_listing_fails_job_and_marks_subject_error() {
    let h = harness(ScriptedTransport::statuses(&[400])).await;
    insert_subject(h.db.store.as_ref(), "SKU-1", &["ebay"]).await;

    let (job_id, status) = run_one(&h, "SKU-1").await;
    assert_eq!(status, JobStatus::Failed);

    let job = h.leases.job(&job_id).await.unwrap().unwrap();
    let error = job.last_error.unwrap();
    assert_eq!(error.code, "PERMANENT_EXTERNAL");
    assert_eq!(error.status, Some(400));

    let subject = h.leases.subject("SKU-1").await.unwrap().unwrap();
    assert_eq!(subject.status, SubjectStatus::Error);

    // Nothing was posted, so nothing counts against the limit
    let status = h.limiter.status("ebay", WORKER).await.unwrap();
    assert_eq!(status.daily_count, 0);
}

#[tokio::test]
async fn test_revoked_refresh_token_recovers_after_new_token_is_installed() {
    let h = harness_with_endpoint(
        ScriptedTransport::statuses(&[204]),
        Arc::new(RevokedUntilRenewed),
    )
    .await;
    insert_subject(h.db.store.as_ref(), "SKU-1", &["ebay"]).await;
    // Stored access token expires, and its refresh token has been revoked
    h.clock.advance(3 * 3_600_000);

    let (job_id, status) = run_one(&h, "SKU-1").await;
    assert_eq!(status, JobStatus::Failed);
    let job = h.leases.job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.last_error.unwrap().code, "REAUTHORIZATION_REQUIRED");
    assert_eq!(h.transport.call_count(), 0);

    // Operator installs a new refresh token from a separate process
    let operator = TokenManager::new(
        h.db.store.clone(),
        Arc::new(RevokedUntilRenewed),
        h.clock.clone(),
        ApiEnvironment::Sandbox,
    );
    let record = operator.install_refresh_token("renewed").await.unwrap();
    assert_eq!(record.environment, Some(ApiEnvironment::Sandbox));
    assert_eq!(record.access_token, None);

    let requeued = h.leases.requeue_failed("REAUTHORIZATION_REQUIRED").await.unwrap();
    assert_eq!(requeued.len(), 1);

    let TickOutcome::Completed { job_id, status } = h.worker.tick().await.unwrap() else {
        panic!("expected the requeued job to run");
    };
    assert_eq!(job_id, requeued[0]);
    assert_eq!(status, JobStatus::Succeeded);

    let subject = h.leases.subject("SKU-1").await.unwrap().unwrap();
    assert_eq!(subject.status, SubjectStatus::Active);
    assert_eq!(h.transport.tokens_seen(), vec!["renewed-access".to_string()]);
}

#[tokio::test]
async fn test_second_listing_waits_for_min_gap_then_posts() {
    let h = harness(ScriptedTransport::statuses(&[204, 204])).await;
    insert_subject(h.db.store.as_ref(), "SKU-1", &["ebay"]).await;
    insert_subject(h.db.store.as_ref(), "SKU-2", &["ebay"]).await;

    run_one(&h, "SKU-1").await;
    h.clock.advance(60_000);

    let (job_id, status) = run_one(&h, "SKU-2").await;
    assert_eq!(status, JobStatus::Succeeded);
    let job = h.leases.job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.result.unwrap()["destinations"][0]["outcome"], "rate_limited");
    assert_eq!(h.transport.call_count(), 1);
}

#[tokio::test]
async fn test_panicking_automation_fails_job_and_worker_survives() {
    let db = TestDb::new().await;
    insert_subject(db.store.as_ref(), "SKU-1", &["ebay"]).await;
    insert_subject(db.store.as_ref(), "SKU-2", &["ebay"]).await;
    let leases = Arc::new(LeaseManager::new(
        db.store.clone(),
        Arc::new(ManualTimeProvider::new(START)),
        Arc::new(UuidProvider),
    ));
    let automation = Arc::new(MockAutomation::new_panic_inducing("selector not found"));
    let worker = Worker::new(WORKER, leases.clone(), automation.clone());

    leases.enqueue("SKU-1").await.unwrap();
    let TickOutcome::Completed { job_id, status } = worker.tick().await.unwrap() else {
        panic!("expected a completed job");
    };
    assert_eq!(status, JobStatus::Failed);
    let job = leases.job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.last_error.unwrap().code, "EXECUTION_PANICKED");

    automation.set_behavior(marketpost_core::port::automation::mocks::MockBehavior::Success);
    leases.enqueue("SKU-2").await.unwrap();
    assert!(matches!(
        worker.tick().await.unwrap(),
        TickOutcome::Completed {
            status: JobStatus::Succeeded,
            ..
        }
    ));
    assert_eq!(automation.call_count(), 2);
}

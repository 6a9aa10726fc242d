//! Integration tests for the starter loop: admission, the concurrency cap,
//! failure classification, and cancellation.
//!
//! Ticks are driven directly against the in-memory datastore with the mock
//! provider and mock CI client; `drain()` joins in-flight workers so every
//! assertion runs against settled state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use myshoes_control_plane::{Config, Starter};
use myshoes_datastore::memory::MemoryDatastore;
use myshoes_datastore::{
    Datastore, Job, JobId, ResourceClass, Runner, RunnerId, RunnerStatus, Target, TargetId,
    TargetStatus,
};
use myshoes_github::MockGitHubClient;
use myshoes_provider::{MockProvider, ProviderRegistry};

const PROVIDER_URL: &str = "mock://local";

fn test_config() -> Config {
    Config {
        shutdown_grace: Duration::from_secs(5),
        ..Config::default()
    }
}

fn test_target(scope: &str) -> Target {
    Target {
        id: TargetId::new(),
        scope: scope.to_string(),
        ghe_domain: None,
        resource_class: ResourceClass::Nano,
        provider_url: Some(PROVIDER_URL.to_string()),
        status: TargetStatus::Active,
        status_description: None,
        token: None,
        token_expires_at: None,
        runner_user: Some("runner".to_string()),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

fn test_job(target: &Target) -> Job {
    Job {
        id: JobId::new(),
        target_id: target.id,
        ghe_domain: None,
        repository: target.scope.clone(),
        payload: serde_json::json!({"action": "queued"}),
        check_run_id: Some(42),
        workflow_run_id: None,
        created_at: Utc::now(),
    }
}

struct Harness {
    ds: Arc<MemoryDatastore>,
    github: Arc<MockGitHubClient>,
    provider: Arc<MockProvider>,
    starter: Starter,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

fn harness(config: Config) -> Harness {
    let ds = Arc::new(MemoryDatastore::new());
    let github = Arc::new(MockGitHubClient::new());
    let provider = Arc::new(MockProvider::new());

    let mut registry = ProviderRegistry::new();
    registry
        .register(PROVIDER_URL, Arc::clone(&provider) as _)
        .unwrap();

    let starter = Starter::new(
        Arc::clone(&ds) as _,
        Arc::new(registry),
        Arc::clone(&github) as _,
        config,
    );
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    Harness {
        ds,
        github,
        provider,
        starter,
        shutdown_tx,
        shutdown_rx,
    }
}

impl Harness {
    /// One tick plus a join of every worker it dispatched.
    async fn tick_and_settle(&self) {
        self.starter.tick(&self.shutdown_rx).await.unwrap();
        self.starter.drain().await;
    }
}

#[tokio::test]
async fn happy_path_creates_a_runner_within_one_tick() {
    let h = harness(test_config());
    let target = test_target("acme/widget");
    let job = test_job(&target);
    let job_id = job.id;
    h.ds.create_target(target).await.unwrap();
    h.ds.enqueue_job(job).await.unwrap();

    h.tick_and_settle().await;

    let runners = h.ds.list_runners().await.unwrap();
    assert_eq!(runners.len(), 1);
    let runner = &runners[0];
    assert_eq!(runner.cloud_id, "vm-1");
    assert_eq!(runner.status, RunnerStatus::Created);
    assert_eq!(runner.id, RunnerId::from_job(job_id));
    assert_eq!(runner.name, format!("myshoes-{}", runner.id));
    assert_eq!(runner.repository_url, "https://github.com/acme/widget");

    assert!(h.ds.list_jobs().await.unwrap().is_empty());
    assert_eq!(h.github.token_calls(), vec!["acme/widget".to_string()]);
}

#[tokio::test]
async fn transient_provider_failure_leaves_the_job_queued() {
    let h = harness(test_config());
    let target = test_target("acme/widget");
    let target_id = target.id;
    h.ds.create_target(target.clone()).await.unwrap();
    h.ds.enqueue_job(test_job(&target)).await.unwrap();

    h.provider.fail_next_adds(2);

    h.tick_and_settle().await;
    assert_eq!(h.ds.list_jobs().await.unwrap().len(), 1);
    assert!(h.ds.list_runners().await.unwrap().is_empty());
    // The failure is recorded on the target until a retry succeeds.
    let target = h.ds.get_target(target_id).await.unwrap();
    assert_eq!(target.status, TargetStatus::Err);
    assert!(target.status_description.is_some());

    h.tick_and_settle().await;
    assert_eq!(h.ds.list_jobs().await.unwrap().len(), 1);

    h.tick_and_settle().await;
    assert_eq!(h.ds.list_runners().await.unwrap().len(), 1);
    assert!(h.ds.list_jobs().await.unwrap().is_empty());
    assert_eq!(
        h.ds.get_target(target_id).await.unwrap().status,
        TargetStatus::Active
    );
}

#[tokio::test]
async fn terminal_provider_failure_drops_the_job() {
    let h = harness(test_config());
    let target = test_target("acme/widget");
    let target_id = target.id;
    let job = test_job(&target);
    h.ds.create_target(target).await.unwrap();
    h.ds.enqueue_job(job).await.unwrap();

    h.provider.fail_adds_terminally();
    h.tick_and_settle().await;

    assert!(h.ds.list_jobs().await.unwrap().is_empty());
    assert!(h.ds.list_runners().await.unwrap().is_empty());
    assert_eq!(
        h.ds.get_target(target_id).await.unwrap().status,
        TargetStatus::Err
    );
}

#[tokio::test]
async fn token_failure_retries_on_the_next_tick() {
    let h = harness(test_config());
    let target = test_target("acme/widget");
    let job = test_job(&target);
    h.ds.create_target(target).await.unwrap();
    h.ds.enqueue_job(job).await.unwrap();

    h.github.fail_tokens(true);
    h.tick_and_settle().await;
    assert_eq!(h.ds.list_jobs().await.unwrap().len(), 1);
    assert_eq!(h.provider.add_call_count(), 0);

    h.github.fail_tokens(false);
    h.tick_and_settle().await;
    assert_eq!(h.ds.list_runners().await.unwrap().len(), 1);
    assert!(h.ds.list_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn concurrent_creations_never_exceed_the_cap() {
    let mut config = test_config();
    config.max_connections_to_backend = 2;
    let h = harness(config);

    let target = test_target("acme/widget");
    h.ds.create_target(target.clone()).await.unwrap();
    for _ in 0..5 {
        h.ds.enqueue_job(test_job(&target)).await.unwrap();
    }
    h.provider.set_add_delay(Duration::from_millis(30));

    let mut remaining_ticks = 20;
    while !h.ds.list_jobs().await.unwrap().is_empty() {
        assert!(remaining_ticks > 0, "queue did not drain");
        remaining_ticks -= 1;
        h.tick_and_settle().await;
    }

    assert_eq!(h.ds.list_runners().await.unwrap().len(), 5);
    assert!(h.provider.max_concurrent_adds() <= 2);
}

#[tokio::test]
async fn a_job_whose_runner_exists_is_dropped_without_a_creation() {
    let h = harness(test_config());
    let target = test_target("acme/widget");
    let job = test_job(&target);
    let runner_id = RunnerId::from_job(job.id);
    h.ds.create_target(target.clone()).await.unwrap();
    h.ds.create_runner(Runner {
        id: runner_id,
        target_id: target.id,
        cloud_id: "vm-77".to_string(),
        shoes_type: "mock".to_string(),
        name: Runner::name_for(runner_id),
        repository_url: "https://github.com/acme/widget".to_string(),
        resource_class: ResourceClass::Nano,
        provider_url: Some(PROVIDER_URL.to_string()),
        status: RunnerStatus::Created,
        created_at: Utc::now(),
        running_since: None,
        deleted_at: None,
        deleted_reason: None,
    })
    .await
    .unwrap();
    h.ds.enqueue_job(job).await.unwrap();

    h.tick_and_settle().await;

    assert!(h.ds.list_jobs().await.unwrap().is_empty());
    assert_eq!(h.ds.list_runners().await.unwrap().len(), 1);
    assert_eq!(h.provider.add_call_count(), 0);
}

#[tokio::test]
async fn a_tick_without_the_lock_is_a_no_op() {
    let h = harness(test_config());
    let target = test_target("acme/widget");
    h.ds.create_target(target.clone()).await.unwrap();
    h.ds.enqueue_job(test_job(&target)).await.unwrap();

    // Another control-plane instance holds the lock for this tick.
    assert!(h.ds.try_acquire_lock("other-instance").await.unwrap());

    h.tick_and_settle().await;

    assert_eq!(h.ds.list_jobs().await.unwrap().len(), 1);
    assert!(h.ds.list_runners().await.unwrap().is_empty());
    assert_eq!(h.provider.add_call_count(), 0);
    assert_eq!(
        h.ds.lock_holder().await.unwrap().as_deref(),
        Some("other-instance")
    );

    // Once released, the next tick proceeds.
    h.ds.release_lock("other-instance").await.unwrap();
    h.tick_and_settle().await;
    assert_eq!(h.ds.list_runners().await.unwrap().len(), 1);
}

#[tokio::test]
async fn a_job_for_a_pending_target_stays_queued() {
    let h = harness(test_config());
    let mut target = test_target("acme/widget");
    target.status = TargetStatus::Pending;
    h.ds.create_target(target.clone()).await.unwrap();
    h.ds.enqueue_job(test_job(&target)).await.unwrap();

    h.tick_and_settle().await;

    assert_eq!(h.ds.list_jobs().await.unwrap().len(), 1);
    assert_eq!(h.provider.add_call_count(), 0);
}

#[tokio::test]
async fn cancellation_stops_workers_before_any_row_is_written() {
    let mut config = test_config();
    config.max_connections_to_backend = 10;
    let h = harness(config);

    let target = test_target("acme/widget");
    h.ds.create_target(target.clone()).await.unwrap();
    for _ in 0..10 {
        h.ds.enqueue_job(test_job(&target)).await.unwrap();
    }
    h.provider.set_add_delay(Duration::from_secs(30));

    h.starter.tick(&h.shutdown_rx).await.unwrap();
    // Let every worker reach the provider call.
    tokio::time::sleep(Duration::from_millis(50)).await;

    h.shutdown_tx.send(true).unwrap();
    let drained = tokio::time::timeout(Duration::from_secs(2), h.starter.drain()).await;
    assert!(drained.is_ok(), "workers did not observe cancellation");

    // No half-written rows: the jobs are all still queued, no runner exists.
    assert!(h.ds.list_runners().await.unwrap().is_empty());
    assert_eq!(h.ds.list_jobs().await.unwrap().len(), 10);
}

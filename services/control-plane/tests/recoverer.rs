//! Integration tests for the recoverer: the pending-run sweep with its
//! dedup rules, and the orphan sweep on both sides (unowned instances,
//! vanished runners).

use std::sync::Arc;

use chrono::{Duration, Utc};

use myshoes_control_plane::{Config, Recoverer};
use myshoes_datastore::memory::MemoryDatastore;
use myshoes_datastore::{
    Datastore, DecommissionReason, ResourceClass, Runner, RunnerId, RunnerStatus, Target,
    TargetId, TargetStatus,
};
use myshoes_github::{MockGitHubClient, WorkflowRunView};
use myshoes_provider::{Capabilities, InstanceStatus, MockProvider, ProviderRegistry, ShoesProvider};

const PROVIDER_URL: &str = "mock://local";
const SCOPE: &str = "acme/widget";
const REPO_URL: &str = "https://github.com/acme/widget";

struct Harness {
    ds: Arc<MemoryDatastore>,
    github: Arc<MockGitHubClient>,
    provider: Arc<MockProvider>,
    recoverer: Recoverer,
    target: Target,
}

async fn harness_with_provider(provider: Arc<MockProvider>) -> Harness {
    let ds = Arc::new(MemoryDatastore::new());
    let github = Arc::new(MockGitHubClient::new());

    let mut registry = ProviderRegistry::new();
    registry
        .register(PROVIDER_URL, Arc::clone(&provider) as Arc<dyn ShoesProvider>)
        .unwrap();

    let target = Target {
        id: TargetId::new(),
        scope: SCOPE.to_string(),
        ghe_domain: None,
        resource_class: ResourceClass::Nano,
        provider_url: Some(PROVIDER_URL.to_string()),
        status: TargetStatus::Active,
        status_description: None,
        token: None,
        token_expires_at: None,
        runner_user: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    ds.create_target(target.clone()).await.unwrap();

    let recoverer = Recoverer::new(
        Arc::clone(&ds) as _,
        Arc::new(registry),
        Arc::clone(&github) as _,
        Config::default(),
    );

    Harness {
        ds,
        github,
        provider,
        recoverer,
        target,
    }
}

async fn harness() -> Harness {
    harness_with_provider(Arc::new(MockProvider::new())).await
}

impl Harness {
    /// Seed a runner row so the repository shows up in the recent-activity
    /// window.
    async fn seed_runner(
        &self,
        age: Duration,
        status: RunnerStatus,
        cloud_id: &str,
    ) -> Runner {
        let id = RunnerId::new();
        let runner = Runner {
            id,
            target_id: self.target.id,
            cloud_id: cloud_id.to_string(),
            shoes_type: "mock".to_string(),
            name: Runner::name_for(id),
            repository_url: REPO_URL.to_string(),
            resource_class: ResourceClass::Nano,
            provider_url: Some(PROVIDER_URL.to_string()),
            status,
            created_at: Utc::now() - age,
            running_since: (status >= RunnerStatus::Running)
                .then(|| Utc::now() - age + Duration::minutes(1)),
            deleted_at: None,
            deleted_reason: None,
        };
        self.ds.create_runner(runner.clone()).await.unwrap();
        runner
    }

    fn report_run(&self, id: i64, status: &str, age: Duration) {
        self.github.set_workflow_runs(
            SCOPE,
            vec![WorkflowRunView {
                id,
                status: status.to_string(),
                created_at: Utc::now() - age,
            }],
        );
    }
}

#[tokio::test]
async fn a_long_waiting_run_is_enqueued_exactly_once() {
    let h = harness().await;
    // Past activity puts the repository in the sweep window; the runner is
    // long gone, so it does not suppress the enqueue.
    let old = h
        .seed_runner(Duration::hours(2), RunnerStatus::Created, "vm-old")
        .await;
    h.ds.delete_runner(old.id, Utc::now() - Duration::hours(1), DecommissionReason::JobCompleted)
        .await
        .unwrap();
    h.report_run(9001, "queued", Duration::minutes(45));

    let stats = h.recoverer.tick().await;
    assert_eq!(stats.jobs_enqueued, 1);

    let jobs = h.ds.list_jobs().await.unwrap();
    assert_eq!(jobs.len(), 1);
    let job = &jobs[0];
    assert_eq!(job.target_id, h.target.id);
    assert_eq!(job.repository, SCOPE);
    assert_eq!(job.workflow_run_id, Some(9001));

    // A second pass before the starter runs must not duplicate it.
    let stats = h.recoverer.tick().await;
    assert_eq!(stats.jobs_enqueued, 0);
    assert_eq!(h.ds.list_jobs().await.unwrap().len(), 1);
}

#[tokio::test]
async fn a_run_inside_the_race_window_is_ignored() {
    let h = harness().await;
    let old = h
        .seed_runner(Duration::hours(2), RunnerStatus::Created, "vm-old")
        .await;
    h.ds.delete_runner(old.id, Utc::now() - Duration::hours(1), DecommissionReason::JobCompleted)
        .await
        .unwrap();
    h.report_run(9001, "queued", Duration::minutes(10));

    let stats = h.recoverer.tick().await;
    assert_eq!(stats.jobs_enqueued, 0);
    assert!(h.ds.list_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn a_completed_run_is_ignored() {
    let h = harness().await;
    h.seed_runner(Duration::hours(2), RunnerStatus::Created, "vm-old")
        .await;
    h.report_run(9001, "completed", Duration::minutes(45));

    let stats = h.recoverer.tick().await;
    assert_eq!(stats.jobs_enqueued, 0);
}

#[tokio::test]
async fn an_in_flight_runner_suppresses_the_enqueue() {
    let h = harness().await;
    // This runner was created after the run appeared, so the run is (or
    // was) already being handled.
    h.seed_runner(Duration::minutes(5), RunnerStatus::Created, "vm-new")
        .await;
    h.report_run(9001, "queued", Duration::minutes(45));

    let stats = h.recoverer.tick().await;
    assert_eq!(stats.jobs_enqueued, 0);
    assert!(h.ds.list_jobs().await.unwrap().is_empty());
}

#[tokio::test]
async fn an_unowned_instance_is_deleted() {
    let h = harness().await;
    h.provider.insert_instance("vm-9", InstanceStatus::Running);

    let stats = h.recoverer.tick().await;
    assert_eq!(stats.orphans_deleted, 1);
    assert_eq!(h.provider.deleted_ids(), vec!["vm-9".to_string()]);
}

#[tokio::test]
async fn an_owned_instance_is_left_alone() {
    let h = harness().await;
    let runner = h
        .seed_runner(Duration::minutes(5), RunnerStatus::Created, "vm-1")
        .await;
    h.provider
        .insert_instance(&runner.cloud_id, InstanceStatus::Running);

    let stats = h.recoverer.tick().await;
    assert_eq!(stats.orphans_deleted, 0);
    assert!(h.provider.deleted_ids().is_empty());
}

#[tokio::test]
async fn a_vanished_running_runner_is_recovered() {
    let h = harness().await;
    // Running row, but the CI service has no such registration and the
    // provider has no such instance.
    let runner = h
        .seed_runner(Duration::hours(1), RunnerStatus::Running, "vm-3")
        .await;

    let stats = h.recoverer.tick().await;
    assert_eq!(stats.rows_recovered, 1);

    let row = h.ds.get_runner(runner.id).await.unwrap();
    assert_eq!(row.status, RunnerStatus::Deleted);
    assert_eq!(row.deleted_reason, Some(DecommissionReason::Recovered));
}

#[tokio::test]
async fn a_running_runner_with_a_live_instance_is_kept() {
    let h = harness().await;
    let runner = h
        .seed_runner(Duration::hours(1), RunnerStatus::Running, "vm-3")
        .await;
    h.provider
        .insert_instance(&runner.cloud_id, InstanceStatus::Running);

    let stats = h.recoverer.tick().await;
    assert_eq!(stats.rows_recovered, 0);
    assert_eq!(
        h.ds.get_runner(runner.id).await.unwrap().status,
        RunnerStatus::Running
    );
}

#[tokio::test]
async fn the_orphan_sweep_is_skipped_for_drivers_without_list() {
    let provider = Arc::new(MockProvider::with_capabilities(Capabilities {
        instance_status: true,
        list_instances: false,
    }));
    let h = harness_with_provider(provider).await;
    h.provider.insert_instance("vm-9", InstanceStatus::Running);

    let stats = h.recoverer.tick().await;
    assert_eq!(stats.orphans_deleted, 0);
    assert!(h.provider.deleted_ids().is_empty());
}

#[tokio::test]
async fn the_recoverer_never_touches_targets() {
    let h = harness().await;
    h.seed_runner(Duration::hours(2), RunnerStatus::Created, "vm-old")
        .await;
    h.report_run(9001, "queued", Duration::minutes(45));

    h.recoverer.tick().await;

    let target = h.ds.get_target(h.target.id).await.unwrap();
    assert_eq!(target.status, TargetStatus::Active);
    assert!(target.status_description.is_none());
    assert_eq!(h.ds.list_targets().await.unwrap().len(), 1);
}

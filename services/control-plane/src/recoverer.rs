//! Recoverer: repairs state the webhook path and the external systems let
//! drift apart.
//!
//! Two sweeps per tick. The pending-run sweep re-enqueues workflow runs
//! the CI service still reports as waiting long after a webhook should
//! have produced a job. The orphan sweep deletes provider instances no
//! runner row owns and recovers running rows whose registration and
//! instance are both gone.
//!
//! The recoverer only appends jobs and performs idempotent decommissions,
//! so it runs without the advisory lock. It never creates or mutates
//! targets.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use myshoes_datastore::{Datastore, DatastoreError, DecommissionReason, Job, JobId, RunnerStatus, Target};
use myshoes_github::{divide_scope, GitHubClient};
use myshoes_provider::{
    InstanceStatus, ProviderError, ProviderRegistry, ShoesProvider, INSTANCE_TAG,
};

use crate::config::Config;

// Repositories that hosted a runner inside this window are swept.
const RECENT_REPOSITORY_WINDOW_HOURS: i64 = 24;

// A waiting run younger than this is assumed to be racing the normal
// webhook path and left alone.
const PENDING_RUN_THRESHOLD_MINUTES: i64 = 30;

/// Per-tick accounting.
#[derive(Debug, Default, Clone)]
pub struct RecovererStats {
    pub jobs_enqueued: usize,
    pub orphans_deleted: usize,
    pub rows_recovered: usize,
}

/// The reconciliation loop against both external systems.
pub struct Recoverer {
    ds: Arc<dyn Datastore>,
    registry: Arc<ProviderRegistry>,
    github: Arc<dyn GitHubClient>,
    config: Config,
}

impl Recoverer {
    pub fn new(
        ds: Arc<dyn Datastore>,
        registry: Arc<ProviderRegistry>,
        github: Arc<dyn GitHubClient>,
        config: Config,
    ) -> Self {
        Self {
            ds,
            registry,
            github,
            config,
        }
    }

    /// Run until shutdown is signaled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.recoverer_interval.as_secs(),
            "Starting recoverer loop"
        );

        let mut interval = tokio::time::interval(self.config.recoverer_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let stats = self.tick().await;
                    if stats.jobs_enqueued > 0 || stats.orphans_deleted > 0 || stats.rows_recovered > 0 {
                        info!(
                            jobs_enqueued = stats.jobs_enqueued,
                            orphans_deleted = stats.orphans_deleted,
                            rows_recovered = stats.rows_recovered,
                            "Recovery pass complete"
                        );
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Recoverer shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One recovery pass. Public so tests drive ticks deterministically.
    pub async fn tick(&self) -> RecovererStats {
        let mut stats = RecovererStats::default();
        if let Err(e) = self.sweep_pending_runs(&mut stats).await {
            error!(error = %e, "pending-run sweep failed");
        }
        if let Err(e) = self.sweep_orphans(&mut stats).await {
            error!(error = %e, "orphan sweep failed");
        }
        stats
    }

    /// Re-enqueue workflow runs that have been waiting past the threshold.
    async fn sweep_pending_runs(&self, stats: &mut RecovererStats) -> Result<(), DatastoreError> {
        let since = Utc::now() - Duration::hours(RECENT_REPOSITORY_WINDOW_HOURS);
        let mut recent = self.ds.list_runners_logged_since(since).await?;
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        // Deduplicate repositories, newest activity first.
        let mut repositories: Vec<String> = Vec::new();
        for runner in &recent {
            if !repositories.contains(&runner.repository_url) {
                repositories.push(runner.repository_url.clone());
            }
        }

        let jobs = self.ds.list_jobs().await?;
        let live_runners = self.ds.list_runners().await?;

        for repository_url in repositories {
            let Some((ghe_domain, full_name)) = parse_repository_url(&repository_url) else {
                warn!(url = %repository_url, "unparsable repository url in runner log");
                continue;
            };
            let Some(target) = self.find_target(ghe_domain.as_deref(), &full_name).await else {
                warn!(repository = %full_name, "no target for recently active repository");
                continue;
            };

            let (owner, repo) = divide_scope(&full_name);
            let runs = match self.github.list_workflow_runs(owner, repo).await {
                Ok(runs) => runs,
                Err(e) => {
                    warn!(repository = %full_name, error = %e, "failed to list workflow runs");
                    continue;
                }
            };

            let now = Utc::now();
            for run in runs {
                if !run.is_waiting() {
                    continue;
                }
                if now - run.created_at < Duration::minutes(PENDING_RUN_THRESHOLD_MINUTES) {
                    debug!(run_id = run.id, "run is waiting but still inside the webhook race window");
                    continue;
                }
                let already_queued = jobs
                    .iter()
                    .any(|j| j.target_id == target.id && j.workflow_run_id == Some(run.id));
                if already_queued {
                    continue;
                }
                // A runner created after the run appeared is (or was) about
                // to pick it up; re-enqueueing would double-provision.
                let in_flight = live_runners
                    .iter()
                    .any(|r| r.repository_url == repository_url && r.created_at > run.created_at);
                if in_flight {
                    debug!(run_id = run.id, "a newer runner exists for this repository, not re-enqueueing");
                    continue;
                }

                info!(
                    run_id = run.id,
                    repository = %full_name,
                    "re-enqueueing workflow run waiting past threshold"
                );
                self.ds
                    .enqueue_job(Job {
                        id: JobId::new(),
                        target_id: target.id,
                        ghe_domain: target.ghe_domain.clone(),
                        repository: full_name.clone(),
                        payload: serde_json::json!({
                            "recovered": true,
                            "workflow_run": {
                                "id": run.id,
                                "status": run.status,
                                "created_at": run.created_at,
                            },
                            "repository": { "full_name": full_name },
                        }),
                        check_run_id: None,
                        workflow_run_id: Some(run.id),
                        created_at: Utc::now(),
                    })
                    .await?;
                stats.jobs_enqueued += 1;
            }
        }

        Ok(())
    }

    /// Delete unowned instances; recover rows whose runner vanished.
    async fn sweep_orphans(&self, stats: &mut RecovererStats) -> Result<(), DatastoreError> {
        let live_runners = self.ds.list_runners().await?;
        let targets = self.ds.list_targets().await?;

        // Instances tagged ours that no live row owns.
        let mut swept_drivers: HashSet<String> = HashSet::new();
        for target in &targets {
            let Some(provider_url) = target.provider_url.as_deref() else {
                continue;
            };
            if !swept_drivers.insert(provider_url.to_string()) {
                continue;
            }
            let Some(provider) = self.registry.get(provider_url) else {
                continue;
            };
            if !provider.capabilities().list_instances {
                debug!(provider_url, "driver does not list instances, skipping orphan sweep");
                continue;
            }

            let instances = match provider.list_instances(INSTANCE_TAG).await {
                Ok(instances) => instances,
                Err(e) => {
                    warn!(provider_url, error = %e, "failed to list instances");
                    continue;
                }
            };

            for instance in instances {
                if live_runners.iter().any(|r| r.cloud_id == instance.cloud_id) {
                    continue;
                }
                info!(cloud_id = %instance.cloud_id, provider_url, "deleting orphaned instance");
                match provider.delete_instance(&instance.cloud_id).await {
                    Ok(()) | Err(ProviderError::NotFound(_)) => stats.orphans_deleted += 1,
                    Err(e) => {
                        warn!(cloud_id = %instance.cloud_id, error = %e, "failed to delete orphaned instance");
                    }
                }
            }
        }

        // Running rows whose registration and instance are both gone.
        for target in &targets {
            let registered: HashSet<String> = match self.github.list_runners(&target.scope).await {
                Ok(views) => views.into_iter().map(|v| v.name).collect(),
                Err(e) => {
                    warn!(scope = %target.scope, error = %e, "failed to list CI registrations");
                    continue;
                }
            };
            let provider = target
                .provider_url
                .as_deref()
                .and_then(|url| self.registry.get(url));

            for runner in self.ds.list_runners_by_target(target.id).await? {
                if runner.status != RunnerStatus::Running {
                    continue;
                }
                if registered.contains(&runner.name) {
                    continue;
                }
                let Some(provider) = &provider else { continue };
                if !provider.capabilities().instance_status {
                    continue;
                }
                match provider.get_instance_status(&runner.cloud_id).await {
                    Ok(InstanceStatus::Missing) => {
                        info!(
                            runner_id = %runner.id,
                            "registration and instance both gone, recovering row"
                        );
                        self.ds
                            .delete_runner(runner.id, Utc::now(), DecommissionReason::Recovered)
                            .await?;
                        stats.rows_recovered += 1;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(runner_id = %runner.id, error = %e, "failed to query instance status");
                    }
                }
            }
        }

        Ok(())
    }

    /// Resolve the target owning a repository: the repo scope first, the
    /// owner scope as fallback.
    async fn find_target(&self, ghe_domain: Option<&str>, full_name: &str) -> Option<Target> {
        match self.ds.get_target_by_scope(ghe_domain, full_name).await {
            Ok(target) => return Some(target),
            Err(DatastoreError::NotFound) => {}
            Err(e) => {
                warn!(repository = %full_name, error = %e, "target lookup failed");
                return None;
            }
        }
        let (owner, _) = divide_scope(full_name);
        self.ds.get_target_by_scope(ghe_domain, owner).await.ok()
    }
}

/// Split a repository URL into its CI domain (None for the default host)
/// and full name.
fn parse_repository_url(url: &str) -> Option<(Option<String>, String)> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))?;
    let (host, path) = rest.split_once('/')?;
    let full_name = path.trim_matches('/');
    if host.is_empty() || full_name.is_empty() {
        return None;
    }
    let ghe_domain = (host != "github.com").then(|| host.to_string());
    Some((ghe_domain, full_name.to_string()))
}

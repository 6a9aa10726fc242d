//! Runner manager: detects completed and expired runners and
//! decommissions them.
//!
//! Decommission predicates, evaluated in order with the first match
//! recorded as the soft-delete reason:
//! 1. the CI service reports the registration offline after the runner had
//!    been online (the job ran to completion),
//! 2. the provider reports the instance stopped or missing,
//! 3. the runner never came online within `must_running_time`,
//! 4. the runner has been online longer than `must_goal_time`.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use myshoes_datastore::{
    Datastore, DatastoreError, DecommissionReason, Runner, RunnerStatus, Target,
};
use myshoes_github::{GitHubClient, GitHubError, RunnerView};
use myshoes_provider::{InstanceStatus, ProviderError, ProviderRegistry, ShoesProvider};

use crate::config::Config;
use crate::metrics;

const LOCK_HOLDER: &str = "runner-manager";

// Per-call deadline on the provider, distinct from the root shutdown path.
const PROVIDER_DEADLINE: std::time::Duration = std::time::Duration::from_secs(30);

/// Errors surfaced from a manager tick.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("datastore error: {0}")]
    Datastore(#[from] DatastoreError),
}

/// Per-tick accounting.
#[derive(Debug, Default, Clone)]
pub struct ManagerStats {
    pub inspected: usize,
    pub promoted: usize,
    pub decommissioned: usize,
    pub failed: usize,
}

/// The reclamation loop.
pub struct RunnerManager {
    ds: Arc<dyn Datastore>,
    registry: Arc<ProviderRegistry>,
    github: Arc<dyn GitHubClient>,
    config: Config,
    delete_permits: Arc<Semaphore>,
}

impl RunnerManager {
    pub fn new(
        ds: Arc<dyn Datastore>,
        registry: Arc<ProviderRegistry>,
        github: Arc<dyn GitHubClient>,
        config: Config,
    ) -> Self {
        let delete_permits = Arc::new(Semaphore::new(config.max_concurrency_deleting));
        Self {
            ds,
            registry,
            github,
            config,
            delete_permits,
        }
    }

    /// Run until shutdown is signaled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.manager_interval.as_secs(),
            max_concurrency_deleting = self.config.max_concurrency_deleting,
            "Starting runner manager loop"
        );

        let mut interval = tokio::time::interval(self.config.manager_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.tick().await {
                        Ok(stats) if stats.decommissioned > 0 || stats.failed > 0 => {
                            info!(
                                inspected = stats.inspected,
                                promoted = stats.promoted,
                                decommissioned = stats.decommissioned,
                                failed = stats.failed,
                                "Runner reconciliation complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Runner manager tick failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Runner manager shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One reconciliation pass over every non-deleted runner. Public so
    /// tests drive ticks deterministically.
    pub async fn tick(&self) -> Result<ManagerStats, ManagerError> {
        let mut stats = ManagerStats::default();

        if !self.ds.try_acquire_lock(LOCK_HOLDER).await? {
            debug!("another instance holds the lock, skipping tick");
            return Ok(stats);
        }
        let result = self.reconcile(&mut stats).await;
        self.ds.release_lock(LOCK_HOLDER).await?;
        result?;
        Ok(stats)
    }

    async fn reconcile(&self, stats: &mut ManagerStats) -> Result<(), ManagerError> {
        let targets = self.ds.list_targets().await?;
        let mut workers: JoinSet<bool> = JoinSet::new();

        for target in targets {
            let registrations = match self.github.list_runners(&target.scope).await {
                Ok(views) => views
                    .into_iter()
                    .map(|v| (v.name.clone(), v))
                    .collect::<HashMap<_, _>>(),
                Err(e) => {
                    warn!(scope = %target.scope, error = %e, "failed to list CI registrations, skipping target this tick");
                    continue;
                }
            };

            let provider = target
                .provider_url
                .as_deref()
                .and_then(|url| self.registry.get(url));

            for runner in self.ds.list_runners_by_target(target.id).await? {
                stats.inspected += 1;
                let view = registrations.get(&runner.name);

                let runner = if runner.status == RunnerStatus::Created
                    && view.is_some_and(|v| v.online)
                {
                    self.ds
                        .update_runner_status(runner.id, RunnerStatus::Running)
                        .await?;
                    stats.promoted += 1;
                    self.ds.get_runner(runner.id).await?
                } else {
                    runner
                };

                let Some(reason) = self.decide(&runner, view, provider.as_ref()).await else {
                    continue;
                };

                // Excess candidates wait here until a deleter finishes.
                let Ok(permit) = Arc::clone(&self.delete_permits).acquire_owned().await else {
                    break;
                };
                metrics::CONCURRENCY_DELETING.fetch_add(1, Ordering::SeqCst);

                let ds = Arc::clone(&self.ds);
                let github = Arc::clone(&self.github);
                let provider = provider.clone();
                let target = target.clone();
                workers.spawn(async move {
                    let ok = decommission(ds, github, provider, &target, &runner, reason).await;
                    metrics::CONCURRENCY_DELETING.fetch_sub(1, Ordering::SeqCst);
                    drop(permit);
                    ok
                });
            }
        }

        while let Some(result) = workers.join_next().await {
            match result {
                Ok(true) => stats.decommissioned += 1,
                Ok(false) => stats.failed += 1,
                Err(e) => {
                    error!(error = %e, "decommission worker panicked");
                    stats.failed += 1;
                }
            }
        }

        Ok(())
    }

    /// First matching predicate wins.
    async fn decide(
        &self,
        runner: &Runner,
        view: Option<&RunnerView>,
        provider: Option<&Arc<dyn ShoesProvider>>,
    ) -> Option<DecommissionReason> {
        let now = Utc::now();

        // 1. Offline after having been online: the single job completed.
        if let Some(view) = view {
            if !view.online && !view.busy && runner.running_since.is_some() {
                return Some(DecommissionReason::JobCompleted);
            }
        }

        // 2. The instance is gone at the provider.
        if let Some(provider) = provider {
            if provider.capabilities().instance_status {
                match provider.get_instance_status(&runner.cloud_id).await {
                    Ok(InstanceStatus::Stopped | InstanceStatus::Missing) => {
                        return Some(DecommissionReason::InstanceGone);
                    }
                    Ok(InstanceStatus::Running) => {}
                    Err(e) => {
                        warn!(runner_id = %runner.id, error = %e, "failed to query instance status");
                    }
                }
            }
        }

        // 3. Created but never reported online.
        if runner.status == RunnerStatus::Created && runner.running_since.is_none() {
            let stuck = (now - runner.created_at)
                .to_std()
                .map(|age| age > self.config.must_running_time)
                .unwrap_or(false);
            if stuck {
                return Some(DecommissionReason::ExceededMustRunningTime);
            }
        }

        // 4. Online too long, even if the CI service still reports it.
        if let Some(since) = runner.running_since {
            let hung = (now - since)
                .to_std()
                .map(|age| age > self.config.must_goal_time)
                .unwrap_or(false);
            if hung {
                return Some(DecommissionReason::ExceededMustGoalTime);
            }
        }

        None
    }
}

/// The three-step decommission procedure. Steps 1 and 2 tolerate
/// already-gone; any other failure aborts before the row is touched so the
/// next tick retries the whole procedure.
async fn decommission(
    ds: Arc<dyn Datastore>,
    github: Arc<dyn GitHubClient>,
    provider: Option<Arc<dyn ShoesProvider>>,
    target: &Target,
    runner: &Runner,
    reason: DecommissionReason,
) -> bool {
    match github.remove_runner(&target.scope, &runner.name).await {
        Ok(()) | Err(GitHubError::NotFound) => {}
        Err(e) => {
            warn!(
                runner_id = %runner.id,
                scope = %target.scope,
                error = %e,
                "failed to remove CI registration, will retry"
            );
            return false;
        }
    }

    let Some(provider) = provider else {
        warn!(
            runner_id = %runner.id,
            provider_url = target.provider_url.as_deref().unwrap_or("(unset)"),
            "no driver registered, cannot delete instance"
        );
        return false;
    };
    let deleted = match tokio::time::timeout(
        PROVIDER_DEADLINE,
        provider.delete_instance(&runner.cloud_id),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Unavailable(format!(
            "delete_instance exceeded the {}s deadline",
            PROVIDER_DEADLINE.as_secs()
        ))),
    };
    match deleted {
        Ok(()) | Err(ProviderError::NotFound(_)) => {}
        Err(e) => {
            warn!(
                runner_id = %runner.id,
                cloud_id = %runner.cloud_id,
                error = %e,
                "failed to delete instance, will retry"
            );
            return false;
        }
    }

    if let Err(e) = ds.delete_runner(runner.id, Utc::now(), reason).await {
        error!(runner_id = %runner.id, error = %e, "failed to soft-delete runner row");
        return false;
    }

    info!(
        runner_id = %runner.id,
        cloud_id = %runner.cloud_id,
        reason = reason.as_str(),
        "runner decommissioned"
    );
    true
}

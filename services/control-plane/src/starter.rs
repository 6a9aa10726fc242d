//! Starter: drains the job queue and creates runners.
//!
//! Admission invariants:
//! - at most `max_connections_to_backend` creations in flight at once,
//! - at most one active creation per job id,
//! - no creation without the advisory lock for that tick.

use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};

use myshoes_datastore::{
    Datastore, DatastoreError, Job, JobId, Runner, RunnerId, RunnerStatus, Target, TargetStatus,
};
use myshoes_github::{GitHubClient, GitHubError};
use myshoes_provider::{AddInstanceRequest, ProviderError, ProviderRegistry, ShoesProvider};

use crate::config::Config;
use crate::metrics;
use crate::setup_script::{self, SetupParams};

const LOCK_HOLDER: &str = "starter";

// Target status descriptions land in a bounded column.
const MAX_STATUS_DESCRIPTION: usize = 255;

// Per-call deadline on the provider, distinct from the root shutdown path.
const PROVIDER_DEADLINE: Duration = Duration::from_secs(30);

/// Errors surfaced from a starter tick.
#[derive(Debug, thiserror::Error)]
pub enum StarterError {
    #[error("datastore error: {0}")]
    Datastore(#[from] DatastoreError),
}

/// Why a worker stopped without creating a runner.
#[derive(Debug, thiserror::Error)]
enum WorkerError {
    #[error("shutdown observed")]
    Canceled,

    #[error("registration token unavailable: {0}")]
    Token(#[source] GitHubError),

    #[error("no provider driver registered for {0}")]
    NoDriver(String),

    #[error("provider failed: {0}")]
    Provider(#[source] ProviderError),

    #[error("datastore error: {0}")]
    Datastore(#[from] DatastoreError),
}

/// The job-queue drain loop.
pub struct Starter {
    ds: Arc<dyn Datastore>,
    registry: Arc<ProviderRegistry>,
    github: Arc<dyn GitHubClient>,
    config: Config,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<JobId>>>,
}

impl Starter {
    pub fn new(
        ds: Arc<dyn Datastore>,
        registry: Arc<ProviderRegistry>,
        github: Arc<dyn GitHubClient>,
        config: Config,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_connections_to_backend));
        Self {
            ds,
            registry,
            github,
            config,
            permits,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run until shutdown is signaled, then wait for in-flight workers up
    /// to the shutdown grace period.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.starter_interval.as_millis() as u64,
            max_running = self.config.max_connections_to_backend,
            "Starting starter loop"
        );

        let mut interval = tokio::time::interval(self.config.starter_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(&shutdown).await {
                        error!(error = %e, "Starter tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Starter shutting down");
                        break;
                    }
                }
            }
        }

        self.drain().await;
    }

    /// One scheduling pass. Public so tests drive ticks deterministically.
    pub async fn tick(&self, shutdown: &watch::Receiver<bool>) -> Result<(), StarterError> {
        if !self.ds.try_acquire_lock(LOCK_HOLDER).await? {
            debug!("another instance holds the lock, skipping tick");
            return Ok(());
        }
        let result = self.dispatch(shutdown).await;
        self.ds.release_lock(LOCK_HOLDER).await?;
        result
    }

    /// Wait for in-flight workers, bounded by the shutdown grace period.
    pub async fn drain(&self) {
        let cap = self.config.max_connections_to_backend;
        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;

        while self.permits.available_permits() < cap {
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    still_running = (cap - self.permits.available_permits()) as u64,
                    "Shutdown grace elapsed with workers still in flight"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    async fn dispatch(&self, shutdown: &watch::Receiver<bool>) -> Result<(), StarterError> {
        let jobs = self.ds.list_jobs().await?;
        let pending: Vec<Job> = {
            let in_flight = self.in_flight.lock().expect("in-flight set poisoned");
            jobs.into_iter()
                .filter(|job| !in_flight.contains(&job.id))
                .collect()
        };
        metrics::COUNT_WAITING.store(pending.len() as i64, Ordering::SeqCst);

        for job in pending {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                // Cap reached: everything after this stays queued, in order,
                // for the next tick.
                break;
            };

            self.in_flight
                .lock()
                .expect("in-flight set poisoned")
                .insert(job.id);
            metrics::COUNT_RUNNING.fetch_add(1, Ordering::SeqCst);
            metrics::COUNT_WAITING.fetch_sub(1, Ordering::SeqCst);

            let worker = Worker {
                ds: Arc::clone(&self.ds),
                registry: Arc::clone(&self.registry),
                github: Arc::clone(&self.github),
                config: self.config.clone(),
            };
            let in_flight = Arc::clone(&self.in_flight);
            let mut shutdown = shutdown.clone();
            let job_id = job.id;

            tokio::spawn(async move {
                match worker.process(job, &mut shutdown).await {
                    Ok(()) => {}
                    Err(WorkerError::Canceled) => {
                        debug!(job_id = %job_id, "worker canceled by shutdown");
                    }
                    Err(e @ (WorkerError::Token(_)
                    | WorkerError::NoDriver(_)
                    | WorkerError::Provider(_))) => {
                        warn!(job_id = %job_id, error = %e, "runner creation failed, job stays queued");
                    }
                    Err(e @ WorkerError::Datastore(_)) => {
                        error!(job_id = %job_id, error = %e, "worker failed on datastore access");
                    }
                }

                in_flight
                    .lock()
                    .expect("in-flight set poisoned")
                    .remove(&job_id);
                metrics::COUNT_RUNNING.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
            });
        }

        Ok(())
    }
}

/// One runner creation.
struct Worker {
    ds: Arc<dyn Datastore>,
    registry: Arc<ProviderRegistry>,
    github: Arc<dyn GitHubClient>,
    config: Config,
}

impl Worker {
    async fn process(
        &self,
        job: Job,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), WorkerError> {
        let runner_id = RunnerId::from_job(job.id);

        // A runner already exists for this job id: the enqueue was a
        // duplicate, drop it.
        if self.ds.get_runner(runner_id).await.is_ok() {
            info!(job_id = %job.id, runner_id = %runner_id, "runner already exists for job, dropping duplicate");
            self.ds.delete_job(job.id).await?;
            return Ok(());
        }

        let target = match self.ds.get_target(job.target_id).await {
            Ok(target) => target,
            Err(DatastoreError::NotFound) => {
                error!(job_id = %job.id, target_id = %job.target_id, "job references a missing target");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match target.status {
            // `err` stays schedulable so a target marked by a transient
            // provider failure heals on the successful retry.
            TargetStatus::Active | TargetStatus::Err => {}
            status => {
                debug!(
                    job_id = %job.id,
                    scope = %target.scope,
                    status = status.as_str(),
                    "target is not schedulable, leaving job queued"
                );
                return Ok(());
            }
        }

        let token = self
            .github
            .create_registration_token(&target.scope)
            .await
            .map_err(WorkerError::Token)?;

        let Some(provider) = target
            .provider_url
            .as_deref()
            .and_then(|url| self.registry.get(url))
        else {
            let url = target
                .provider_url
                .clone()
                .unwrap_or_else(|| "(unset)".to_string());
            self.mark_target_err(&target, &format!("no provider driver registered for {url}"))
                .await?;
            return Err(WorkerError::NoDriver(url));
        };

        let runner_name = Runner::name_for(runner_id);
        let scope_url = scope_url(&target);
        let labels = vec![
            "myshoes".to_string(),
            target.resource_class.as_str().to_string(),
        ];
        let setup_script = setup_script::render(&SetupParams {
            runner_name: &runner_name,
            scope_url: &scope_url,
            token: &token.token,
            runner_user: target.runner_user.as_deref(),
            runner_version: &self.config.runner_version,
            labels: &labels,
        });

        let request = AddInstanceRequest {
            runner_name: runner_name.clone(),
            resource_class: target.resource_class.as_str().to_string(),
            setup_script,
        };

        let created = tokio::select! {
            // Observing shutdown mid-call: stop before any row is written.
            // An instance the provider may still create becomes the orphan
            // sweep's business.
            _ = shutdown.changed() => return Err(WorkerError::Canceled),
            result = add_instance_with_deadline(provider.as_ref(), &request) => match result {
                Ok(created) => created,
                Err(e) => {
                    self.mark_target_err(&target, &e.to_string()).await?;
                    if e.is_terminal() {
                        error!(
                            job_id = %job.id,
                            scope = %target.scope,
                            error = %e,
                            "terminal provider failure, dropping job"
                        );
                        self.ds.delete_job(job.id).await?;
                        return Ok(());
                    }
                    return Err(WorkerError::Provider(e));
                }
            }
        };

        let runner = Runner {
            id: runner_id,
            target_id: target.id,
            cloud_id: created.cloud_id,
            shoes_type: created.shoes_type,
            name: runner_name,
            repository_url: repository_url(&target, &job),
            resource_class: target.resource_class,
            provider_url: target.provider_url.clone(),
            status: RunnerStatus::Created,
            created_at: Utc::now(),
            running_since: None,
            deleted_at: None,
            deleted_reason: None,
        };
        self.ds.create_runner(runner).await?;
        self.ds.delete_job(job.id).await?;

        if target.status == TargetStatus::Err {
            self.ds
                .update_target_status(target.id, TargetStatus::Active, None)
                .await?;
        }

        info!(
            job_id = %job.id,
            runner_id = %runner_id,
            scope = %target.scope,
            "runner created"
        );
        Ok(())
    }

    async fn mark_target_err(
        &self,
        target: &Target,
        description: &str,
    ) -> Result<(), DatastoreError> {
        let truncated = truncate(description, MAX_STATUS_DESCRIPTION);
        self.ds
            .update_target_status(target.id, TargetStatus::Err, Some(&truncated))
            .await
    }
}

async fn add_instance_with_deadline(
    provider: &dyn ShoesProvider,
    request: &AddInstanceRequest,
) -> Result<myshoes_provider::CreatedInstance, ProviderError> {
    match tokio::time::timeout(PROVIDER_DEADLINE, provider.add_instance(request)).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Unavailable(format!(
            "add_instance exceeded the {}s deadline",
            PROVIDER_DEADLINE.as_secs()
        ))),
    }
}

fn host(target: &Target) -> &str {
    target.ghe_domain.as_deref().unwrap_or("github.com")
}

fn scope_url(target: &Target) -> String {
    format!("https://{}/{}", host(target), target.scope)
}

fn repository_url(target: &Target, job: &Job) -> String {
    format!("https://{}/{}", host(target), job.repository)
}

fn truncate(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_is_char_safe() {
        assert_eq!(truncate("abcdef", 3), "abc");
        assert_eq!(truncate("ab", 3), "ab");
        // Multi-byte input must not split a character.
        assert_eq!(truncate("ééééé", 3), "ééé");
    }

    #[test]
    fn urls_honor_the_ci_domain() {
        let mut target = Target {
            id: myshoes_datastore::TargetId::new(),
            scope: "acme/widget".to_string(),
            ghe_domain: None,
            resource_class: myshoes_datastore::ResourceClass::Nano,
            provider_url: None,
            status: TargetStatus::Active,
            status_description: None,
            token: None,
            token_expires_at: None,
            runner_user: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(scope_url(&target), "https://github.com/acme/widget");

        target.ghe_domain = Some("ghe.example.com".to_string());
        assert_eq!(scope_url(&target), "https://ghe.example.com/acme/widget");
    }
}

//! In-memory datastore backend.
//!
//! Process-local maps behind an `RwLock`. Keys are ULID-based ids, so a
//! `BTreeMap` iterates in creation order and the job queue is naturally
//! FIFO. The advisory lock is a real exclusive token even though a single
//! process never contends with itself, so multi-instance coordination is
//! observable in tests.

use std::collections::BTreeMap;
use std::sync::{Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entity::{DecommissionReason, Job, ResourceClass, Runner, RunnerStatus, Target, TargetStatus};
use crate::error::DatastoreError;
use crate::ids::{JobId, RunnerId, TargetId};
use crate::Datastore;

#[derive(Default)]
struct Inner {
    targets: BTreeMap<TargetId, Target>,
    jobs: BTreeMap<JobId, Job>,
    runners: BTreeMap<RunnerId, Runner>,
}

/// In-memory implementation of [`Datastore`].
#[derive(Default)]
pub struct MemoryDatastore {
    inner: RwLock<Inner>,
    lock: Mutex<Option<String>>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("memory datastore poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("memory datastore poisoned")
    }
}

#[async_trait]
impl Datastore for MemoryDatastore {
    async fn create_target(&self, target: Target) -> Result<(), DatastoreError> {
        let mut inner = self.write();
        let duplicate = inner.targets.values().any(|t| {
            t.status != TargetStatus::Deleted
                && t.scope == target.scope
                && t.ghe_domain == target.ghe_domain
        });
        if duplicate {
            return Err(DatastoreError::AlreadyExists(target.scope));
        }
        inner.targets.insert(target.id, target);
        Ok(())
    }

    async fn get_target(&self, id: TargetId) -> Result<Target, DatastoreError> {
        self.read()
            .targets
            .get(&id)
            .cloned()
            .ok_or(DatastoreError::NotFound)
    }

    async fn get_target_by_scope(
        &self,
        ghe_domain: Option<&str>,
        scope: &str,
    ) -> Result<Target, DatastoreError> {
        self.read()
            .targets
            .values()
            .find(|t| {
                t.status != TargetStatus::Deleted
                    && t.scope == scope
                    && t.ghe_domain.as_deref() == ghe_domain
            })
            .cloned()
            .ok_or(DatastoreError::NotFound)
    }

    async fn list_targets(&self) -> Result<Vec<Target>, DatastoreError> {
        Ok(self
            .read()
            .targets
            .values()
            .filter(|t| t.status != TargetStatus::Deleted)
            .cloned()
            .collect())
    }

    async fn delete_target(&self, id: TargetId) -> Result<(), DatastoreError> {
        let mut inner = self.write();
        match inner.targets.get_mut(&id) {
            Some(target) => {
                target.status = TargetStatus::Deleted;
                target.updated_at = Utc::now();
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn update_target_status(
        &self,
        id: TargetId,
        status: TargetStatus,
        description: Option<&str>,
    ) -> Result<(), DatastoreError> {
        let mut inner = self.write();
        let target = inner.targets.get_mut(&id).ok_or(DatastoreError::NotFound)?;
        target.status = status;
        target.status_description = description.map(str::to_string);
        target.updated_at = Utc::now();
        Ok(())
    }

    async fn update_target_token(
        &self,
        id: TargetId,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatastoreError> {
        let mut inner = self.write();
        let target = inner.targets.get_mut(&id).ok_or(DatastoreError::NotFound)?;
        target.token = Some(token.to_string());
        target.token_expires_at = Some(expires_at);
        target.updated_at = Utc::now();
        Ok(())
    }

    async fn update_target_param(
        &self,
        id: TargetId,
        resource_class: ResourceClass,
        provider_url: Option<&str>,
    ) -> Result<(), DatastoreError> {
        let mut inner = self.write();
        let target = inner.targets.get_mut(&id).ok_or(DatastoreError::NotFound)?;
        target.resource_class = resource_class;
        target.provider_url = provider_url.map(str::to_string);
        target.updated_at = Utc::now();
        Ok(())
    }

    async fn enqueue_job(&self, job: Job) -> Result<(), DatastoreError> {
        self.write().jobs.insert(job.id, job);
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, DatastoreError> {
        // BTreeMap over ULID keys: oldest first.
        Ok(self.read().jobs.values().cloned().collect())
    }

    async fn delete_job(&self, id: JobId) -> Result<(), DatastoreError> {
        self.write().jobs.remove(&id);
        Ok(())
    }

    async fn create_runner(&self, runner: Runner) -> Result<(), DatastoreError> {
        let mut inner = self.write();
        if inner.runners.contains_key(&runner.id) {
            return Err(DatastoreError::AlreadyExists(runner.id.to_string()));
        }
        inner.runners.insert(runner.id, runner);
        Ok(())
    }

    async fn list_runners(&self) -> Result<Vec<Runner>, DatastoreError> {
        Ok(self
            .read()
            .runners
            .values()
            .filter(|r| !r.is_deleted())
            .cloned()
            .collect())
    }

    async fn list_runners_by_target(
        &self,
        target_id: TargetId,
    ) -> Result<Vec<Runner>, DatastoreError> {
        Ok(self
            .read()
            .runners
            .values()
            .filter(|r| r.target_id == target_id && !r.is_deleted())
            .cloned()
            .collect())
    }

    async fn list_runners_logged_until(
        &self,
        until: DateTime<Utc>,
    ) -> Result<Vec<Runner>, DatastoreError> {
        Ok(self
            .read()
            .runners
            .values()
            .filter(|r| r.created_at < until)
            .cloned()
            .collect())
    }

    async fn list_runners_logged_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Runner>, DatastoreError> {
        Ok(self
            .read()
            .runners
            .values()
            .filter(|r| r.created_at > since)
            .cloned()
            .collect())
    }

    async fn get_runner(&self, id: RunnerId) -> Result<Runner, DatastoreError> {
        self.read()
            .runners
            .get(&id)
            .cloned()
            .ok_or(DatastoreError::NotFound)
    }

    async fn update_runner_status(
        &self,
        id: RunnerId,
        status: RunnerStatus,
    ) -> Result<(), DatastoreError> {
        let mut inner = self.write();
        let runner = inner.runners.get_mut(&id).ok_or(DatastoreError::NotFound)?;
        // Monotonic: ignore anything that would move the runner backwards
        // or out of deleted.
        if status <= runner.status {
            return Ok(());
        }
        if runner.status == RunnerStatus::Created && status == RunnerStatus::Running {
            runner.running_since = Some(Utc::now());
        }
        runner.status = status;
        Ok(())
    }

    async fn delete_runner(
        &self,
        id: RunnerId,
        deleted_at: DateTime<Utc>,
        reason: DecommissionReason,
    ) -> Result<(), DatastoreError> {
        let mut inner = self.write();
        let Some(runner) = inner.runners.get_mut(&id) else {
            return Ok(());
        };
        if runner.is_deleted() {
            return Ok(());
        }
        runner.status = RunnerStatus::Deleted;
        runner.deleted_at = Some(deleted_at);
        runner.deleted_reason = Some(reason);
        Ok(())
    }

    async fn try_acquire_lock(&self, holder: &str) -> Result<bool, DatastoreError> {
        let mut lock = self.lock.lock().expect("lock poisoned");
        match lock.as_deref() {
            None => {
                *lock = Some(holder.to_string());
                Ok(true)
            }
            Some(current) => Ok(current == holder),
        }
    }

    async fn release_lock(&self, holder: &str) -> Result<(), DatastoreError> {
        let mut lock = self.lock.lock().expect("lock poisoned");
        if lock.as_deref() == Some(holder) {
            *lock = None;
        }
        Ok(())
    }

    async fn lock_holder(&self) -> Result<Option<String>, DatastoreError> {
        Ok(self.lock.lock().expect("lock poisoned").clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_target(scope: &str) -> Target {
        Target {
            id: TargetId::new(),
            scope: scope.to_string(),
            ghe_domain: None,
            resource_class: ResourceClass::Nano,
            provider_url: Some("mock://local".to_string()),
            status: TargetStatus::Active,
            status_description: None,
            token: None,
            token_expires_at: None,
            runner_user: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn test_runner(target_id: TargetId) -> Runner {
        let id = RunnerId::new();
        Runner {
            id,
            target_id,
            cloud_id: "vm-1".to_string(),
            shoes_type: "mock".to_string(),
            name: Runner::name_for(id),
            repository_url: "https://github.com/acme/widget".to_string(),
            resource_class: ResourceClass::Nano,
            provider_url: Some("mock://local".to_string()),
            status: RunnerStatus::Created,
            created_at: Utc::now(),
            running_since: None,
            deleted_at: None,
            deleted_reason: None,
        }
    }

    #[tokio::test]
    async fn target_crud() {
        let ds = MemoryDatastore::new();
        let target = test_target("acme/widget");
        let id = target.id;
        ds.create_target(target).await.unwrap();

        let fetched = ds.get_target(id).await.unwrap();
        assert_eq!(fetched.scope, "acme/widget");

        let by_scope = ds.get_target_by_scope(None, "acme/widget").await.unwrap();
        assert_eq!(by_scope.id, id);
        assert!(matches!(
            ds.get_target_by_scope(Some("ghe.example.com"), "acme/widget")
                .await,
            Err(DatastoreError::NotFound)
        ));

        ds.update_target_status(id, TargetStatus::Err, Some("provider down"))
            .await
            .unwrap();
        let fetched = ds.get_target(id).await.unwrap();
        assert_eq!(fetched.status, TargetStatus::Err);
        assert_eq!(fetched.status_description.as_deref(), Some("provider down"));

        ds.delete_target(id).await.unwrap();
        assert!(ds.list_targets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn target_token_and_param_updates() {
        let ds = MemoryDatastore::new();
        let target = test_target("acme/widget");
        let id = target.id;
        ds.create_target(target).await.unwrap();

        let expires = Utc::now() + chrono::Duration::minutes(59);
        ds.update_target_token(id, "ghs_abc", expires).await.unwrap();
        let fetched = ds.get_target(id).await.unwrap();
        assert_eq!(fetched.token.as_deref(), Some("ghs_abc"));
        assert_eq!(fetched.token_expires_at, Some(expires));

        ds.update_target_param(id, ResourceClass::Large, Some("aws://us-east-1"))
            .await
            .unwrap();
        let fetched = ds.get_target(id).await.unwrap();
        assert_eq!(fetched.resource_class, ResourceClass::Large);
        assert_eq!(fetched.provider_url.as_deref(), Some("aws://us-east-1"));

        // Updates to unknown targets surface as not-found.
        assert!(matches!(
            ds.update_target_token(TargetId::new(), "x", expires).await,
            Err(DatastoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn duplicate_scope_rejected() {
        let ds = MemoryDatastore::new();
        ds.create_target(test_target("acme/widget")).await.unwrap();
        let result = ds.create_target(test_target("acme/widget")).await;
        assert!(matches!(result, Err(DatastoreError::AlreadyExists(_))));

        // A different CI host is a different target.
        let mut ghe = test_target("acme/widget");
        ghe.ghe_domain = Some("ghe.example.com".to_string());
        ds.create_target(ghe).await.unwrap();
    }

    #[tokio::test]
    async fn jobs_are_fifo() {
        let ds = MemoryDatastore::new();
        let target = test_target("acme/widget");
        let target_id = target.id;
        ds.create_target(target).await.unwrap();

        for i in 0..3 {
            ds.enqueue_job(Job {
                id: JobId::new(),
                target_id,
                ghe_domain: None,
                repository: "acme/widget".to_string(),
                payload: serde_json::json!({ "seq": i }),
                check_run_id: None,
                workflow_run_id: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        let jobs = ds.list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 3);
        assert!(jobs.windows(2).all(|w| w[0].id < w[1].id));

        ds.delete_job(jobs[0].id).await.unwrap();
        assert_eq!(ds.list_jobs().await.unwrap().len(), 2);
        // Deleting twice is fine.
        ds.delete_job(jobs[0].id).await.unwrap();
    }

    #[tokio::test]
    async fn runner_soft_delete_is_idempotent_and_terminal() {
        let ds = MemoryDatastore::new();
        let runner = test_runner(TargetId::new());
        let id = runner.id;
        ds.create_runner(runner).await.unwrap();

        let deleted_at = Utc::now();
        ds.delete_runner(id, deleted_at, DecommissionReason::JobCompleted)
            .await
            .unwrap();
        ds.delete_runner(id, Utc::now(), DecommissionReason::Recovered)
            .await
            .unwrap();

        let fetched = ds.get_runner(id).await.unwrap();
        assert_eq!(fetched.status, RunnerStatus::Deleted);
        // First delete wins; the second was a no-op.
        assert_eq!(fetched.deleted_reason, Some(DecommissionReason::JobCompleted));
        assert_eq!(fetched.deleted_at, Some(deleted_at));

        // No resurrection.
        ds.update_runner_status(id, RunnerStatus::Running).await.unwrap();
        assert_eq!(ds.get_runner(id).await.unwrap().status, RunnerStatus::Deleted);

        // Gone from the live view, still in the audit log.
        assert!(ds.list_runners().await.unwrap().is_empty());
        let logged = ds
            .list_runners_logged_until(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(logged.len(), 1);
    }

    #[tokio::test]
    async fn running_since_stamped_on_promotion() {
        let ds = MemoryDatastore::new();
        let runner = test_runner(TargetId::new());
        let id = runner.id;
        ds.create_runner(runner).await.unwrap();

        ds.update_runner_status(id, RunnerStatus::Running).await.unwrap();
        let fetched = ds.get_runner(id).await.unwrap();
        assert_eq!(fetched.status, RunnerStatus::Running);
        let first = fetched.running_since.unwrap();

        // Re-promoting does not move the stamp.
        ds.update_runner_status(id, RunnerStatus::Running).await.unwrap();
        assert_eq!(ds.get_runner(id).await.unwrap().running_since, Some(first));
    }

    #[tokio::test]
    async fn activity_windows() {
        let ds = MemoryDatastore::new();
        let mut old = test_runner(TargetId::new());
        old.created_at = Utc::now() - chrono::Duration::hours(48);
        let recent = test_runner(TargetId::new());
        ds.create_runner(old).await.unwrap();
        ds.create_runner(recent).await.unwrap();

        let since = Utc::now() - chrono::Duration::hours(24);
        assert_eq!(ds.list_runners_logged_since(since).await.unwrap().len(), 1);
        assert_eq!(ds.list_runners_logged_until(since).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lock_is_exclusive() {
        let ds = MemoryDatastore::new();
        assert!(ds.try_acquire_lock("starter").await.unwrap());
        // Re-entrant for the same holder.
        assert!(ds.try_acquire_lock("starter").await.unwrap());
        assert!(!ds.try_acquire_lock("runner-manager").await.unwrap());
        assert_eq!(ds.lock_holder().await.unwrap().as_deref(), Some("starter"));

        // Only the holder can release.
        ds.release_lock("runner-manager").await.unwrap();
        assert!(ds.lock_holder().await.unwrap().is_some());
        ds.release_lock("starter").await.unwrap();
        assert!(ds.lock_holder().await.unwrap().is_none());
        assert!(ds.try_acquire_lock("runner-manager").await.unwrap());
    }
}

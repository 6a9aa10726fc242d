//! myshoes-datastore
//!
//! Durable state for the control plane: targets, jobs, runners, and the
//! advisory lock that serializes reconciliation ticks across replicas.
//!
//! The [`Datastore`] trait is the single source of truth for all three
//! entity kinds. Two backends implement it: [`memory::MemoryDatastore`]
//! (process-local, used by every test) and [`postgres::PgDatastore`]
//! (shared, sqlx).

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod entity;
pub mod error;
pub mod ids;
pub mod memory;
pub mod postgres;

pub use entity::{
    DecommissionReason, Job, ResourceClass, Runner, RunnerStatus, Target, TargetStatus,
};
pub use error::DatastoreError;
pub use ids::{IdError, JobId, RunnerId, TargetId};

/// Contract every datastore backend honors.
///
/// Guarantees required of implementations:
/// - `enqueue_job` is durable before it returns.
/// - `delete_runner` is an idempotent soft delete; a missing or
///   already-deleted row is success.
/// - Runner status transitions are monotonic; a `deleted` row never
///   changes again.
/// - The advisory lock is exclusive: at most one holder at a time.
#[async_trait]
pub trait Datastore: Send + Sync {
    // Targets

    async fn create_target(&self, target: Target) -> Result<(), DatastoreError>;

    async fn get_target(&self, id: TargetId) -> Result<Target, DatastoreError>;

    /// Look up a non-deleted target by scope on a specific CI host.
    /// `ghe_domain: None` addresses the default host.
    async fn get_target_by_scope(
        &self,
        ghe_domain: Option<&str>,
        scope: &str,
    ) -> Result<Target, DatastoreError>;

    /// All non-deleted targets.
    async fn list_targets(&self) -> Result<Vec<Target>, DatastoreError>;

    async fn delete_target(&self, id: TargetId) -> Result<(), DatastoreError>;

    async fn update_target_status(
        &self,
        id: TargetId,
        status: TargetStatus,
        description: Option<&str>,
    ) -> Result<(), DatastoreError>;

    async fn update_target_token(
        &self,
        id: TargetId,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatastoreError>;

    async fn update_target_param(
        &self,
        id: TargetId,
        resource_class: ResourceClass,
        provider_url: Option<&str>,
    ) -> Result<(), DatastoreError>;

    // Jobs

    async fn enqueue_job(&self, job: Job) -> Result<(), DatastoreError>;

    /// All pending jobs, oldest first.
    async fn list_jobs(&self) -> Result<Vec<Job>, DatastoreError>;

    async fn delete_job(&self, id: JobId) -> Result<(), DatastoreError>;

    // Runners

    async fn create_runner(&self, runner: Runner) -> Result<(), DatastoreError>;

    /// All non-deleted runners.
    async fn list_runners(&self) -> Result<Vec<Runner>, DatastoreError>;

    /// Non-deleted runners owned by a target.
    async fn list_runners_by_target(
        &self,
        target_id: TargetId,
    ) -> Result<Vec<Runner>, DatastoreError>;

    /// Audit view: every runner (deleted included) created before `until`.
    async fn list_runners_logged_until(
        &self,
        until: DateTime<Utc>,
    ) -> Result<Vec<Runner>, DatastoreError>;

    /// Recent-activity view: every runner (deleted included) created after
    /// `since`.
    async fn list_runners_logged_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Runner>, DatastoreError>;

    /// Fetch a runner by id, deleted rows included.
    async fn get_runner(&self, id: RunnerId) -> Result<Runner, DatastoreError>;

    /// Advance a runner's status. The created -> running edge stamps
    /// `running_since`. Backwards transitions and transitions out of
    /// `deleted` are ignored.
    async fn update_runner_status(
        &self,
        id: RunnerId,
        status: RunnerStatus,
    ) -> Result<(), DatastoreError>;

    /// Soft-delete a runner, recording when and why. Idempotent.
    async fn delete_runner(
        &self,
        id: RunnerId,
        deleted_at: DateTime<Utc>,
        reason: DecommissionReason,
    ) -> Result<(), DatastoreError>;

    // Advisory lock

    /// Try to take the process-wide lock. Non-blocking; returns whether it
    /// was acquired. Re-acquiring under the same holder succeeds.
    async fn try_acquire_lock(&self, holder: &str) -> Result<bool, DatastoreError>;

    /// Release the lock if `holder` owns it.
    async fn release_lock(&self, holder: &str) -> Result<(), DatastoreError>;

    /// Current holder, if any.
    async fn lock_holder(&self) -> Result<Option<String>, DatastoreError>;
}

//! Postgres datastore backend.
//!
//! Shared storage for multi-replica deployments. The advisory lock maps to
//! a Postgres advisory lock held on a dedicated pool connection, so it is
//! exclusive across every control-plane instance pointing at the same
//! database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::debug;

use crate::entity::{DecommissionReason, Job, ResourceClass, Runner, RunnerStatus, Target, TargetStatus};
use crate::error::DatastoreError;
use crate::ids::{JobId, RunnerId, TargetId};
use crate::Datastore;

// Advisory lock key, fixed for the whole control plane.
const LOCK_CLASS: i32 = 0x6d79; // "my"
const LOCK_OBJID: i32 = 0x7368; // "sh"

/// Postgres implementation of [`Datastore`].
pub struct PgDatastore {
    pool: PgPool,
    // The advisory lock is session-scoped, so the holding connection is
    // pinned here for the duration of the hold.
    lock_conn: tokio::sync::Mutex<Option<sqlx::pool::PoolConnection<sqlx::Postgres>>>,
    lock_holder: std::sync::Mutex<Option<String>>,
}

impl PgDatastore {
    /// Connect to the database.
    pub async fn connect(database_url: &str) -> Result<Self, DatastoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(DatastoreError::Connect)?;

        Ok(Self {
            pool,
            lock_conn: tokio::sync::Mutex::new(None),
            lock_holder: std::sync::Mutex::new(None),
        })
    }

    /// Create the schema if it does not exist yet.
    pub async fn init_schema(&self) -> Result<(), DatastoreError> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS targets (
                id TEXT PRIMARY KEY,
                scope TEXT NOT NULL,
                ghe_domain TEXT,
                resource_class TEXT NOT NULL,
                provider_url TEXT,
                status TEXT NOT NULL,
                status_description TEXT,
                token TEXT,
                token_expires_at TIMESTAMPTZ,
                runner_user TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_targets_scope
                ON targets (scope, COALESCE(ghe_domain, ''))
                WHERE status != 'deleted';

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                target_id TEXT NOT NULL,
                ghe_domain TEXT,
                repository TEXT NOT NULL,
                payload JSONB NOT NULL,
                check_run_id BIGINT,
                workflow_run_id BIGINT,
                created_at TIMESTAMPTZ NOT NULL
            );

            CREATE TABLE IF NOT EXISTS runners (
                id TEXT PRIMARY KEY,
                target_id TEXT NOT NULL,
                cloud_id TEXT NOT NULL,
                shoes_type TEXT NOT NULL,
                name TEXT NOT NULL,
                repository_url TEXT NOT NULL,
                resource_class TEXT NOT NULL,
                provider_url TEXT,
                status TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                running_since TIMESTAMPTZ,
                deleted_at TIMESTAMPTZ,
                deleted_reason TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_runners_target ON runners (target_id);
            CREATE INDEX IF NOT EXISTS idx_runners_created ON runners (created_at);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(DatastoreError::Query)?;

        debug!("datastore schema initialized");
        Ok(())
    }

}

#[async_trait]
impl Datastore for PgDatastore {
    async fn create_target(&self, target: Target) -> Result<(), DatastoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO targets (id, scope, ghe_domain, resource_class, provider_url,
                                 status, status_description, token, token_expires_at,
                                 runner_user, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(target.id.to_string())
        .bind(&target.scope)
        .bind(&target.ghe_domain)
        .bind(target.resource_class.as_str())
        .bind(&target.provider_url)
        .bind(target.status.as_str())
        .bind(&target.status_description)
        .bind(&target.token)
        .bind(target.token_expires_at)
        .bind(&target.runner_user)
        .bind(target.created_at)
        .bind(target.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(DatastoreError::AlreadyExists(target.scope))
            }
            Err(e) => Err(DatastoreError::Query(e)),
        }
    }

    async fn get_target(&self, id: TargetId) -> Result<Target, DatastoreError> {
        let row = sqlx::query_as::<_, TargetRow>("SELECT * FROM targets WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DatastoreError::Query)?;
        row.ok_or(DatastoreError::NotFound)?.try_into()
    }

    async fn get_target_by_scope(
        &self,
        ghe_domain: Option<&str>,
        scope: &str,
    ) -> Result<Target, DatastoreError> {
        let row = sqlx::query_as::<_, TargetRow>(
            r#"
            SELECT * FROM targets
            WHERE scope = $1
              AND COALESCE(ghe_domain, '') = COALESCE($2, '')
              AND status != 'deleted'
            "#,
        )
        .bind(scope)
        .bind(ghe_domain)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatastoreError::Query)?;
        row.ok_or(DatastoreError::NotFound)?.try_into()
    }

    async fn list_targets(&self) -> Result<Vec<Target>, DatastoreError> {
        let rows = sqlx::query_as::<_, TargetRow>(
            "SELECT * FROM targets WHERE status != 'deleted' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DatastoreError::Query)?;
        rows.into_iter().map(Target::try_from).collect()
    }

    async fn delete_target(&self, id: TargetId) -> Result<(), DatastoreError> {
        sqlx::query("UPDATE targets SET status = 'deleted', updated_at = now() WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DatastoreError::Query)?;
        Ok(())
    }

    async fn update_target_status(
        &self,
        id: TargetId,
        status: TargetStatus,
        description: Option<&str>,
    ) -> Result<(), DatastoreError> {
        let result = sqlx::query(
            "UPDATE targets SET status = $1, status_description = $2, updated_at = now() WHERE id = $3",
        )
        .bind(status.as_str())
        .bind(description)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DatastoreError::Query)?;

        if result.rows_affected() == 0 {
            return Err(DatastoreError::NotFound);
        }
        Ok(())
    }

    async fn update_target_token(
        &self,
        id: TargetId,
        token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatastoreError> {
        let result = sqlx::query(
            "UPDATE targets SET token = $1, token_expires_at = $2, updated_at = now() WHERE id = $3",
        )
        .bind(token)
        .bind(expires_at)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DatastoreError::Query)?;

        if result.rows_affected() == 0 {
            return Err(DatastoreError::NotFound);
        }
        Ok(())
    }

    async fn update_target_param(
        &self,
        id: TargetId,
        resource_class: ResourceClass,
        provider_url: Option<&str>,
    ) -> Result<(), DatastoreError> {
        let result = sqlx::query(
            "UPDATE targets SET resource_class = $1, provider_url = $2, updated_at = now() WHERE id = $3",
        )
        .bind(resource_class.as_str())
        .bind(provider_url)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DatastoreError::Query)?;

        if result.rows_affected() == 0 {
            return Err(DatastoreError::NotFound);
        }
        Ok(())
    }

    async fn enqueue_job(&self, job: Job) -> Result<(), DatastoreError> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, target_id, ghe_domain, repository, payload,
                              check_run_id, workflow_run_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(job.id.to_string())
        .bind(job.target_id.to_string())
        .bind(&job.ghe_domain)
        .bind(&job.repository)
        .bind(&job.payload)
        .bind(job.check_run_id)
        .bind(job.workflow_run_id)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(DatastoreError::Query)?;
        Ok(())
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, DatastoreError> {
        let rows = sqlx::query_as::<_, JobRow>("SELECT * FROM jobs ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(DatastoreError::Query)?;
        rows.into_iter().map(Job::try_from).collect()
    }

    async fn delete_job(&self, id: JobId) -> Result<(), DatastoreError> {
        sqlx::query("DELETE FROM jobs WHERE id = $1")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DatastoreError::Query)?;
        Ok(())
    }

    async fn create_runner(&self, runner: Runner) -> Result<(), DatastoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO runners (id, target_id, cloud_id, shoes_type, name,
                                 repository_url, resource_class, provider_url,
                                 status, created_at, running_since, deleted_at,
                                 deleted_reason)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(runner.id.to_string())
        .bind(runner.target_id.to_string())
        .bind(&runner.cloud_id)
        .bind(&runner.shoes_type)
        .bind(&runner.name)
        .bind(&runner.repository_url)
        .bind(runner.resource_class.as_str())
        .bind(&runner.provider_url)
        .bind(runner.status.as_str())
        .bind(runner.created_at)
        .bind(runner.running_since)
        .bind(runner.deleted_at)
        .bind(runner.deleted_reason.map(|r| r.as_str()))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                Err(DatastoreError::AlreadyExists(runner.id.to_string()))
            }
            Err(e) => Err(DatastoreError::Query(e)),
        }
    }

    async fn list_runners(&self) -> Result<Vec<Runner>, DatastoreError> {
        let rows = sqlx::query_as::<_, RunnerRow>(
            "SELECT * FROM runners WHERE status != 'deleted' ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(DatastoreError::Query)?;
        rows.into_iter().map(Runner::try_from).collect()
    }

    async fn list_runners_by_target(
        &self,
        target_id: TargetId,
    ) -> Result<Vec<Runner>, DatastoreError> {
        let rows = sqlx::query_as::<_, RunnerRow>(
            "SELECT * FROM runners WHERE target_id = $1 AND status != 'deleted' ORDER BY id",
        )
        .bind(target_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(DatastoreError::Query)?;
        rows.into_iter().map(Runner::try_from).collect()
    }

    async fn list_runners_logged_until(
        &self,
        until: DateTime<Utc>,
    ) -> Result<Vec<Runner>, DatastoreError> {
        let rows = sqlx::query_as::<_, RunnerRow>(
            "SELECT * FROM runners WHERE created_at < $1 ORDER BY created_at",
        )
        .bind(until)
        .fetch_all(&self.pool)
        .await
        .map_err(DatastoreError::Query)?;
        rows.into_iter().map(Runner::try_from).collect()
    }

    async fn list_runners_logged_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<Runner>, DatastoreError> {
        let rows = sqlx::query_as::<_, RunnerRow>(
            "SELECT * FROM runners WHERE created_at > $1 ORDER BY created_at",
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(DatastoreError::Query)?;
        rows.into_iter().map(Runner::try_from).collect()
    }

    async fn get_runner(&self, id: RunnerId) -> Result<Runner, DatastoreError> {
        let row = sqlx::query_as::<_, RunnerRow>("SELECT * FROM runners WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DatastoreError::Query)?;
        row.ok_or(DatastoreError::NotFound)?.try_into()
    }

    async fn update_runner_status(
        &self,
        id: RunnerId,
        status: RunnerStatus,
    ) -> Result<(), DatastoreError> {
        // Monotonic guard lives in the WHERE clause; a no-match update is a
        // no-op, not an error.
        let running_since_stamp = status == RunnerStatus::Running;
        sqlx::query(
            r#"
            UPDATE runners
            SET status = $1,
                running_since = CASE
                    WHEN $2 AND running_since IS NULL THEN now()
                    ELSE running_since
                END
            WHERE id = $3
              AND status != 'deleted'
              AND array_position(ARRAY['created','running','completed','deleted'], status)
                  < array_position(ARRAY['created','running','completed','deleted'], $1)
            "#,
        )
        .bind(status.as_str())
        .bind(running_since_stamp)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DatastoreError::Query)?;
        Ok(())
    }

    async fn delete_runner(
        &self,
        id: RunnerId,
        deleted_at: DateTime<Utc>,
        reason: DecommissionReason,
    ) -> Result<(), DatastoreError> {
        sqlx::query(
            r#"
            UPDATE runners
            SET status = 'deleted', deleted_at = $1, deleted_reason = $2
            WHERE id = $3 AND status != 'deleted'
            "#,
        )
        .bind(deleted_at)
        .bind(reason.as_str())
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DatastoreError::Query)?;
        Ok(())
    }

    async fn try_acquire_lock(&self, holder: &str) -> Result<bool, DatastoreError> {
        let mut conn_slot = self.lock_conn.lock().await;

        if conn_slot.is_some() {
            // This instance already holds the lock; only the same holder
            // may re-enter.
            let current = self.lock_holder.lock().expect("lock holder poisoned");
            return Ok(current.as_deref() == Some(holder));
        }

        let mut conn = self.pool.acquire().await.map_err(DatastoreError::Connect)?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1, $2)")
            .bind(LOCK_CLASS)
            .bind(LOCK_OBJID)
            .fetch_one(&mut *conn)
            .await
            .map_err(DatastoreError::Query)?;

        if acquired {
            *conn_slot = Some(conn);
            *self.lock_holder.lock().expect("lock holder poisoned") = Some(holder.to_string());
        }
        Ok(acquired)
    }

    async fn release_lock(&self, holder: &str) -> Result<(), DatastoreError> {
        let mut conn_slot = self.lock_conn.lock().await;

        {
            let current = self.lock_holder.lock().expect("lock holder poisoned");
            if current.as_deref() != Some(holder) {
                return Ok(());
            }
        }

        if let Some(mut conn) = conn_slot.take() {
            sqlx::query("SELECT pg_advisory_unlock($1, $2)")
                .bind(LOCK_CLASS)
                .bind(LOCK_OBJID)
                .execute(&mut *conn)
                .await
                .map_err(DatastoreError::Query)?;
        }
        *self.lock_holder.lock().expect("lock holder poisoned") = None;
        Ok(())
    }

    async fn lock_holder(&self) -> Result<Option<String>, DatastoreError> {
        {
            let local = self.lock_holder.lock().expect("lock holder poisoned");
            if local.is_some() {
                return Ok(local.clone());
            }
        }

        // Some other instance may hold it; all we can name is the backend pid.
        let pid: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT pid FROM pg_locks
            WHERE locktype = 'advisory' AND classid = $1 AND objid = $2 AND granted
            LIMIT 1
            "#,
        )
        .bind(LOCK_CLASS)
        .bind(LOCK_OBJID)
        .fetch_optional(&self.pool)
        .await
        .map_err(DatastoreError::Query)?;

        Ok(pid.map(|p| format!("pid:{p}")))
    }
}

// =============================================================================
// Row types
// =============================================================================

#[derive(Debug)]
struct TargetRow {
    id: String,
    scope: String,
    ghe_domain: Option<String>,
    resource_class: String,
    provider_url: Option<String>,
    status: String,
    status_description: Option<String>,
    token: Option<String>,
    token_expires_at: Option<DateTime<Utc>>,
    runner_user: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for TargetRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            scope: row.try_get("scope")?,
            ghe_domain: row.try_get("ghe_domain")?,
            resource_class: row.try_get("resource_class")?,
            provider_url: row.try_get("provider_url")?,
            status: row.try_get("status")?,
            status_description: row.try_get("status_description")?,
            token: row.try_get("token")?,
            token_expires_at: row.try_get("token_expires_at")?,
            runner_user: row.try_get("runner_user")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<TargetRow> for Target {
    type Error = DatastoreError;

    fn try_from(row: TargetRow) -> Result<Self, Self::Error> {
        Ok(Target {
            id: row
                .id
                .parse()
                .map_err(|e| DatastoreError::InvalidValue(format!("target id: {e}")))?,
            scope: row.scope,
            ghe_domain: row.ghe_domain,
            resource_class: ResourceClass::from_str(&row.resource_class).ok_or_else(|| {
                DatastoreError::InvalidValue(format!("resource class: {}", row.resource_class))
            })?,
            provider_url: row.provider_url,
            status: TargetStatus::from_str(&row.status).ok_or_else(|| {
                DatastoreError::InvalidValue(format!("target status: {}", row.status))
            })?,
            status_description: row.status_description,
            token: row.token,
            token_expires_at: row.token_expires_at,
            runner_user: row.runner_user,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug)]
struct JobRow {
    id: String,
    target_id: String,
    ghe_domain: Option<String>,
    repository: String,
    payload: serde_json::Value,
    check_run_id: Option<i64>,
    workflow_run_id: Option<i64>,
    created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            target_id: row.try_get("target_id")?,
            ghe_domain: row.try_get("ghe_domain")?,
            repository: row.try_get("repository")?,
            payload: row.try_get("payload")?,
            check_run_id: row.try_get("check_run_id")?,
            workflow_run_id: row.try_get("workflow_run_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = DatastoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row
                .id
                .parse()
                .map_err(|e| DatastoreError::InvalidValue(format!("job id: {e}")))?,
            target_id: row
                .target_id
                .parse()
                .map_err(|e| DatastoreError::InvalidValue(format!("job target id: {e}")))?,
            ghe_domain: row.ghe_domain,
            repository: row.repository,
            payload: row.payload,
            check_run_id: row.check_run_id,
            workflow_run_id: row.workflow_run_id,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug)]
struct RunnerRow {
    id: String,
    target_id: String,
    cloud_id: String,
    shoes_type: String,
    name: String,
    repository_url: String,
    resource_class: String,
    provider_url: Option<String>,
    status: String,
    created_at: DateTime<Utc>,
    running_since: Option<DateTime<Utc>>,
    deleted_at: Option<DateTime<Utc>>,
    deleted_reason: Option<String>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for RunnerRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            target_id: row.try_get("target_id")?,
            cloud_id: row.try_get("cloud_id")?,
            shoes_type: row.try_get("shoes_type")?,
            name: row.try_get("name")?,
            repository_url: row.try_get("repository_url")?,
            resource_class: row.try_get("resource_class")?,
            provider_url: row.try_get("provider_url")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            running_since: row.try_get("running_since")?,
            deleted_at: row.try_get("deleted_at")?,
            deleted_reason: row.try_get("deleted_reason")?,
        })
    }
}

impl TryFrom<RunnerRow> for Runner {
    type Error = DatastoreError;

    fn try_from(row: RunnerRow) -> Result<Self, Self::Error> {
        let deleted_reason = match row.deleted_reason {
            Some(s) => Some(DecommissionReason::from_str(&s).ok_or_else(|| {
                DatastoreError::InvalidValue(format!("decommission reason: {s}"))
            })?),
            None => None,
        };
        Ok(Runner {
            id: row
                .id
                .parse()
                .map_err(|e| DatastoreError::InvalidValue(format!("runner id: {e}")))?,
            target_id: row
                .target_id
                .parse()
                .map_err(|e| DatastoreError::InvalidValue(format!("runner target id: {e}")))?,
            cloud_id: row.cloud_id,
            shoes_type: row.shoes_type,
            name: row.name,
            repository_url: row.repository_url,
            resource_class: ResourceClass::from_str(&row.resource_class).ok_or_else(|| {
                DatastoreError::InvalidValue(format!("resource class: {}", row.resource_class))
            })?,
            provider_url: row.provider_url,
            status: RunnerStatus::from_str(&row.status).ok_or_else(|| {
                DatastoreError::InvalidValue(format!("runner status: {}", row.status))
            })?,
            created_at: row.created_at,
            running_since: row.running_since,
            deleted_at: row.deleted_at,
            deleted_reason,
        })
    }
}

//! myshoes-github
//!
//! The CI-service seam: the operations the orchestration core invokes
//! against GitHub Actions, an HTTP implementation with in-process token and
//! installation caches, and a scriptable mock for tests.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod client;
pub mod mock;

pub use client::HttpGitHubClient;
pub use mock::MockGitHubClient;

/// Errors from CI-service calls.
#[derive(Debug, Error)]
pub enum GitHubError {
    /// Transport-level failure (connect, timeout, TLS).
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with a non-success status.
    #[error("api error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The addressed resource does not exist (idempotent success for
    /// removals).
    #[error("not found")]
    NotFound,

    /// A response body could not be decoded.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// A short-lived runner registration token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// One registered runner as the CI service sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerView {
    pub id: i64,
    pub name: String,
    pub online: bool,
    pub busy: bool,
}

/// One workflow run of a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunView {
    pub id: i64,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

impl WorkflowRunView {
    /// Whether the run is still waiting for a runner.
    pub fn is_waiting(&self) -> bool {
        matches!(self.status.as_str(), "queued" | "pending")
    }
}

/// Operations the orchestration core consumes.
#[async_trait]
pub trait GitHubClient: Send + Sync {
    /// Issue (or serve from cache) a registration token for a scope.
    async fn create_registration_token(
        &self,
        scope: &str,
    ) -> Result<RegistrationToken, GitHubError>;

    /// Remove a runner registration by name. `NotFound` when it is already
    /// gone.
    async fn remove_runner(&self, scope: &str, runner_name: &str) -> Result<(), GitHubError>;

    /// Runners currently registered in a scope.
    async fn list_runners(&self, scope: &str) -> Result<Vec<RunnerView>, GitHubError>;

    /// The 100 most recent workflow runs of a repository, newest first.
    async fn list_workflow_runs(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<WorkflowRunView>, GitHubError>;

    /// GitHub App installation id for a scope.
    async fn installation_id(&self, scope: &str) -> Result<i64, GitHubError>;
}

/// Split a repository full name into (owner, repo). An org/enterprise scope
/// comes back as (scope, "").
pub fn divide_scope(full_name: &str) -> (&str, &str) {
    match full_name.split_once('/') {
        Some((owner, repo)) => (owner, repo),
        None => (full_name, ""),
    }
}

// =============================================================================
// Rate-limit counters
// =============================================================================

#[derive(Debug, Clone, Copy, Default)]
struct RateLimit {
    remaining: i64,
    limit: i64,
}

static RATE_LIMITS: LazyLock<Mutex<HashMap<String, RateLimit>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Record the rate-limit headers observed on a response for a scope.
pub fn record_rate_limit(scope: &str, remaining: i64, limit: i64) {
    RATE_LIMITS
        .lock()
        .expect("rate limit map poisoned")
        .insert(scope.to_string(), RateLimit { remaining, limit });
}

/// Remaining requests per scope, as last observed.
pub fn rate_limit_remaining() -> HashMap<String, i64> {
    RATE_LIMITS
        .lock()
        .expect("rate limit map poisoned")
        .iter()
        .map(|(scope, rl)| (scope.clone(), rl.remaining))
        .collect()
}

/// Request quota per scope, as last observed.
pub fn rate_limit_limit() -> HashMap<String, i64> {
    RATE_LIMITS
        .lock()
        .expect("rate limit map poisoned")
        .iter()
        .map(|(scope, rl)| (scope.clone(), rl.limit))
        .collect()
}

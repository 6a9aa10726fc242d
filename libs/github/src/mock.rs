//! Scriptable mock CI-service client for tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::{GitHubClient, GitHubError, RegistrationToken, RunnerView, WorkflowRunView};

#[derive(Default)]
struct MockState {
    token_calls: Vec<String>,
    removed: Vec<(String, String)>,
    runners: HashMap<String, Vec<RunnerView>>,
    workflow_runs: HashMap<String, Vec<WorkflowRunView>>,
    installations: HashMap<String, i64>,
    fail_tokens: bool,
}

/// `GitHubClient` whose answers are scripted by the test.
#[derive(Default)]
pub struct MockGitHubClient {
    state: Mutex<MockState>,
}

impl MockGitHubClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the registered runners of a scope.
    pub fn set_runners(&self, scope: &str, runners: Vec<RunnerView>) {
        self.state
            .lock()
            .unwrap()
            .runners
            .insert(scope.to_string(), runners);
    }

    /// Script the workflow runs of a repository (`owner/repo`).
    pub fn set_workflow_runs(&self, repository: &str, runs: Vec<WorkflowRunView>) {
        self.state
            .lock()
            .unwrap()
            .workflow_runs
            .insert(repository.to_string(), runs);
    }

    pub fn set_installation(&self, scope: &str, id: i64) {
        self.state
            .lock()
            .unwrap()
            .installations
            .insert(scope.to_string(), id);
    }

    /// Make token issuance fail until turned off again.
    pub fn fail_tokens(&self, fail: bool) {
        self.state.lock().unwrap().fail_tokens = fail;
    }

    /// Scopes token issuance was requested for, in order.
    pub fn token_calls(&self) -> Vec<String> {
        self.state.lock().unwrap().token_calls.clone()
    }

    /// (scope, runner name) pairs removal was requested for, in order.
    pub fn removed_runners(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().removed.clone()
    }
}

#[async_trait]
impl GitHubClient for MockGitHubClient {
    async fn create_registration_token(
        &self,
        scope: &str,
    ) -> Result<RegistrationToken, GitHubError> {
        let mut state = self.state.lock().unwrap();
        state.token_calls.push(scope.to_string());
        if state.fail_tokens {
            return Err(GitHubError::Api {
                status: 500,
                message: "scripted token failure".to_string(),
            });
        }
        Ok(RegistrationToken {
            token: format!("mock-token-{scope}"),
            expires_at: Utc::now() + Duration::hours(1),
        })
    }

    async fn remove_runner(&self, scope: &str, runner_name: &str) -> Result<(), GitHubError> {
        let mut state = self.state.lock().unwrap();
        state
            .removed
            .push((scope.to_string(), runner_name.to_string()));

        let known = state
            .runners
            .get_mut(scope)
            .map(|runners| {
                let before = runners.len();
                runners.retain(|r| r.name != runner_name);
                runners.len() != before
            })
            .unwrap_or(false);

        if known {
            Ok(())
        } else {
            Err(GitHubError::NotFound)
        }
    }

    async fn list_runners(&self, scope: &str) -> Result<Vec<RunnerView>, GitHubError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .runners
            .get(scope)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_workflow_runs(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<WorkflowRunView>, GitHubError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .workflow_runs
            .get(&format!("{owner}/{repo}"))
            .cloned()
            .unwrap_or_default())
    }

    async fn installation_id(&self, scope: &str) -> Result<i64, GitHubError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .installations
            .get(scope)
            .copied()
            .unwrap_or(1))
    }
}

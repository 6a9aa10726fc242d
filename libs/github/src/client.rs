//! HTTP implementation of the CI-service client.
//!
//! Registration tokens and installation ids are cached per scope. Token
//! cache entries are served until shortly before the upstream expiry and
//! evicted lazily on access. Every request carries a 30 s deadline,
//! independent of the caller's cancellation path.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, USER_AGENT};
use reqwest::{Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::{
    divide_scope, record_rate_limit, GitHubClient, GitHubError, RegistrationToken, RunnerView,
    WorkflowRunView,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// Tokens are served from cache until this close to their upstream expiry.
const TOKEN_EXPIRY_MARGIN: chrono::Duration = chrono::Duration::minutes(2);

/// `GitHubClient` backed by the GitHub REST API.
pub struct HttpGitHubClient {
    http: reqwest::Client,
    api_base: String,
    token_cache: Mutex<HashMap<String, RegistrationToken>>,
    installation_cache: Mutex<HashMap<String, i64>>,
}

impl HttpGitHubClient {
    /// Build a client against an API base URL, e.g.
    /// `https://api.github.com`. `token` authenticates every request.
    pub fn new(api_base: &str, token: Option<&str>) -> Result<Self, GitHubError> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("myshoes"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/vnd.github+json"),
        );
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| GitHubError::InvalidResponse("invalid auth token".to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            token_cache: Mutex::new(HashMap::new()),
            installation_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Runner registration endpoints differ between repo and org scopes.
    fn runners_base(&self, scope: &str) -> String {
        if scope.contains('/') {
            format!("{}/repos/{}/actions/runners", self.api_base, scope)
        } else {
            format!("{}/orgs/{}/actions/runners", self.api_base, scope)
        }
    }

    fn observe_rate_limit(scope: &str, response: &Response) {
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<i64>().ok())
        };
        if let (Some(remaining), Some(limit)) =
            (header("x-ratelimit-remaining"), header("x-ratelimit-limit"))
        {
            record_rate_limit(scope, remaining, limit);
        }
    }

    async fn check(scope: &str, response: Response) -> Result<Response, GitHubError> {
        Self::observe_rate_limit(scope, &response);
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(GitHubError::NotFound);
        }
        let message = response.text().await.unwrap_or_default();
        Err(GitHubError::Api {
            status: status.as_u16(),
            message,
        })
    }

    fn cached_token(&self, scope: &str) -> Option<RegistrationToken> {
        let mut cache = self.token_cache.lock().expect("token cache poisoned");
        match cache.get(scope) {
            Some(token) if token.expires_at - Utc::now() > TOKEN_EXPIRY_MARGIN => {
                Some(token.clone())
            }
            Some(_) => {
                // Expired (or about to): evict on access.
                cache.remove(scope);
                None
            }
            None => None,
        }
    }
}

#[async_trait]
impl GitHubClient for HttpGitHubClient {
    async fn create_registration_token(
        &self,
        scope: &str,
    ) -> Result<RegistrationToken, GitHubError> {
        if let Some(token) = self.cached_token(scope) {
            debug!(scope = %scope, "registration token served from cache");
            return Ok(token);
        }

        let url = format!("{}/registration-token", self.runners_base(scope));
        let response = self.http.post(&url).send().await?;
        let response = Self::check(scope, response).await?;

        let body: RegistrationTokenResponse = response.json().await?;
        let token = RegistrationToken {
            token: body.token,
            expires_at: body.expires_at,
        };

        self.token_cache
            .lock()
            .expect("token cache poisoned")
            .insert(scope.to_string(), token.clone());

        Ok(token)
    }

    async fn remove_runner(&self, scope: &str, runner_name: &str) -> Result<(), GitHubError> {
        let runners = self.list_runners(scope).await?;
        let Some(runner) = runners.iter().find(|r| r.name == runner_name) else {
            return Err(GitHubError::NotFound);
        };

        let url = format!("{}/{}", self.runners_base(scope), runner.id);
        let response = self.http.delete(&url).send().await?;
        Self::check(scope, response).await?;
        Ok(())
    }

    async fn list_runners(&self, scope: &str) -> Result<Vec<RunnerView>, GitHubError> {
        let url = format!("{}?per_page=100", self.runners_base(scope));
        let response = self.http.get(&url).send().await?;
        let response = Self::check(scope, response).await?;

        let body: RunnersResponse = response.json().await?;
        Ok(body
            .runners
            .into_iter()
            .map(|r| RunnerView {
                id: r.id,
                name: r.name,
                online: r.status == "online",
                busy: r.busy,
            })
            .collect())
    }

    async fn list_workflow_runs(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<WorkflowRunView>, GitHubError> {
        let scope = format!("{owner}/{repo}");
        let url = format!(
            "{}/repos/{owner}/{repo}/actions/runs?per_page=100",
            self.api_base
        );
        let response = self.http.get(&url).send().await?;
        let response = Self::check(&scope, response).await?;

        let body: WorkflowRunsResponse = response.json().await?;
        Ok(body
            .workflow_runs
            .into_iter()
            .map(|r| WorkflowRunView {
                id: r.id,
                status: r.status,
                created_at: r.created_at,
            })
            .collect())
    }

    async fn installation_id(&self, scope: &str) -> Result<i64, GitHubError> {
        if let Some(id) = self
            .installation_cache
            .lock()
            .expect("installation cache poisoned")
            .get(scope)
        {
            return Ok(*id);
        }

        let (owner, repo) = divide_scope(scope);
        let url = if repo.is_empty() {
            format!("{}/orgs/{owner}/installation", self.api_base)
        } else {
            format!("{}/repos/{owner}/{repo}/installation", self.api_base)
        };
        let response = self.http.get(&url).send().await?;
        let response = Self::check(scope, response).await?;

        let body: InstallationResponse = response.json().await?;
        self.installation_cache
            .lock()
            .expect("installation cache poisoned")
            .insert(scope.to_string(), body.id);
        Ok(body.id)
    }
}

#[derive(Debug, Deserialize)]
struct RegistrationTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RunnersResponse {
    runners: Vec<ApiRunner>,
}

#[derive(Debug, Deserialize)]
struct ApiRunner {
    id: i64,
    name: String,
    status: String,
    busy: bool,
}

#[derive(Debug, Deserialize)]
struct WorkflowRunsResponse {
    workflow_runs: Vec<ApiWorkflowRun>,
}

#[derive(Debug, Deserialize)]
struct ApiWorkflowRun {
    id: i64,
    status: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct InstallationResponse {
    id: i64,
}

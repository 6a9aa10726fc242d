//! Configuration for the control plane.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Result};

/// Control-plane configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Starter concurrency cap: at most this many runner creations in
    /// flight at once.
    pub max_connections_to_backend: usize,

    /// Decommission concurrency cap.
    pub max_concurrency_deleting: usize,

    /// Stuck-create threshold: a runner that never came online is
    /// decommissioned after this long.
    pub must_running_time: Duration,

    /// Hung-job kill switch: a runner online for this long is
    /// decommissioned regardless.
    pub must_goal_time: Duration,

    /// Agent version pinned into the startup script.
    pub runner_version: String,

    /// Verbose logging.
    pub debug: bool,

    /// Development mode: registers the mock provider driver.
    pub dev_mode: bool,

    /// Postgres URL; absent selects the in-memory datastore.
    pub database_url: Option<String>,

    /// CI-service API base.
    pub github_url: String,

    /// Token authenticating CI-service calls.
    pub github_token: Option<String>,

    /// Cadence of the three loops.
    pub starter_interval: Duration,
    pub manager_interval: Duration,
    pub recoverer_interval: Duration,

    /// How long shutdown waits for in-flight workers.
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_connections_to_backend: 50,
            max_concurrency_deleting: 1,
            must_running_time: Duration::from_secs(15 * 60),
            must_goal_time: Duration::from_secs(6 * 60 * 60),
            runner_version: "latest".to_string(),
            debug: false,
            dev_mode: false,
            database_url: None,
            github_url: "https://api.github.com".to_string(),
            github_token: None,
            starter_interval: Duration::from_secs(1),
            manager_interval: Duration::from_secs(30),
            recoverer_interval: Duration::from_secs(5 * 60),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults above. An unparsable value is a startup error.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = parse_env("MYSHOES_MAX_CONNECTIONS_TO_BACKEND")? {
            config.max_connections_to_backend = v;
        }
        if let Some(v) = parse_env("MYSHOES_MAX_CONCURRENCY_DELETING")? {
            config.max_concurrency_deleting = v;
        }
        if let Some(v) = parse_env("MYSHOES_MUST_RUNNING_TIME_SEC")? {
            config.must_running_time = Duration::from_secs(v);
        }
        if let Some(v) = parse_env("MYSHOES_MUST_GOAL_TIME_SEC")? {
            config.must_goal_time = Duration::from_secs(v);
        }
        if let Ok(v) = std::env::var("MYSHOES_RUNNER_VERSION") {
            config.runner_version = v;
        }
        config.debug = env_flag("MYSHOES_DEBUG");
        config.dev_mode = env_flag("MYSHOES_DEV");
        config.database_url = std::env::var("MYSHOES_DATABASE_URL").ok();
        if let Ok(v) = std::env::var("MYSHOES_GITHUB_URL") {
            config.github_url = v;
        }
        config.github_token = std::env::var("MYSHOES_GITHUB_TOKEN").ok();
        if let Some(v) = parse_env("MYSHOES_SHUTDOWN_GRACE_SEC")? {
            config.shutdown_grace = Duration::from_secs(v);
        }

        Ok(config)
    }
}

fn parse_env<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| anyhow!("invalid {name} ({raw}): {e}")),
        Err(_) => Ok(None),
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_connections_to_backend, 50);
        assert_eq!(config.max_concurrency_deleting, 1);
        assert_eq!(config.must_running_time, Duration::from_secs(900));
        assert_eq!(config.must_goal_time, Duration::from_secs(21600));
        assert_eq!(config.runner_version, "latest");
        assert!(!config.debug);
        assert!(config.database_url.is_none());
    }
}

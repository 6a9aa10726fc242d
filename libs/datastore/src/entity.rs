//! Persisted entities: targets, jobs, runners.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{JobId, RunnerId, TargetId};

/// Lifecycle status of a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetStatus {
    Active,
    Err,
    Pending,
    Deleted,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Err => "err",
            Self::Pending => "pending",
            Self::Deleted => "deleted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "err" => Some(Self::Err),
            "pending" => Some(Self::Pending),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// Symbolic instance size a target requests from its provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceClass {
    Nano,
    Micro,
    Small,
    Medium,
    Large,
    XLarge,
}

impl ResourceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Nano => "nano",
            Self::Micro => "micro",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::XLarge => "xlarge",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "nano" => Some(Self::Nano),
            "micro" => Some(Self::Micro),
            "small" => Some(Self::Small),
            "medium" => Some(Self::Medium),
            "large" => Some(Self::Large),
            "xlarge" => Some(Self::XLarge),
            _ => None,
        }
    }
}

/// A configured scope the control plane may provision runners for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: TargetId,
    /// `owner`, `owner/repo`, or an enterprise name.
    pub scope: String,
    /// Non-default CI host, when the scope lives on GitHub Enterprise.
    pub ghe_domain: Option<String>,
    pub resource_class: ResourceClass,
    /// Selects the provider driver from the registry.
    pub provider_url: Option<String>,
    pub status: TargetStatus,
    pub status_description: Option<String>,
    /// Cached registration token and its upstream expiry.
    pub token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    /// OS user that will own the runner process on the instance.
    pub runner_user: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A unit of pending runner-creation work, enqueued at webhook ingress or by
/// the recoverer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub target_id: TargetId,
    pub ghe_domain: Option<String>,
    /// Repository full name, `owner/repo`.
    pub repository: String,
    /// Raw webhook body (or a synthesized one for recovered runs).
    pub payload: serde_json::Value,
    pub check_run_id: Option<i64>,
    /// Workflow run that caused this job, when known. Job creation is
    /// idempotent on (target, workflow run).
    pub workflow_run_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle status of a runner. Transitions are monotonic:
/// created -> running -> completed -> deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Created,
    Running,
    Completed,
    Deleted,
}

impl RunnerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Deleted => "deleted",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "created" => Some(Self::Created),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// Why a runner was decommissioned. Recorded on soft delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecommissionReason {
    JobCompleted,
    InstanceGone,
    ExceededMustRunningTime,
    ExceededMustGoalTime,
    Recovered,
}

impl DecommissionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JobCompleted => "job-completed",
            Self::InstanceGone => "instance-gone",
            Self::ExceededMustRunningTime => "exceeded-must-running-time",
            Self::ExceededMustGoalTime => "exceeded-must-goal-time",
            Self::Recovered => "recovered",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "job-completed" => Some(Self::JobCompleted),
            "instance-gone" => Some(Self::InstanceGone),
            "exceeded-must-running-time" => Some(Self::ExceededMustRunningTime),
            "exceeded-must-goal-time" => Some(Self::ExceededMustGoalTime),
            "recovered" => Some(Self::Recovered),
            _ => None,
        }
    }
}

/// An ephemeral worker instance. Soft-deleted rows are retained for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    pub id: RunnerId,
    pub target_id: TargetId,
    /// Provider-assigned instance id.
    pub cloud_id: String,
    /// Which driver owns this instance.
    pub shoes_type: String,
    /// Registration name on the CI service, `myshoes-{id}`.
    pub name: String,
    pub repository_url: String,
    pub resource_class: ResourceClass,
    pub provider_url: Option<String>,
    pub status: RunnerStatus,
    pub created_at: DateTime<Utc>,
    /// Set on the created -> running transition, when the CI service first
    /// reports the registration online.
    pub running_since: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub deleted_reason: Option<DecommissionReason>,
}

impl Runner {
    /// Registration name for a runner id.
    pub fn name_for(id: RunnerId) -> String {
        format!("myshoes-{id}")
    }

    pub fn is_deleted(&self) -> bool {
        self.status == RunnerStatus::Deleted
    }
}

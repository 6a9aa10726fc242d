//! myshoes-provider
//!
//! The cloud-provider driver seam. A driver knows how to create and delete
//! instances on one backend; the control plane is oblivious to whether that
//! is a process-local library or an out-of-process RPC shim. Optional
//! operations are advertised through [`Capabilities`] and the core branches
//! on the advertisement only, never on a concrete driver identity.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod mock;
pub mod registry;

pub use mock::MockProvider;
pub use registry::{ProviderRegistry, RegistryError};

/// Tag every myshoes-owned instance carries at the provider.
pub const INSTANCE_TAG: &str = "myshoes";

/// Errors from driver operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The driver does not implement this operation.
    #[error("operation not supported by driver: {0}")]
    Unsupported(&'static str),

    /// The instance does not exist (idempotent success for deletes).
    #[error("instance not found: {0}")]
    NotFound(String),

    /// The request can never succeed as issued.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Credentials were rejected by the backend.
    #[error("credentials rejected: {0}")]
    CredentialsRejected(String),

    /// Quota is permanently exhausted for this account.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The backend failed transiently; retrying may succeed.
    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl ProviderError {
    /// Terminal errors are not retried; the job that triggered them is
    /// dropped with a structured failure log.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_) | Self::CredentialsRejected(_) | Self::QuotaExceeded(_)
        )
    }
}

/// Observed state of an instance at the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Running,
    Stopped,
    Missing,
}

/// Optional operations a driver may advertise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// `get_instance_status` is implemented.
    pub instance_status: bool,
    /// `list_instances` is implemented (required for the orphan sweep).
    pub list_instances: bool,
}

/// Request to create one instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddInstanceRequest {
    /// Registration name of the runner the instance will host.
    pub runner_name: String,
    /// Symbolic size, `nano`..`xlarge`.
    pub resource_class: String,
    /// Script the instance executes on first boot.
    pub setup_script: String,
}

/// Result of a successful instance creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedInstance {
    /// Provider-assigned id, used for all later operations.
    pub cloud_id: String,
    /// Driver tag recorded on the runner row.
    pub shoes_type: String,
    /// Address of the instance, when the driver knows it up front.
    pub ip_address: Option<String>,
}

/// One entry from a `list_instances` sweep.
#[derive(Debug, Clone)]
pub struct InstanceSummary {
    pub cloud_id: String,
    pub status: InstanceStatus,
}

/// A cloud-provider driver.
#[async_trait]
pub trait ShoesProvider: Send + Sync {
    /// Which optional operations this driver implements.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    async fn add_instance(
        &self,
        request: &AddInstanceRequest,
    ) -> Result<CreatedInstance, ProviderError>;

    async fn delete_instance(&self, cloud_id: &str) -> Result<(), ProviderError>;

    async fn get_instance_status(&self, _cloud_id: &str) -> Result<InstanceStatus, ProviderError> {
        Err(ProviderError::Unsupported("get_instance_status"))
    }

    async fn list_instances(&self, _tag: &str) -> Result<Vec<InstanceSummary>, ProviderError> {
        Err(ProviderError::Unsupported("list_instances"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_classification() {
        assert!(ProviderError::InvalidRequest("bad scope".into()).is_terminal());
        assert!(ProviderError::CredentialsRejected("revoked".into()).is_terminal());
        assert!(ProviderError::QuotaExceeded("hard cap".into()).is_terminal());
        assert!(!ProviderError::Unavailable("503".into()).is_terminal());
        assert!(!ProviderError::NotFound("vm-1".into()).is_terminal());
        assert!(!ProviderError::Unsupported("list_instances").is_terminal());
    }
}

//! Mock driver for tests and dev mode.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    AddInstanceRequest, Capabilities, CreatedInstance, InstanceStatus, InstanceSummary,
    ProviderError, ShoesProvider,
};

const SHOES_TYPE: &str = "mock";

/// In-process driver. Instances are rows in a map; failure modes and
/// latency are scripted by tests.
pub struct MockProvider {
    capabilities: Capabilities,
    instances: Mutex<HashMap<String, InstanceStatus>>,
    deleted: Mutex<Vec<String>>,
    seq: AtomicU64,
    add_calls: AtomicU64,
    fail_adds_remaining: AtomicU32,
    fail_deletes_remaining: AtomicU32,
    terminal_add_failure: AtomicBool,
    add_delay: Mutex<Option<Duration>>,
    delete_delay: Mutex<Option<Duration>>,
    adds_live: AtomicI64,
    adds_max_live: AtomicI64,
    deletes_live: AtomicI64,
    deletes_max_live: AtomicI64,
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            capabilities: Capabilities {
                instance_status: true,
                list_instances: true,
            },
            instances: Mutex::new(HashMap::new()),
            deleted: Mutex::new(Vec::new()),
            seq: AtomicU64::new(0),
            add_calls: AtomicU64::new(0),
            fail_adds_remaining: AtomicU32::new(0),
            fail_deletes_remaining: AtomicU32::new(0),
            terminal_add_failure: AtomicBool::new(false),
            add_delay: Mutex::new(None),
            delete_delay: Mutex::new(None),
            adds_live: AtomicI64::new(0),
            adds_max_live: AtomicI64::new(0),
            deletes_live: AtomicI64::new(0),
            deletes_max_live: AtomicI64::new(0),
        }
    }

    /// A driver that advertises only the mandatory operations.
    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            capabilities,
            ..Self::new()
        }
    }

    /// Fail the next `n` `add_instance` calls with a transient error.
    pub fn fail_next_adds(&self, n: u32) {
        self.fail_adds_remaining.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` `delete_instance` calls with a transient error.
    pub fn fail_next_deletes(&self, n: u32) {
        self.fail_deletes_remaining.store(n, Ordering::SeqCst);
    }

    /// Make every `add_instance` call fail terminally.
    pub fn fail_adds_terminally(&self) {
        self.terminal_add_failure.store(true, Ordering::SeqCst);
    }

    /// Delay every `add_instance` call, for concurrency and cancellation
    /// tests.
    pub fn set_add_delay(&self, delay: Duration) {
        *self.add_delay.lock().unwrap() = Some(delay);
    }

    /// Delay every `delete_instance` call.
    pub fn set_delete_delay(&self, delay: Duration) {
        *self.delete_delay.lock().unwrap() = Some(delay);
    }

    /// Seed an instance that no runner row knows about (an orphan).
    pub fn insert_instance(&self, cloud_id: &str, status: InstanceStatus) {
        self.instances
            .lock()
            .unwrap()
            .insert(cloud_id.to_string(), status);
    }

    /// Override the observed status of an existing instance.
    pub fn set_instance_status(&self, cloud_id: &str, status: InstanceStatus) {
        self.insert_instance(cloud_id, status);
    }

    pub fn add_call_count(&self) -> u64 {
        self.add_calls.load(Ordering::SeqCst)
    }

    pub fn deleted_ids(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    /// Highest number of `add_instance` calls observed in flight at once.
    pub fn max_concurrent_adds(&self) -> i64 {
        self.adds_max_live.load(Ordering::SeqCst)
    }

    /// Highest number of `delete_instance` calls observed in flight at once.
    pub fn max_concurrent_deletes(&self) -> i64 {
        self.deletes_max_live.load(Ordering::SeqCst)
    }

    fn enter(live: &AtomicI64, max: &AtomicI64) {
        let now = live.fetch_add(1, Ordering::SeqCst) + 1;
        max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(live: &AtomicI64) {
        live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ShoesProvider for MockProvider {
    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn add_instance(
        &self,
        request: &AddInstanceRequest,
    ) -> Result<CreatedInstance, ProviderError> {
        self.add_calls.fetch_add(1, Ordering::SeqCst);
        Self::enter(&self.adds_live, &self.adds_max_live);
        let result = self.add_instance_inner(request).await;
        Self::exit(&self.adds_live);
        result
    }

    async fn delete_instance(&self, cloud_id: &str) -> Result<(), ProviderError> {
        Self::enter(&self.deletes_live, &self.deletes_max_live);
        let result = self.delete_instance_inner(cloud_id).await;
        Self::exit(&self.deletes_live);
        result
    }

    async fn get_instance_status(&self, cloud_id: &str) -> Result<InstanceStatus, ProviderError> {
        if !self.capabilities.instance_status {
            return Err(ProviderError::Unsupported("get_instance_status"));
        }
        Ok(self
            .instances
            .lock()
            .unwrap()
            .get(cloud_id)
            .copied()
            .unwrap_or(InstanceStatus::Missing))
    }

    async fn list_instances(&self, _tag: &str) -> Result<Vec<InstanceSummary>, ProviderError> {
        if !self.capabilities.list_instances {
            return Err(ProviderError::Unsupported("list_instances"));
        }
        Ok(self
            .instances
            .lock()
            .unwrap()
            .iter()
            .map(|(cloud_id, status)| InstanceSummary {
                cloud_id: cloud_id.clone(),
                status: *status,
            })
            .collect())
    }
}

impl MockProvider {
    async fn add_instance_inner(
        &self,
        request: &AddInstanceRequest,
    ) -> Result<CreatedInstance, ProviderError> {
        let delay = *self.add_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.terminal_add_failure.load(Ordering::SeqCst) {
            return Err(ProviderError::InvalidRequest(
                "mock driver configured to reject requests".to_string(),
            ));
        }

        let remaining = self.fail_adds_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_adds_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::Unavailable(
                "mock driver scripted failure".to_string(),
            ));
        }

        let n = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let cloud_id = format!("vm-{n}");
        self.instances
            .lock()
            .unwrap()
            .insert(cloud_id.clone(), InstanceStatus::Running);

        info!(
            cloud_id = %cloud_id,
            runner_name = %request.runner_name,
            resource_class = %request.resource_class,
            "[MOCK] instance created"
        );

        Ok(CreatedInstance {
            cloud_id,
            shoes_type: SHOES_TYPE.to_string(),
            ip_address: None,
        })
    }

    async fn delete_instance_inner(&self, cloud_id: &str) -> Result<(), ProviderError> {
        let delay = *self.delete_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let remaining = self.fail_deletes_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_deletes_remaining
                .store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::Unavailable(
                "mock driver scripted failure".to_string(),
            ));
        }

        let existed = self.instances.lock().unwrap().remove(cloud_id).is_some();
        self.deleted.lock().unwrap().push(cloud_id.to_string());

        if !existed {
            return Err(ProviderError::NotFound(cloud_id.to_string()));
        }

        debug!(cloud_id = %cloud_id, "[MOCK] instance deleted");
        Ok(())
    }
}

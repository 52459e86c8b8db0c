//! Narrow vSphere client interfaces
//!
//! Every mutating VM call only submits a task. Completion is observed
//! through [`TaskClient::task_info`].

use async_trait::async_trait;
use leaseflow_cloud::BackendResult;
use std::collections::BTreeMap;
use std::sync::Arc;

pub type Tags = BTreeMap<String, String>;

/// Managed object reference of a task
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(pub String);

impl std::fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskState {
    Queued,
    Running,
    /// Carries the task result, e.g. the moref of a cloned VM
    Success(Option<String>),
    Error { fault: String, message: String },
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Error { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmPowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
}

impl VmPowerState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "poweredOn" => Some(Self::PoweredOn),
            "poweredOff" => Some(Self::PoweredOff),
            "suspended" => Some(Self::Suspended),
            _ => None,
        }
    }
}

/// Where clones are placed, by inventory name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementSpec {
    pub datacenter: String,
    pub cluster: String,
    pub datastore: String,
    pub network: String,
    pub folder: Option<String>,
}

/// Resolved placement morefs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub resource_pool: String,
    pub datastore: String,
    pub network: String,
    pub folder: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSpec {
    pub label: String,
    pub size_gib: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareSpec {
    pub cpus: u32,
    pub memory_mib: u64,
    pub disks: Vec<DiskSpec>,
}

#[async_trait]
pub trait InventoryClient: Send + Sync {
    /// Template moref by name, if it exists in the datacenter
    async fn find_template(&self, datacenter: &str, name: &str) -> BackendResult<Option<String>>;
    async fn resolve_placement(&self, spec: &PlacementSpec) -> BackendResult<Placement>;
    /// VM moref by name, if it exists in the datacenter
    async fn find_vm(&self, datacenter: &str, name: &str) -> BackendResult<Option<String>>;
}

#[async_trait]
pub trait VmClient: Send + Sync {
    async fn clone_vm(
        &self,
        template: &str,
        name: &str,
        placement: &Placement,
        tags: &Tags,
    ) -> BackendResult<TaskHandle>;
    async fn reconfigure_vm(&self, vm: &str, spec: &HardwareSpec) -> BackendResult<TaskHandle>;
    async fn power_on(&self, vm: &str) -> BackendResult<TaskHandle>;
    async fn power_off(&self, vm: &str) -> BackendResult<TaskHandle>;
    async fn suspend(&self, vm: &str) -> BackendResult<TaskHandle>;
    async fn destroy(&self, vm: &str) -> BackendResult<TaskHandle>;
    async fn power_state(&self, vm: &str) -> BackendResult<VmPowerState>;
}

#[async_trait]
pub trait TaskClient: Send + Sync {
    async fn task_info(&self, task: &TaskHandle) -> BackendResult<TaskState>;
    async fn cancel_task(&self, task: &TaskHandle) -> BackendResult<()>;
}

#[derive(Clone)]
pub struct VsphereClients {
    pub inventory: Arc<dyn InventoryClient>,
    pub vms: Arc<dyn VmClient>,
    pub tasks: Arc<dyn TaskClient>,
}

impl VsphereClients {
    pub fn from_shared<C>(client: Arc<C>) -> Self
    where
        C: InventoryClient + VmClient + TaskClient + 'static,
    {
        Self {
            inventory: client.clone(),
            vms: client.clone(),
            tasks: client,
        }
    }
}

impl std::fmt::Debug for VsphereClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VsphereClients").finish_non_exhaustive()
    }
}

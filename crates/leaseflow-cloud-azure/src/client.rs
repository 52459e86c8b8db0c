//! Narrow Azure Resource Manager client interfaces
//!
//! Long-running ARM operations complete before these calls return; the
//! adapter only polls VM instance views for power state.

use async_trait::async_trait;
use leaseflow_cloud::BackendResult;
use std::collections::BTreeMap;
use std::sync::Arc;

pub type Tags = BTreeMap<String, String>;

/// Marketplace image reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub publisher: String,
    pub offer: String,
    pub sku: String,
    pub version: String,
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}:{}", self.publisher, self.offer, self.sku, self.version)
    }
}

/// Inbound allow rule on the deployment's NSG
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityRule {
    pub name: String,
    pub priority: u16,
    /// `Tcp`, `Udp` or `*`
    pub protocol: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicIp {
    pub id: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NicRequest {
    pub subnet_id: String,
    pub nsg_id: String,
    pub public_ip_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDisk {
    pub disk_id: String,
    pub lun: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRequest {
    pub name: String,
    pub size: String,
    pub image: ImageReference,
    pub nic_id: String,
    pub admin_username: String,
    pub data_disks: Vec<DataDisk>,
    pub tags: Tags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningState {
    Creating,
    Updating,
    Succeeded,
    Failed,
    Deleting,
}

impl ProvisioningState {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "creating" => Some(Self::Creating),
            "updating" => Some(Self::Updating),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "deleting" => Some(Self::Deleting),
            _ => None,
        }
    }
}

/// VM power state as reported in the instance view (`PowerState/<code>`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Deallocating,
    Deallocated,
    Unknown,
}

impl PowerState {
    pub fn parse(code: &str) -> Self {
        match code.strip_prefix("PowerState/").unwrap_or(code) {
            "starting" => Self::Starting,
            "running" => Self::Running,
            "stopping" => Self::Stopping,
            "stopped" => Self::Stopped,
            "deallocating" => Self::Deallocating,
            "deallocated" => Self::Deallocated,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceView {
    pub provisioning: ProvisioningState,
    /// Absent while the VM is still being created
    pub power: Option<PowerState>,
}

#[async_trait]
pub trait ResourceGroupClient: Send + Sync {
    async fn create_resource_group(
        &self,
        name: &str,
        location: &str,
        tags: &Tags,
    ) -> BackendResult<()>;
    async fn resource_group_exists(&self, name: &str) -> BackendResult<bool>;
    /// Deletes the group and everything in it
    async fn delete_resource_group(&self, name: &str) -> BackendResult<()>;
}

#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Creates the VNet with one subnet; returns the subnet id
    async fn create_vnet(
        &self,
        group: &str,
        name: &str,
        cidr: &str,
        subnet_cidr: &str,
        tags: &Tags,
    ) -> BackendResult<String>;
    async fn delete_vnet(&self, group: &str, name: &str) -> BackendResult<()>;

    async fn create_nsg(
        &self,
        group: &str,
        name: &str,
        rules: &[SecurityRule],
        tags: &Tags,
    ) -> BackendResult<String>;
    async fn delete_nsg(&self, group: &str, name: &str) -> BackendResult<()>;

    async fn create_public_ip(&self, group: &str, name: &str, tags: &Tags)
    -> BackendResult<PublicIp>;
    async fn delete_public_ip(&self, group: &str, name: &str) -> BackendResult<()>;

    async fn create_nic(
        &self,
        group: &str,
        name: &str,
        request: &NicRequest,
        tags: &Tags,
    ) -> BackendResult<String>;
    async fn delete_nic(&self, group: &str, name: &str) -> BackendResult<()>;
}

#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn create_disk(
        &self,
        group: &str,
        name: &str,
        size_gib: u32,
        tags: &Tags,
    ) -> BackendResult<String>;
    async fn delete_disk(&self, group: &str, name: &str) -> BackendResult<()>;
}

#[async_trait]
pub trait ComputeClient: Send + Sync {
    /// Returns the VM resource id
    async fn create_vm(&self, group: &str, request: &VmRequest) -> BackendResult<String>;
    async fn instance_view(&self, group: &str, name: &str) -> BackendResult<InstanceView>;
    async fn start_vm(&self, group: &str, name: &str) -> BackendResult<()>;
    async fn power_off_vm(&self, group: &str, name: &str) -> BackendResult<()>;
    async fn delete_vm(&self, group: &str, name: &str) -> BackendResult<()>;
}

#[derive(Clone)]
pub struct AzureClients {
    pub groups: Arc<dyn ResourceGroupClient>,
    pub network: Arc<dyn NetworkClient>,
    pub storage: Arc<dyn StorageClient>,
    pub compute: Arc<dyn ComputeClient>,
}

impl AzureClients {
    pub fn from_shared<C>(client: Arc<C>) -> Self
    where
        C: ResourceGroupClient + NetworkClient + StorageClient + ComputeClient + 'static,
    {
        Self {
            groups: client.clone(),
            network: client.clone(),
            storage: client.clone(),
            compute: client,
        }
    }
}

impl std::fmt::Debug for AzureClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AzureClients").finish_non_exhaustive()
    }
}

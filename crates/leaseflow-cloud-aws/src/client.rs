//! Narrow EC2 client interfaces
//!
//! One trait per concern. The adapter depends only on these; the SDK
//! implementation lives behind the `sdk` feature and the in-memory one in
//! [`crate::testing`].

use async_trait::async_trait;
use leaseflow_cloud::BackendResult;
use std::collections::BTreeMap;
use std::sync::Arc;

pub type Tags = BTreeMap<String, String>;

/// Ingress rule opened on the deployment's security group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressRule {
    pub protocol: String,
    pub port: u16,
    pub cidr: String,
}

/// Elastic IP allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub allocation_id: String,
    pub public_ip: String,
}

/// EC2 instance lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
}

impl InstanceState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "shutting-down" => Some(Self::ShuttingDown),
            "terminated" => Some(Self::Terminated),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub state: InstanceState,
    pub private_ip: Option<String>,
    pub public_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRequest {
    pub name: String,
    pub image_id: String,
    pub instance_type: String,
    pub subnet_id: String,
    pub security_group_ids: Vec<String>,
    pub key_name: Option<String>,
    pub tags: Tags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeState {
    Creating,
    Available,
    InUse,
    Deleting,
    Deleted,
    Error,
}

impl VolumeState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "creating" => Some(Self::Creating),
            "available" => Some(Self::Available),
            "in-use" => Some(Self::InUse),
            "deleting" => Some(Self::Deleting),
            "deleted" => Some(Self::Deleted),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// VPC, subnet, security group and Elastic IP calls
#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn create_vpc(&self, cidr: &str, tags: &Tags) -> BackendResult<String>;
    async fn delete_vpc(&self, vpc_id: &str) -> BackendResult<()>;

    async fn create_subnet(
        &self,
        vpc_id: &str,
        cidr: &str,
        availability_zone: &str,
        tags: &Tags,
    ) -> BackendResult<String>;
    async fn delete_subnet(&self, subnet_id: &str) -> BackendResult<()>;

    async fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        tags: &Tags,
    ) -> BackendResult<String>;
    async fn authorize_ingress(&self, group_id: &str, rules: &[IngressRule]) -> BackendResult<()>;
    async fn delete_security_group(&self, group_id: &str) -> BackendResult<()>;

    async fn allocate_address(&self, tags: &Tags) -> BackendResult<Address>;
    /// Returns the association id
    async fn associate_address(&self, allocation_id: &str, instance_id: &str)
    -> BackendResult<String>;
    async fn disassociate_address(&self, association_id: &str) -> BackendResult<()>;
    async fn release_address(&self, allocation_id: &str) -> BackendResult<()>;
}

/// EBS volume calls
#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn create_volume(
        &self,
        size_gib: u32,
        availability_zone: &str,
        tags: &Tags,
    ) -> BackendResult<String>;
    async fn volume_state(&self, volume_id: &str) -> BackendResult<VolumeState>;
    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> BackendResult<()>;
    async fn detach_volume(&self, volume_id: &str) -> BackendResult<()>;
    async fn delete_volume(&self, volume_id: &str) -> BackendResult<()>;
}

/// Instance calls
#[async_trait]
pub trait ComputeClient: Send + Sync {
    /// Returns the instance id
    async fn run_instance(&self, request: &InstanceRequest) -> BackendResult<String>;
    async fn describe_instance(&self, instance_id: &str) -> BackendResult<InstanceInfo>;
    /// Id of a live (not terminated) instance tagged `Name=<name>`
    async fn find_instance(&self, name: &str) -> BackendResult<Option<String>>;
    async fn start_instances(&self, instance_ids: &[String]) -> BackendResult<()>;
    async fn stop_instances(&self, instance_ids: &[String]) -> BackendResult<()>;
    async fn terminate_instances(&self, instance_ids: &[String]) -> BackendResult<()>;
}

/// The client set one adapter is constructed with
#[derive(Clone)]
pub struct Ec2Clients {
    pub network: Arc<dyn NetworkClient>,
    pub storage: Arc<dyn StorageClient>,
    pub compute: Arc<dyn ComputeClient>,
}

impl Ec2Clients {
    pub fn new(
        network: Arc<dyn NetworkClient>,
        storage: Arc<dyn StorageClient>,
        compute: Arc<dyn ComputeClient>,
    ) -> Self {
        Self {
            network,
            storage,
            compute,
        }
    }

    /// All three concerns served by one implementation
    pub fn from_shared<C>(client: Arc<C>) -> Self
    where
        C: NetworkClient + StorageClient + ComputeClient + 'static,
    {
        Self {
            network: client.clone(),
            storage: client.clone(),
            compute: client,
        }
    }
}

impl std::fmt::Debug for Ec2Clients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ec2Clients").finish_non_exhaustive()
    }
}

//! Narrow Kubernetes API interfaces, one per concern

use async_trait::async_trait;
use leaseflow_cloud::{BackendResult, RegistryCredentials};
use std::collections::BTreeMap;
use std::sync::Arc;

pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceType {
    ClusterIp,
    LoadBalancer,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClusterIp => "ClusterIP",
            Self::LoadBalancer => "LoadBalancer",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadWriteOnce,
    ReadWriteMany,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PvcRequest {
    pub name: String,
    pub size_gib: u32,
    pub storage_class: Option<String>,
    pub access_mode: AccessMode,
    pub labels: Labels,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerPort {
    pub name: String,
    pub port: u16,
    /// `TCP` or `UDP`
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    pub claim: String,
    pub mount_path: String,
}

/// Limits use Kubernetes quantity strings (`500m`, `256Mi`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerLimits {
    pub cpu: String,
    pub memory: String,
    /// `nvidia.com/gpu` count
    pub gpu: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRequest {
    pub name: String,
    pub labels: Labels,
    /// Pod selector, a subset of `labels`
    pub selector: Labels,
    pub image: String,
    pub replicas: u32,
    pub limits: ContainerLimits,
    pub ports: Vec<ContainerPort>,
    pub volumes: Vec<VolumeMount>,
    pub image_pull_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRequest {
    pub name: String,
    pub kind: ServiceType,
    pub selector: Labels,
    pub ports: Vec<ContainerPort>,
    pub labels: Labels,
}

/// Ingress restricted to pods of the namespace plus the exposed ports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPolicyRequest {
    pub name: String,
    pub exposed: Vec<ContainerPort>,
    pub labels: Labels,
}

/// Rollout status of one Deployment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentStatus {
    /// `spec.replicas`
    pub desired: u32,
    /// `status.readyReplicas`
    pub ready: u32,
    /// Reason from a `Progressing=False` condition, e.g. ProgressDeadlineExceeded
    pub failure: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespacePhase {
    Active,
    Terminating,
}

#[async_trait]
pub trait NamespaceClient: Send + Sync {
    async fn create_namespace(&self, name: &str, labels: &Labels) -> BackendResult<()>;
    /// `None` once the namespace is gone
    async fn namespace_phase(&self, name: &str) -> BackendResult<Option<NamespacePhase>>;
    async fn delete_namespace(&self, name: &str) -> BackendResult<()>;
}

#[async_trait]
pub trait SecretClient: Send + Sync {
    /// Create a `kubernetes.io/dockerconfigjson` Secret
    async fn create_registry_secret(
        &self,
        namespace: &str,
        name: &str,
        credentials: &RegistryCredentials,
        labels: &Labels,
    ) -> BackendResult<()>;
}

#[async_trait]
pub trait StorageClient: Send + Sync {
    async fn create_pvc(&self, namespace: &str, request: &PvcRequest) -> BackendResult<()>;
}

#[async_trait]
pub trait WorkloadClient: Send + Sync {
    async fn create_deployment(
        &self,
        namespace: &str,
        request: &DeploymentRequest,
    ) -> BackendResult<()>;
    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: u32)
    -> BackendResult<()>;
    async fn deployment_status(&self, namespace: &str, name: &str)
    -> BackendResult<DeploymentStatus>;
}

#[async_trait]
pub trait NetworkClient: Send + Sync {
    async fn create_service(&self, namespace: &str, request: &ServiceRequest) -> BackendResult<()>;
    /// External address of a LoadBalancer Service, once assigned
    async fn load_balancer_ingress(&self, namespace: &str, name: &str)
    -> BackendResult<Option<String>>;
    async fn create_network_policy(
        &self,
        namespace: &str,
        request: &NetworkPolicyRequest,
    ) -> BackendResult<()>;
}

#[derive(Clone)]
pub struct KubeClients {
    pub namespaces: Arc<dyn NamespaceClient>,
    pub secrets: Arc<dyn SecretClient>,
    pub storage: Arc<dyn StorageClient>,
    pub workloads: Arc<dyn WorkloadClient>,
    pub network: Arc<dyn NetworkClient>,
}

impl KubeClients {
    pub fn from_shared<C>(client: Arc<C>) -> Self
    where
        C: NamespaceClient + SecretClient + StorageClient + WorkloadClient + NetworkClient + 'static,
    {
        Self {
            namespaces: client.clone(),
            secrets: client.clone(),
            storage: client.clone(),
            workloads: client.clone(),
            network: client,
        }
    }
}

impl std::fmt::Debug for KubeClients {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClients").finish_non_exhaustive()
    }
}

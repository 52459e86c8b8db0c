//! leaseflow Kubernetes adapter
//!
//! Runs container services as Deployments. Each deployment gets its own
//! namespace `<prefix><deployment>`; terminating deletes the namespace and
//! waits until the API server confirms it is gone.

pub mod adapter;
pub mod client;
pub mod error;
pub mod plan;
pub mod resources;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use adapter::{K8sAdapter, translate};
pub use client::{
    DeploymentRequest, DeploymentStatus, KubeClients, NamespaceClient, NamespacePhase,
    NetworkClient, SecretClient, ServiceRequest, ServiceType, StorageClient, WorkloadClient,
};
pub use plan::K8sPlan;
pub use resources::K8sResources;

//! Workload handle and deployment options

use crate::state::WorkloadState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tag key carrying the deployment id on every native resource
pub const DEPLOYMENT_TAG: &str = "leaseflow/deployment";

/// Tag key carrying the lease id on every native resource
pub const LEASE_TAG: &str = "leaseflow/lease";

/// Provisioning backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Aws,
    Azure,
    Vmware,
    Kubernetes,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Azure => "azure",
            Self::Vmware => "vmware",
            Self::Kubernetes => "kubernetes",
        }
    }

    /// Prefix of the workload ids this backend assigns
    pub fn id_prefix(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Azure => "az",
            Self::Vmware => "vs",
            Self::Kubernetes => "k8s",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "aws" | "ec2" => Some(Self::Aws),
            "azure" => Some(Self::Azure),
            "vmware" | "vsphere" => Some(Self::Vmware),
            "kubernetes" | "k8s" => Some(Self::Kubernetes),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque workload handle, unique per backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadId(String);

impl WorkloadId {
    /// Id assigned to the workload created for `deployment_id`
    pub fn for_deployment(backend: BackendKind, deployment_id: &str) -> Self {
        Self(format!("{}-{}", backend.id_prefix(), deployment_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for WorkloadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for WorkloadId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Backend-specific identifiers, never interpreted outside the owning adapter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendRef(BTreeMap<String, String>);

impl BackendRef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

/// Canonical runtime entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Workload {
    pub id: WorkloadId,
    pub backend: BackendKind,
    pub deployment_id: String,
    pub lease_id: String,
    pub state: WorkloadState,
    pub backend_ref: BackendRef,
    pub public_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Image pull credentials handed to backends that run containers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredentials {
    pub server: String,
    pub username: String,
    pub password: String,
}

/// Per-call provisioning knobs
///
/// These change provisioning policy, never the canonical state model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentOptions {
    /// Allocate a public address (Elastic IP, Azure Public IP, LoadBalancer)
    pub assign_public_ip: bool,
    /// Replica count for container backends
    pub replicas: u32,
    /// Restrict ingress to exposed ports (Kubernetes NetworkPolicy)
    pub network_isolation: bool,
    pub registry_credentials: Option<RegistryCredentials>,
    /// Extra tags applied to every native resource
    pub tags: BTreeMap<String, String>,
}

impl Default for DeploymentOptions {
    fn default() -> Self {
        Self {
            assign_public_ip: false,
            replicas: 1,
            network_isolation: false,
            registry_credentials: None,
            tags: BTreeMap::new(),
        }
    }
}

impl DeploymentOptions {
    pub fn with_public_ip(mut self) -> Self {
        self.assign_public_ip = true;
        self
    }

    /// Tags for native resources of one deployment
    pub fn resource_tags(&self, deployment_id: &str, lease_id: &str) -> BTreeMap<String, String> {
        let mut tags = self.tags.clone();
        tags.insert(DEPLOYMENT_TAG.to_string(), deployment_id.to_string());
        tags.insert(LEASE_TAG.to_string(), lease_id.to_string());
        tags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workload_id_prefix() {
        let id = WorkloadId::for_deployment(BackendKind::Kubernetes, "dep-42");
        assert_eq!(id.as_str(), "k8s-dep-42");
        assert_eq!(
            WorkloadId::for_deployment(BackendKind::Azure, "x").as_str(),
            "az-x"
        );
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!(BackendKind::parse("vSphere"), Some(BackendKind::Vmware));
        assert_eq!(BackendKind::parse("k8s"), Some(BackendKind::Kubernetes));
        assert_eq!(BackendKind::parse("gcp"), None);
    }

    #[test]
    fn test_resource_tags_include_identity() {
        let mut options = DeploymentOptions::default();
        options.tags.insert("team".into(), "ml".into());
        let tags = options.resource_tags("dep-1", "lease-9");
        assert_eq!(tags.get(DEPLOYMENT_TAG).map(String::as_str), Some("dep-1"));
        assert_eq!(tags.get(LEASE_TAG).map(String::as_str), Some("lease-9"));
        assert_eq!(tags.get("team").map(String::as_str), Some("ml"));
    }

    #[test]
    fn test_default_replicas() {
        assert_eq!(DeploymentOptions::default().replicas, 1);
    }
}

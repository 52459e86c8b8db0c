//! Kubernetes objects created for one deployment
//!
//! Everything lives in the deployment's namespace, so releasing is a
//! single namespace delete. The rest is kept for status and scaling.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct K8sResources {
    /// Set only when the adapter created the namespace
    pub namespace: Option<String>,
    pub secret: Option<String>,
    pub pvcs: Vec<String>,
    pub deployments: Vec<DeploymentRecord>,
    pub services: Vec<String>,
    pub network_policy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentRecord {
    pub name: String,
    /// Replica count to restore on resume and start
    pub replicas: u32,
}

impl K8sResources {
    pub fn is_empty(&self) -> bool {
        self.namespace.is_none()
    }
}

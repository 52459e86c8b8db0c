//! In-memory API server for tests
//!
//! Objects are grouped by namespace. Deployments reach their replica count
//! after a configurable number of status reads, and a deleted namespace
//! stays `Terminating` for a while before it and its children disappear.

use crate::client::{
    DeploymentRequest, DeploymentStatus, Labels, NamespaceClient, NamespacePhase,
    NetworkClient, NetworkPolicyRequest, PvcRequest, SecretClient, ServiceRequest, ServiceType,
    StorageClient, WorkloadClient,
};
use crate::error::from_status;
use async_trait::async_trait;
use leaseflow_cloud::testing::Faults;
use leaseflow_cloud::{BackendError, BackendResult, DEPLOYMENT_TAG, RegistryCredentials};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct FakeDeployment {
    request: DeploymentRequest,
    desired: u32,
    ready: u32,
    /// Status reads left before `ready` catches up
    settle: u32,
    failure: Option<String>,
}

#[derive(Debug, Default)]
struct FakeNamespace {
    labels: Labels,
    /// Reads left while terminating
    terminating: Option<u32>,
    secrets: BTreeMap<String, RegistryCredentials>,
    pvcs: BTreeMap<String, PvcRequest>,
    deployments: BTreeMap<String, FakeDeployment>,
    services: BTreeMap<String, ServiceRequest>,
    policies: BTreeMap<String, NetworkPolicyRequest>,
}

#[derive(Debug, Default)]
struct State {
    namespaces: BTreeMap<String, FakeNamespace>,
    pending_polls: u32,
    deletion_polls: u32,
    next_ip: u8,
    failing_rollouts: BTreeMap<String, String>,
}

fn not_found(kind: &str, name: &str) -> BackendError {
    from_status(404, "NotFound", format!("{} \"{}\" not found", kind, name))
}

fn already_exists(kind: &str, name: &str) -> BackendError {
    from_status(409, "AlreadyExists", format!("{} \"{}\" already exists", kind, name))
}

#[derive(Debug, Default)]
pub struct FakeKube {
    state: Mutex<State>,
    pub faults: Faults,
}

impl FakeKube {
    pub fn new() -> Self {
        Self::default()
    }

    /// Status reads before a Deployment's replicas are ready
    pub fn with_pending_polls(self, polls: u32) -> Self {
        self.lock().pending_polls = polls;
        self
    }

    /// Phase reads a deleted namespace stays Terminating
    pub fn with_deletion_polls(self, polls: u32) -> Self {
        self.lock().deletion_polls = polls;
        self
    }

    /// Pre-create a namespace, as another tenant would
    pub fn with_namespace(self, name: &str) -> Self {
        self.lock()
            .namespaces
            .insert(name.to_string(), FakeNamespace::default());
        self
    }

    /// Deployments named `name` never become ready
    pub fn fail_rollout(&self, name: &str, reason: &str) {
        self.lock()
            .failing_rollouts
            .insert(name.to_string(), reason.to_string());
    }

    pub fn has_namespace(&self, name: &str) -> bool {
        self.lock().namespaces.contains_key(name)
    }

    /// Namespaces labelled with `deployment_id`
    pub fn tagged_resources(&self, deployment_id: &str) -> Vec<String> {
        self.lock()
            .namespaces
            .iter()
            .filter(|(_, ns)| {
                ns.labels.get(DEPLOYMENT_TAG).map(String::as_str) == Some(deployment_id)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn deployment(&self, ns: &str, name: &str) -> Option<DeploymentRequest> {
        self.with_ns(ns, |n| n.deployments.get(name).map(|d| d.request.clone()))
    }

    /// `spec.replicas` of a Deployment
    pub fn replicas(&self, ns: &str, name: &str) -> Option<u32> {
        self.with_ns(ns, |n| n.deployments.get(name).map(|d| d.desired))
    }

    pub fn service(&self, ns: &str, name: &str) -> Option<ServiceRequest> {
        self.with_ns(ns, |n| n.services.get(name).cloned())
    }

    pub fn pvc(&self, ns: &str, name: &str) -> Option<PvcRequest> {
        self.with_ns(ns, |n| n.pvcs.get(name).cloned())
    }

    pub fn has_secret(&self, ns: &str, name: &str) -> bool {
        self.with_ns(ns, |n| n.secrets.contains_key(name).then_some(()))
            .is_some()
    }

    pub fn network_policy(&self, ns: &str, name: &str) -> Option<NetworkPolicyRequest> {
        self.with_ns(ns, |n| n.policies.get(name).cloned())
    }

    /// Scale a Deployment out of band; it settles immediately
    pub fn set_replicas(&self, ns: &str, name: &str, replicas: u32) {
        let mut state = self.lock();
        if let Some(d) = state
            .namespaces
            .get_mut(ns)
            .and_then(|n| n.deployments.get_mut(name))
        {
            d.desired = replicas;
            d.ready = replicas;
            d.settle = 0;
        }
    }

    pub fn delete_namespace_out_of_band(&self, name: &str) {
        self.lock().namespaces.remove(name);
    }

    fn with_ns<T>(&self, ns: &str, f: impl FnOnce(&FakeNamespace) -> Option<T>) -> Option<T> {
        self.lock().namespaces.get(ns).and_then(f)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mutable access to an active namespace
    fn active<T>(
        &self,
        ns: &str,
        f: impl FnOnce(&mut FakeNamespace, u32) -> BackendResult<T>,
    ) -> BackendResult<T> {
        let mut state = self.lock();
        let polls = state.pending_polls;
        let namespace = state
            .namespaces
            .get_mut(ns)
            .ok_or_else(|| not_found("namespaces", ns))?;
        if namespace.terminating.is_some() {
            return Err(from_status(
                403,
                "Forbidden",
                format!("unable to create new content in namespace {} because it is being terminated", ns),
            ));
        }
        f(namespace, polls)
    }
}

#[async_trait]
impl NamespaceClient for FakeKube {
    async fn create_namespace(&self, name: &str, labels: &Labels) -> BackendResult<()> {
        self.faults.enter("create_namespace").await?;
        let mut state = self.lock();
        if state.namespaces.contains_key(name) {
            return Err(already_exists("namespaces", name));
        }
        state.namespaces.insert(
            name.to_string(),
            FakeNamespace {
                labels: labels.clone(),
                ..FakeNamespace::default()
            },
        );
        Ok(())
    }

    async fn namespace_phase(&self, name: &str) -> BackendResult<Option<NamespacePhase>> {
        self.faults.enter("namespace_phase").await?;
        let mut state = self.lock();
        let Some(terminating) = state.namespaces.get(name).map(|ns| ns.terminating) else {
            return Ok(None);
        };
        match terminating {
            None => Ok(Some(NamespacePhase::Active)),
            Some(0) => {
                state.namespaces.remove(name);
                Ok(None)
            }
            Some(n) => {
                if let Some(ns) = state.namespaces.get_mut(name) {
                    ns.terminating = Some(n - 1);
                }
                Ok(Some(NamespacePhase::Terminating))
            }
        }
    }

    async fn delete_namespace(&self, name: &str) -> BackendResult<()> {
        self.faults.enter("delete_namespace").await?;
        let mut state = self.lock();
        let polls = state.deletion_polls;
        let ns = state
            .namespaces
            .get_mut(name)
            .ok_or_else(|| not_found("namespaces", name))?;
        if ns.terminating.is_none() {
            ns.terminating = Some(polls);
        }
        Ok(())
    }
}

#[async_trait]
impl SecretClient for FakeKube {
    async fn create_registry_secret(
        &self,
        namespace: &str,
        name: &str,
        credentials: &RegistryCredentials,
        _labels: &Labels,
    ) -> BackendResult<()> {
        self.faults.enter("create_registry_secret").await?;
        self.active(namespace, |ns, _| {
            if ns.secrets.contains_key(name) {
                return Err(already_exists("secrets", name));
            }
            ns.secrets.insert(name.to_string(), credentials.clone());
            Ok(())
        })
    }
}

#[async_trait]
impl StorageClient for FakeKube {
    async fn create_pvc(&self, namespace: &str, request: &PvcRequest) -> BackendResult<()> {
        self.faults.enter("create_pvc").await?;
        self.active(namespace, |ns, _| {
            if ns.pvcs.contains_key(&request.name) {
                return Err(already_exists("persistentvolumeclaims", &request.name));
            }
            ns.pvcs.insert(request.name.clone(), request.clone());
            Ok(())
        })
    }
}

#[async_trait]
impl WorkloadClient for FakeKube {
    async fn create_deployment(
        &self,
        namespace: &str,
        request: &DeploymentRequest,
    ) -> BackendResult<()> {
        self.faults.enter("create_deployment").await?;
        let failure = self.lock().failing_rollouts.get(&request.name).cloned();
        self.active(namespace, |ns, polls| {
            if ns.deployments.contains_key(&request.name) {
                return Err(already_exists("deployments.apps", &request.name));
            }
            if let Some(claim) = request
                .volumes
                .iter()
                .find(|v| !ns.pvcs.contains_key(&v.claim))
            {
                return Err(from_status(
                    422,
                    "Invalid",
                    format!("persistentvolumeclaim \"{}\" not found", claim.claim),
                ));
            }
            ns.deployments.insert(
                request.name.clone(),
                FakeDeployment {
                    request: request.clone(),
                    desired: request.replicas,
                    ready: 0,
                    settle: polls,
                    failure,
                },
            );
            Ok(())
        })
    }

    async fn scale_deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: u32,
    ) -> BackendResult<()> {
        self.faults.enter("scale_deployment").await?;
        self.active(namespace, |ns, polls| {
            let d = ns
                .deployments
                .get_mut(name)
                .ok_or_else(|| not_found("deployments.apps", name))?;
            d.desired = replicas;
            d.settle = polls;
            Ok(())
        })
    }

    async fn deployment_status(
        &self,
        namespace: &str,
        name: &str,
    ) -> BackendResult<DeploymentStatus> {
        self.faults.enter("deployment_status").await?;
        let mut state = self.lock();
        let d = state
            .namespaces
            .get_mut(namespace)
            .and_then(|ns| ns.deployments.get_mut(name))
            .ok_or_else(|| not_found("deployments.apps", name))?;
        if d.failure.is_none() && d.ready != d.desired {
            if d.settle == 0 {
                d.ready = d.desired;
            } else {
                d.settle -= 1;
            }
        }
        Ok(DeploymentStatus {
            desired: d.desired,
            ready: d.ready,
            failure: d.failure.clone(),
        })
    }
}

#[async_trait]
impl NetworkClient for FakeKube {
    async fn create_service(&self, namespace: &str, request: &ServiceRequest) -> BackendResult<()> {
        self.faults.enter("create_service").await?;
        self.active(namespace, |ns, _| {
            if ns.services.contains_key(&request.name) {
                return Err(already_exists("services", &request.name));
            }
            ns.services.insert(request.name.clone(), request.clone());
            Ok(())
        })
    }

    async fn load_balancer_ingress(
        &self,
        namespace: &str,
        name: &str,
    ) -> BackendResult<Option<String>> {
        self.faults.enter("load_balancer_ingress").await?;
        let mut state = self.lock();
        let is_lb = state
            .namespaces
            .get(namespace)
            .and_then(|ns| ns.services.get(name))
            .ok_or_else(|| not_found("services", name))?
            .kind
            == ServiceType::LoadBalancer;
        if !is_lb {
            return Ok(None);
        }
        state.next_ip = state.next_ip.wrapping_add(1);
        Ok(Some(format!("203.0.113.{}", state.next_ip)))
    }

    async fn create_network_policy(
        &self,
        namespace: &str,
        request: &NetworkPolicyRequest,
    ) -> BackendResult<()> {
        self.faults.enter("create_network_policy").await?;
        self.active(namespace, |ns, _| {
            ns.policies.insert(request.name.clone(), request.clone());
            Ok(())
        })
    }
}

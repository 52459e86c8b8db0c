//! Kubernetes workload adapter

use crate::client::{DeploymentStatus, KubeClients, NamespacePhase, ServiceType};
use crate::plan::{K8sPlan, REGISTRY_SECRET};
use crate::resources::{DeploymentRecord, K8sResources};
use async_trait::async_trait;
use leaseflow_cloud::{
    AdapterCore, BackendError, BackendErrorKind, BackendKind, CloudError, DeploymentOptions,
    Observed, OperationContext, Reporter, Result, UsageRecord, Workload, WorkloadAdapter,
    WorkloadId, WorkloadState, poll_until,
};
use leaseflow_config::KubernetesSettings;
use leaseflow_core::Manifest;
use std::time::Duration;

/// Runs container services as Deployments in one namespace per deployment
///
/// Pause, resume, stop and start scale replicas to zero and back.
pub struct K8sAdapter {
    kube: KubeClients,
    settings: KubernetesSettings,
    core: AdapterCore<K8sResources>,
}

impl K8sAdapter {
    pub fn new(kube: KubeClients, settings: KubernetesSettings, reporter: Reporter) -> Self {
        let core = AdapterCore::new(BackendKind::Kubernetes, reporter, settings.retry.clone());
        Self {
            kube,
            settings,
            core,
        }
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.core = self.core.with_teardown_timeout(timeout);
        self
    }

    pub fn resources(&self, id: &WorkloadId) -> Result<K8sResources> {
        self.core.resources(id)
    }

    async fn provision(
        &self,
        ctx: &OperationContext,
        id: &WorkloadId,
        plan: &K8sPlan,
        options: &DeploymentOptions,
    ) -> Result<()> {
        let ns = plan.namespace.as_str();
        self.core
            .call(ctx, "CreateNamespace", || {
                self.kube.namespaces.create_namespace(ns, &plan.labels)
            })
            .await
            .map_err(|e| e.at_step("namespace"))?;
        self.core.update(id, |r, w| {
            r.namespace = Some(ns.to_string());
            w.backend_ref.insert("namespace", ns);
        })?;
        tracing::info!(workload_id = %id, namespace = ns, "namespace created");

        if let Some(credentials) = &options.registry_credentials {
            self.core
                .call(ctx, "CreateSecret", || {
                    self.kube.secrets.create_registry_secret(
                        ns,
                        REGISTRY_SECRET,
                        credentials,
                        &plan.labels,
                    )
                })
                .await
                .map_err(|e| e.at_step("registry secret"))?;
            self.core
                .update(id, |r, _| r.secret = Some(REGISTRY_SECRET.to_string()))?;
        }

        for pvc in &plan.pvcs {
            self.core
                .call(ctx, "CreatePersistentVolumeClaim", || {
                    self.kube.storage.create_pvc(ns, pvc)
                })
                .await
                .map_err(|e| e.at_step(format!("pvc {}", pvc.name)))?;
            self.core.update(id, |r, _| r.pvcs.push(pvc.name.clone()))?;
        }

        for deployment in &plan.deployments {
            self.core
                .call(ctx, "CreateDeployment", || {
                    self.kube.workloads.create_deployment(ns, deployment)
                })
                .await
                .map_err(|e| e.at_step(format!("deployment {}", deployment.name)))?;
            self.core.update(id, |r, _| {
                r.deployments.push(DeploymentRecord {
                    name: deployment.name.clone(),
                    replicas: deployment.replicas,
                })
            })?;
        }

        for service in &plan.services {
            self.core
                .call(ctx, "CreateService", || {
                    self.kube.network.create_service(ns, service)
                })
                .await
                .map_err(|e| e.at_step(format!("service {}", service.name)))?;
            self.core
                .update(id, |r, _| r.services.push(service.name.clone()))?;
        }

        if let Some(policy) = &plan.network_policy {
            self.core
                .call(ctx, "CreateNetworkPolicy", || {
                    self.kube.network.create_network_policy(ns, policy)
                })
                .await
                .map_err(|e| e.at_step("network policy"))?;
            self.core
                .update(id, |r, _| r.network_policy = Some(policy.name.clone()))?;
        }

        let targets: Vec<(String, u32)> = plan
            .deployments
            .iter()
            .map(|d| (d.name.clone(), d.replicas))
            .collect();
        self.wait_for_rollout(ctx, ns, &targets)
            .await
            .map_err(|e| e.at_step("rollout"))?;

        if let Some(lb) = plan
            .services
            .iter()
            .find(|s| s.kind == ServiceType::LoadBalancer)
        {
            let address = self
                .wait_for_ingress(ctx, ns, &lb.name)
                .await
                .map_err(|e| e.at_step("load balancer"))?;
            self.core.update(id, |_, w| {
                w.public_ip = Some(address.clone());
                w.backend_ref.insert("load_balancer", &lb.name);
            })?;
        }
        Ok(())
    }

    /// Wait until each Deployment reports `ready == desired == target`
    async fn wait_for_rollout(
        &self,
        ctx: &OperationContext,
        ns: &str,
        targets: &[(String, u32)],
    ) -> Result<()> {
        for (name, target) in targets {
            let what = format!("deployment {}/{} at {} replicas", ns, name, target);
            let target = *target;
            poll_until(&self.settings.rollout, ctx, &what, || async move {
                let status = self
                    .core
                    .call(ctx, "GetDeployment", || {
                        self.kube.workloads.deployment_status(ns, name)
                    })
                    .await?;
                if let Some(reason) = &status.failure {
                    return Err(CloudError::backend(
                        "GetDeployment",
                        BackendError::new(
                            BackendErrorKind::Other,
                            format!("rollout of {} failed: {}", name, reason),
                        ),
                    ));
                }
                Ok((status.desired == target && status.ready == target).then_some(()))
            })
            .await?;
        }
        Ok(())
    }

    async fn wait_for_ingress(&self, ctx: &OperationContext, ns: &str, name: &str) -> Result<String> {
        let what = format!("service {}/{} ingress", ns, name);
        poll_until(&self.settings.rollout, ctx, &what, || async move {
            self.core
                .call(ctx, "GetService", || {
                    self.kube.network.load_balancer_ingress(ns, name)
                })
                .await
        })
        .await
    }

    /// Scale every Deployment to zero, or back to its recorded count
    async fn scale(&self, ctx: &OperationContext, res: &K8sResources, to_zero: bool) -> Result<()> {
        let Some(ns) = &res.namespace else {
            return Ok(());
        };
        let mut targets = Vec::with_capacity(res.deployments.len());
        for deployment in &res.deployments {
            let replicas = if to_zero { 0 } else { deployment.replicas };
            self.core
                .call(ctx, "ScaleDeployment", || {
                    self.kube
                        .workloads
                        .scale_deployment(ns, &deployment.name, replicas)
                })
                .await?;
            targets.push((deployment.name.clone(), replicas));
        }
        self.wait_for_rollout(ctx, ns, &targets).await
    }

    async fn release(&self, ctx: &OperationContext, res: K8sResources) -> (K8sResources, Result<()>) {
        let Some(ns) = res.namespace.clone() else {
            return (K8sResources::default(), Ok(()));
        };
        match self.delete_namespace(ctx, &ns).await {
            Ok(()) => {
                tracing::info!(namespace = %ns, "namespace deleted");
                (K8sResources::default(), Ok(()))
            }
            Err(e) => {
                tracing::warn!(namespace = %ns, error = %e, "namespace deletion incomplete");
                (res, Err(e))
            }
        }
    }

    /// Delete the namespace and wait until the API server no longer has it
    async fn delete_namespace(&self, ctx: &OperationContext, ns: &str) -> Result<()> {
        match self
            .core
            .call(ctx, "DeleteNamespace", || {
                self.kube.namespaces.delete_namespace(ns)
            })
            .await
        {
            Err(e) if e.is_backend_not_found() => return Ok(()),
            other => other?,
        }
        let what = format!("namespace {} deletion", ns);
        poll_until(&self.settings.namespace_deletion, ctx, &what, || async move {
            let phase = self
                .core
                .call(ctx, "GetNamespace", || self.kube.namespaces.namespace_phase(ns))
                .await?;
            Ok(phase.is_none().then_some(()))
        })
        .await
    }

    async fn observe(
        &self,
        ctx: &OperationContext,
        current: WorkloadState,
        res: &K8sResources,
    ) -> Result<Observed> {
        let Some(ns) = &res.namespace else {
            return Ok(Observed::Gone);
        };
        let phase = self
            .core
            .call(ctx, "GetNamespace", || self.kube.namespaces.namespace_phase(ns))
            .await?;
        match phase {
            None => return Ok(Observed::Gone),
            Some(NamespacePhase::Terminating) => return Ok(Observed::Transitional),
            Some(NamespacePhase::Active) => {}
        }

        let mut statuses = Vec::with_capacity(res.deployments.len());
        for deployment in &res.deployments {
            let status = match self
                .core
                .call(ctx, "GetDeployment", || {
                    self.kube.workloads.deployment_status(ns, &deployment.name)
                })
                .await
            {
                Ok(status) => Some(status),
                Err(e) if e.is_backend_not_found() => None,
                Err(e) => return Err(e),
            };
            statuses.push(status);
        }
        Ok(translate(&statuses, current))
    }
}

/// Map the Deployments of a namespace (`None` for one that is missing) to
/// one canonical state
///
/// Zero replicas means paused or stopped; which one cannot be told from
/// the API, so a recorded `Paused` is kept and anything else reads as
/// `Stopped`.
pub fn translate(statuses: &[Option<DeploymentStatus>], current: WorkloadState) -> Observed {
    let present: Vec<&DeploymentStatus> = statuses.iter().flatten().collect();
    if present.is_empty() {
        return Observed::Gone;
    }
    if present.len() < statuses.len() || present.iter().any(|s| s.failure.is_some()) {
        return Observed::Stable(WorkloadState::Failed);
    }

    if present.iter().all(|s| s.desired == 0) {
        if present.iter().all(|s| s.ready == 0) {
            let state = if current == WorkloadState::Paused {
                WorkloadState::Paused
            } else {
                WorkloadState::Stopped
            };
            return Observed::Stable(state);
        }
        return Observed::Transitional;
    }
    if present.iter().all(|s| s.desired > 0 && s.ready >= s.desired) {
        Observed::Stable(WorkloadState::Running)
    } else {
        // rolling out or scaling
        Observed::Transitional
    }
}

#[async_trait]
impl WorkloadAdapter for K8sAdapter {
    fn backend(&self) -> BackendKind {
        BackendKind::Kubernetes
    }

    async fn deploy(
        &self,
        ctx: &OperationContext,
        manifest: &Manifest,
        deployment_id: &str,
        lease_id: &str,
        options: &DeploymentOptions,
    ) -> Result<Workload> {
        let plan = K8sPlan::build(manifest, &self.settings, deployment_id, lease_id, options)?;

        self.core
            .deploy_with(
                manifest,
                deployment_id,
                lease_id,
                options,
                |id| async move { self.provision(ctx, &id, &plan, options).await },
                |teardown, res| async move { self.release(&teardown, res).await },
            )
            .await
    }

    async fn start(&self, ctx: &OperationContext, id: &WorkloadId) -> Result<()> {
        self.core
            .drive(id, WorkloadState::Running, "scaled up", |_, res| async move {
                self.scale(ctx, &res, false).await
            })
            .await
    }

    async fn stop(&self, ctx: &OperationContext, id: &WorkloadId) -> Result<()> {
        self.core
            .drive(id, WorkloadState::Stopped, "scaled to zero", |_, res| async move {
                self.scale(ctx, &res, true).await
            })
            .await
    }

    async fn pause(&self, ctx: &OperationContext, id: &WorkloadId) -> Result<()> {
        self.core
            .drive(id, WorkloadState::Paused, "scaled to zero", |_, res| async move {
                self.scale(ctx, &res, true).await
            })
            .await
    }

    async fn resume(&self, ctx: &OperationContext, id: &WorkloadId) -> Result<()> {
        self.core
            .drive(id, WorkloadState::Running, "scaled up", |_, res| async move {
                self.scale(ctx, &res, false).await
            })
            .await
    }

    async fn terminate(&self, ctx: &OperationContext, id: &WorkloadId) -> Result<()> {
        self.core
            .terminate_with(id, |res| self.release(ctx, res))
            .await
    }

    async fn get_status(&self, ctx: &OperationContext, id: &WorkloadId) -> Result<WorkloadState> {
        self.core
            .status_with(id, |workload, res| async move {
                self.observe(ctx, workload.state, &res).await
            })
            .await
    }

    async fn sample_usage(&self, _ctx: &OperationContext, id: &WorkloadId) -> Result<UsageRecord> {
        self.core.sample_usage(id, None)
    }

    fn workload(&self, id: &WorkloadId) -> Result<Workload> {
        self.core.workload(id)
    }

    fn workloads(&self) -> Vec<Workload> {
        self.core.workloads()
    }
}

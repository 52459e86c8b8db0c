//! vSphere VM clone workload adapter

use crate::client::{Placement, Tags, TaskHandle, TaskState, VmPowerState, VsphereClients};
use crate::error::from_fault;
use crate::plan::{ClonePlan, VspherePlan};
use crate::resources::{VmRecord, VsphereResources};
use async_trait::async_trait;
use leaseflow_cloud::{
    AdapterCore, BackendError, BackendErrorKind, BackendKind, BackendResult, CloudError,
    DeploymentOptions, Observed, OperationContext, Reporter, Result, UsageRecord, Workload,
    WorkloadAdapter, WorkloadId, WorkloadState, poll_until,
};
use leaseflow_config::VsphereSettings;
use leaseflow_core::Manifest;
use std::future::Future;
use std::time::Duration;

/// Grace period for the best-effort cancel of an abandoned task
const CANCEL_GRACE: Duration = Duration::from_secs(30);

/// Deploys each vm service as a clone of a named template
///
/// Every mutating vSphere call returns a task; an operation only returns
/// once all of its tasks reached a terminal state.
pub struct VsphereAdapter {
    vsphere: VsphereClients,
    settings: VsphereSettings,
    core: AdapterCore<VsphereResources>,
}

impl VsphereAdapter {
    pub fn new(vsphere: VsphereClients, settings: VsphereSettings, reporter: Reporter) -> Self {
        let core = AdapterCore::new(BackendKind::Vmware, reporter, settings.retry.clone());
        Self {
            vsphere,
            settings,
            core,
        }
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.core = self.core.with_teardown_timeout(timeout);
        self
    }

    pub fn resources(&self, id: &WorkloadId) -> Result<VsphereResources> {
        self.core.resources(id)
    }

    /// Poll a task until it succeeds or fails
    ///
    /// Returns the task result. If the wait ends early the task is asked to
    /// cancel, which the server may ignore.
    async fn await_task(
        &self,
        ctx: &OperationContext,
        operation: &str,
        task: &TaskHandle,
    ) -> Result<Option<String>> {
        let what = format!("{} task {}", operation, task);
        let outcome = poll_until(&self.settings.task_poll, ctx, &what, || async move {
            let state = self
                .core
                .call(ctx, "TaskInfo", || self.vsphere.tasks.task_info(task))
                .await?;
            match state {
                TaskState::Success(result) => Ok(Some(result)),
                TaskState::Error { fault, message } => {
                    Err(CloudError::backend(operation, from_fault(&fault, message)))
                }
                TaskState::Queued | TaskState::Running => Ok(None),
            }
        })
        .await;

        if let Err(e @ (CloudError::Timeout(_) | CloudError::Cancelled(_))) = &outcome {
            tracing::warn!(task = %task, operation, error = %e, "abandoning task, requesting cancel");
            let cancel_ctx = OperationContext::detached(CANCEL_GRACE);
            if let Err(e) = self
                .core
                .call(&cancel_ctx, "CancelTask", || self.vsphere.tasks.cancel_task(task))
                .await
            {
                tracing::debug!(task = %task, error = %e, "task cancel failed");
            }
        }
        outcome
    }

    /// Submit through `submit` and wait for the resulting task
    async fn run_task<F, Fut>(
        &self,
        ctx: &OperationContext,
        operation: &str,
        submit: F,
    ) -> Result<Option<String>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BackendResult<TaskHandle>>,
    {
        let task = self.core.call(ctx, operation, submit).await?;
        self.await_task(ctx, operation, &task).await
    }

    async fn provision(
        &self,
        ctx: &OperationContext,
        id: &WorkloadId,
        plan: &VspherePlan,
        tags: &Tags,
    ) -> Result<()> {
        let (templates, placement) = self
            .resolve(ctx, plan)
            .await
            .map_err(|e| e.at_step("inventory"))?;
        self.core.update(id, |r, w| {
            r.datacenter = Some(plan.placement.datacenter.clone());
            w.backend_ref.insert("datacenter", &plan.placement.datacenter);
        })?;

        for (clone, template) in plan.clones.iter().zip(&templates) {
            self.provision_vm(ctx, id, clone, template, &placement, tags)
                .await
                .map_err(|e| e.at_step(format!("vm {}", clone.service)))?;
        }
        Ok(())
    }

    async fn resolve(
        &self,
        ctx: &OperationContext,
        plan: &VspherePlan,
    ) -> Result<(Vec<String>, Placement)> {
        let datacenter = &plan.placement.datacenter;
        let mut templates = Vec::with_capacity(plan.clones.len());
        for clone in &plan.clones {
            let found = self
                .core
                .call(ctx, "FindTemplate", || {
                    self.vsphere.inventory.find_template(datacenter, &clone.template)
                })
                .await?;
            let Some(template) = found else {
                return Err(CloudError::invalid_spec(
                    BackendKind::Vmware,
                    format!(
                        "service '{}': template '{}' not found in {}",
                        clone.service, clone.template, datacenter
                    ),
                ));
            };
            templates.push(template);
        }

        let placement = self
            .core
            .call(ctx, "ResolvePlacement", || {
                self.vsphere.inventory.resolve_placement(&plan.placement)
            })
            .await?;
        Ok((templates, placement))
    }

    async fn provision_vm(
        &self,
        ctx: &OperationContext,
        id: &WorkloadId,
        clone: &ClonePlan,
        template: &str,
        placement: &Placement,
        tags: &Tags,
    ) -> Result<()> {
        let name = format!("{}-{}", id, clone.service);
        let mut vm_tags = tags.clone();
        vm_tags.insert("leaseflow/service".to_string(), clone.service.clone());

        // Recorded first so a clone that lands after an abandoned wait is
        // still found by name during rollback
        self.core.update(id, |r, _| {
            r.vms.push(VmRecord {
                service: clone.service.clone(),
                name: name.clone(),
                moref: None,
            })
        })?;

        let result = self
            .run_task(ctx, "CloneVM_Task", || {
                self.vsphere
                    .vms
                    .clone_vm(template, &name, placement, &vm_tags)
            })
            .await?;
        let Some(vm) = result else {
            return Err(CloudError::backend(
                "CloneVM_Task",
                BackendError::new(
                    BackendErrorKind::Other,
                    format!("clone of {} reported no VM", name),
                ),
            ));
        };
        self.core.update(id, |r, w| {
            if let Some(record) = r.vms.iter_mut().find(|v| v.name == name) {
                record.moref = Some(vm.clone());
            }
            w.backend_ref.insert(format!("vm/{}", clone.service), &vm);
        })?;
        tracing::info!(workload_id = %id, vm = %name, moref = %vm, template, "vm cloned");

        self.run_task(ctx, "ReconfigVM_Task", || {
            self.vsphere.vms.reconfigure_vm(&vm, &clone.hardware)
        })
        .await?;
        self.run_task(ctx, "PowerOnVM_Task", || self.vsphere.vms.power_on(&vm))
            .await?;
        Ok(())
    }

    /// Drive every VM to `target` power state
    async fn power(
        &self,
        ctx: &OperationContext,
        res: &VsphereResources,
        target: VmPowerState,
    ) -> Result<()> {
        for vm in res.morefs() {
            let current = self
                .core
                .call(ctx, "PowerState", || self.vsphere.vms.power_state(&vm))
                .await?;
            if current == target {
                continue;
            }
            let outcome = match target {
                VmPowerState::PoweredOn => {
                    self.run_task(ctx, "PowerOnVM_Task", || self.vsphere.vms.power_on(&vm))
                        .await
                }
                VmPowerState::PoweredOff => {
                    self.run_task(ctx, "PowerOffVM_Task", || self.vsphere.vms.power_off(&vm))
                        .await
                }
                VmPowerState::Suspended => {
                    self.run_task(ctx, "SuspendVM_Task", || self.vsphere.vms.suspend(&vm))
                        .await
                }
            };
            already_ok(outcome)?;
        }
        Ok(())
    }

    async fn release(
        &self,
        ctx: &OperationContext,
        mut res: VsphereResources,
    ) -> (VsphereResources, Result<()>) {
        let datacenter = res
            .datacenter
            .clone()
            .unwrap_or_else(|| self.settings.datacenter.clone());
        let mut errors = Vec::new();
        let mut kept = Vec::new();

        for mut vm in std::mem::take(&mut res.vms) {
            match self.destroy_vm(ctx, &datacenter, &mut vm).await {
                Ok(()) => {}
                Err(e) => {
                    tracing::warn!(vm = %vm.name, error = %e, "vm destroy failed");
                    errors.push(e);
                    kept.push(vm);
                }
            }
        }
        res.vms = kept;

        match errors.into_iter().next() {
            Some(e) => (res, Err(e)),
            None => (VsphereResources::default(), Ok(())),
        }
    }

    async fn destroy_vm(
        &self,
        ctx: &OperationContext,
        datacenter: &str,
        vm: &mut VmRecord,
    ) -> Result<()> {
        if vm.moref.is_none() {
            // The clone may have finished after its wait was abandoned
            vm.moref = self
                .core
                .call(ctx, "FindVM", || self.vsphere.inventory.find_vm(datacenter, &vm.name))
                .await?;
        }
        let Some(moref) = vm.moref.clone() else {
            return Ok(());
        };

        let off = self
            .run_task(ctx, "PowerOffVM_Task", || self.vsphere.vms.power_off(&moref))
            .await;
        gone_ok(already_ok(off))?;
        let destroyed = self
            .run_task(ctx, "Destroy_Task", || self.vsphere.vms.destroy(&moref))
            .await;
        gone_ok(destroyed.map(|_| ()))?;
        tracing::info!(vm = %vm.name, moref = %moref, "vm destroyed");
        Ok(())
    }

    async fn observe(&self, ctx: &OperationContext, res: &VsphereResources) -> Result<Observed> {
        let mut states = Vec::with_capacity(res.vms.len());
        for vm in &res.vms {
            let Some(moref) = &vm.moref else {
                states.push(None);
                continue;
            };
            let state = match self
                .core
                .call(ctx, "PowerState", || self.vsphere.vms.power_state(moref))
                .await
            {
                Ok(state) => Some(state),
                Err(e) if e.is_backend_not_found() => None,
                Err(e) => return Err(e),
            };
            states.push(state);
        }
        Ok(translate(&states))
    }
}

/// Map the power states of a deployment's VMs (`None` for a VM the
/// backend no longer knows) to one canonical state
pub fn translate(states: &[Option<VmPowerState>]) -> Observed {
    let present: Vec<VmPowerState> = states.iter().flatten().copied().collect();
    if present.is_empty() {
        return Observed::Gone;
    }
    if present.len() < states.len() {
        return Observed::Stable(WorkloadState::Failed);
    }

    let all = |s: VmPowerState| present.iter().all(|p| *p == s);
    if all(VmPowerState::PoweredOn) {
        Observed::Stable(WorkloadState::Running)
    } else if all(VmPowerState::Suspended) {
        Observed::Stable(WorkloadState::Paused)
    } else if all(VmPowerState::PoweredOff) {
        Observed::Stable(WorkloadState::Stopped)
    } else {
        // mixed, usually mid-operation
        Observed::Transitional
    }
}

/// A power change the VM is already past raises InvalidPowerState
fn already_ok<T>(result: Result<T>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(CloudError::Backend { source, .. }) if source.kind == BackendErrorKind::Conflict => {
            tracing::debug!(error = %source, "power state already reached");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn gone_ok(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_backend_not_found() => Ok(()),
        other => other,
    }
}

#[async_trait]
impl WorkloadAdapter for VsphereAdapter {
    fn backend(&self) -> BackendKind {
        BackendKind::Vmware
    }

    async fn deploy(
        &self,
        ctx: &OperationContext,
        manifest: &Manifest,
        deployment_id: &str,
        lease_id: &str,
        options: &DeploymentOptions,
    ) -> Result<Workload> {
        let plan = VspherePlan::build(manifest, &self.settings)?;
        let tags = options.resource_tags(deployment_id, lease_id);

        self.core
            .deploy_with(
                manifest,
                deployment_id,
                lease_id,
                options,
                |id| async move { self.provision(ctx, &id, &plan, &tags).await },
                |teardown, res| async move { self.release(&teardown, res).await },
            )
            .await
    }

    async fn start(&self, ctx: &OperationContext, id: &WorkloadId) -> Result<()> {
        self.core
            .drive(id, WorkloadState::Running, "powered on", |_, res| async move {
                self.power(ctx, &res, VmPowerState::PoweredOn).await
            })
            .await
    }

    async fn stop(&self, ctx: &OperationContext, id: &WorkloadId) -> Result<()> {
        self.core
            .drive(id, WorkloadState::Stopped, "powered off", |_, res| async move {
                self.power(ctx, &res, VmPowerState::PoweredOff).await
            })
            .await
    }

    async fn pause(&self, ctx: &OperationContext, id: &WorkloadId) -> Result<()> {
        self.core
            .drive(id, WorkloadState::Paused, "suspended", |_, res| async move {
                self.power(ctx, &res, VmPowerState::Suspended).await
            })
            .await
    }

    async fn resume(&self, ctx: &OperationContext, id: &WorkloadId) -> Result<()> {
        self.core
            .drive(id, WorkloadState::Running, "resumed", |_, res| async move {
                self.power(ctx, &res, VmPowerState::PoweredOn).await
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
            .status_with(id, |_, res| async move { self.observe(ctx, &res).await })
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

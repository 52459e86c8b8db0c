//! Azure VM workload adapter

use crate::client::{
    AzureClients, DataDisk, InstanceView, NicRequest, PowerState, ProvisioningState, Tags,
    VmRequest,
};
use crate::plan::{AzurePlan, VmPlan};
use crate::resources::{AzureResources, DiskRecord, NamedResource, PublicIpRecord, VmRecord};
use async_trait::async_trait;
use leaseflow_cloud::{
    AdapterCore, BackendError, BackendErrorKind, BackendKind, CloudError, DeploymentOptions,
    Observed, OperationContext, Reporter, Result, UsageRecord, Workload, WorkloadAdapter,
    WorkloadId, WorkloadState, poll_until,
};
use leaseflow_config::AzureSettings;
use leaseflow_core::Manifest;
use std::time::Duration;

/// Deploys each vm service as one Azure VM with its own NIC, sharing a
/// VNet, NSG and resource group per deployment
pub struct AzureAdapter {
    azure: AzureClients,
    settings: AzureSettings,
    core: AdapterCore<AzureResources>,
}

impl AzureAdapter {
    pub fn new(azure: AzureClients, settings: AzureSettings, reporter: Reporter) -> Self {
        let core = AdapterCore::new(BackendKind::Azure, reporter, settings.retry.clone());
        Self {
            azure,
            settings,
            core,
        }
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.core = self.core.with_teardown_timeout(timeout);
        self
    }

    pub fn resources(&self, id: &WorkloadId) -> Result<AzureResources> {
        self.core.resources(id)
    }

    async fn provision(
        &self,
        ctx: &OperationContext,
        id: &WorkloadId,
        deployment_id: &str,
        plan: &AzurePlan,
        options: &DeploymentOptions,
        tags: &Tags,
    ) -> Result<()> {
        let group = self
            .provision_group(ctx, id, deployment_id, tags)
            .await
            .map_err(|e| e.at_step("resource group"))?;

        let (subnet_id, nsg_id) = self
            .provision_network(ctx, id, &group, plan, tags)
            .await
            .map_err(|e| e.at_step("network"))?;

        self.provision_disks(ctx, id, &group, plan, tags)
            .await
            .map_err(|e| e.at_step("storage"))?;

        for vm in &plan.vms {
            self.provision_vm(ctx, id, &group, vm, &subnet_id, &nsg_id, options, tags)
                .await
                .map_err(|e| e.at_step(format!("vm {}", vm.service)))?;
        }

        let names = self.core.resources(id)?.vm_names();
        self.wait_for_power(ctx, &group, &names, PowerState::Running)
            .await
            .map_err(|e| e.at_step("vm start"))
    }

    async fn provision_group(
        &self,
        ctx: &OperationContext,
        id: &WorkloadId,
        deployment_id: &str,
        tags: &Tags,
    ) -> Result<String> {
        if let Some(group) = &self.settings.resource_group {
            let exists = self
                .core
                .call(ctx, "GetResourceGroup", || {
                    self.azure.groups.resource_group_exists(group)
                })
                .await?;
            if !exists {
                return Err(CloudError::invalid_spec(
                    BackendKind::Azure,
                    format!("configured resource group '{}' does not exist", group),
                ));
            }
            self.core.update(id, |r, w| {
                r.resource_group = Some(group.clone());
                w.backend_ref.insert("resource_group", group);
            })?;
            return Ok(group.clone());
        }

        let group = format!("lf-{}", deployment_id);
        self.core
            .call(ctx, "CreateResourceGroup", || {
                self.azure
                    .groups
                    .create_resource_group(&group, &self.settings.location, tags)
            })
            .await?;
        self.core.update(id, |r, w| {
            r.resource_group = Some(group.clone());
            r.owns_group = true;
            w.backend_ref.insert("resource_group", &group);
        })?;
        tracing::info!(workload_id = %id, group, location = %self.settings.location, "resource group created");
        Ok(group)
    }

    async fn provision_network(
        &self,
        ctx: &OperationContext,
        id: &WorkloadId,
        group: &str,
        plan: &AzurePlan,
        tags: &Tags,
    ) -> Result<(String, String)> {
        let vnet = format!("{}-vnet", id);
        let subnet_id = self
            .core
            .call(ctx, "CreateVirtualNetwork", || {
                self.azure.network.create_vnet(
                    group,
                    &vnet,
                    &self.settings.vnet_cidr,
                    &self.settings.subnet_cidr,
                    tags,
                )
            })
            .await?;
        self.core.update(id, |r, _| {
            r.vnet = Some(vnet.clone());
            r.subnet_id = Some(subnet_id.clone());
        })?;

        let nsg = format!("{}-nsg", id);
        let nsg_id = self
            .core
            .call(ctx, "CreateNetworkSecurityGroup", || {
                self.azure.network.create_nsg(group, &nsg, &plan.rules, tags)
            })
            .await?;
        self.core.update(id, |r, w| {
            r.nsg = Some(NamedResource {
                name: nsg.clone(),
                id: nsg_id.clone(),
            });
            w.backend_ref.insert("nsg", &nsg_id);
        })?;
        Ok((subnet_id, nsg_id))
    }

    async fn provision_disks(
        &self,
        ctx: &OperationContext,
        id: &WorkloadId,
        group: &str,
        plan: &AzurePlan,
        tags: &Tags,
    ) -> Result<()> {
        for disk in &plan.disks {
            let name = format!("{}-{}", id, disk.name);
            let disk_id = self
                .core
                .call(ctx, "CreateDisk", || {
                    self.azure
                        .storage
                        .create_disk(group, &name, disk.size_gib, tags)
                })
                .await?;
            self.core.update(id, |r, _| {
                r.disks.push(DiskRecord {
                    volume: disk.name.clone(),
                    name: name.clone(),
                    id: disk_id.clone(),
                })
            })?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn provision_vm(
        &self,
        ctx: &OperationContext,
        id: &WorkloadId,
        group: &str,
        vm: &VmPlan,
        subnet_id: &str,
        nsg_id: &str,
        options: &DeploymentOptions,
        tags: &Tags,
    ) -> Result<()> {
        let name = format!("{}-{}", id, vm.service);

        let public_ip_id = if options.assign_public_ip {
            let ip_name = format!("{}-ip", name);
            let ip = self
                .core
                .call(ctx, "CreatePublicIPAddress", || {
                    self.azure.network.create_public_ip(group, &ip_name, tags)
                })
                .await?;
            self.core.update(id, |r, w| {
                r.public_ips.push(PublicIpRecord {
                    name: ip_name.clone(),
                    id: ip.id.clone(),
                    address: ip.address.clone(),
                });
                if w.public_ip.is_none() {
                    w.public_ip = Some(ip.address.clone());
                }
            })?;
            Some(ip.id)
        } else {
            None
        };

        let nic_name = format!("{}-nic", name);
        let nic_request = NicRequest {
            subnet_id: subnet_id.to_string(),
            nsg_id: nsg_id.to_string(),
            public_ip_id,
        };
        let nic_id = self
            .core
            .call(ctx, "CreateNetworkInterface", || {
                self.azure
                    .network
                    .create_nic(group, &nic_name, &nic_request, tags)
            })
            .await?;
        self.core.update(id, |r, _| {
            r.nics.push(NamedResource {
                name: nic_name.clone(),
                id: nic_id.clone(),
            })
        })?;

        let resources = self.core.resources(id)?;
        let data_disks = vm
            .disks
            .iter()
            .filter_map(|(volume, lun)| {
                resources.disk_id(volume).map(|disk_id| DataDisk {
                    disk_id: disk_id.to_string(),
                    lun: *lun,
                })
            })
            .collect();
        let mut vm_tags = tags.clone();
        vm_tags.insert("leaseflow/service".to_string(), vm.service.clone());
        let request = VmRequest {
            name: name.clone(),
            size: vm.size.clone(),
            image: vm.image.clone(),
            nic_id,
            admin_username: self.settings.admin_username.clone(),
            data_disks,
            tags: vm_tags,
        };

        // Recorded before the call: a VM created after an abandoned call is
        // still deleted by name
        self.core.update(id, |r, _| {
            r.vms.push(VmRecord {
                service: vm.service.clone(),
                name: name.clone(),
                id: None,
            })
        })?;
        let vm_id = self
            .core
            .call(ctx, "CreateVirtualMachine", || {
                self.azure.compute.create_vm(group, &request)
            })
            .await?;
        tracing::info!(workload_id = %id, vm = %name, size = %vm.size, image = %vm.image, "vm created");
        self.core.update(id, |r, w| {
            if let Some(record) = r.vms.iter_mut().find(|v| v.name == name) {
                record.id = Some(vm_id.clone());
            }
            w.backend_ref.insert(format!("vm/{}", vm.service), &vm_id);
        })?;
        Ok(())
    }

    async fn wait_for_power(
        &self,
        ctx: &OperationContext,
        group: &str,
        names: &[String],
        target: PowerState,
    ) -> Result<()> {
        for name in names {
            let what = format!("vm {} {:?}", name, target);
            poll_until(&self.settings.poll, ctx, &what, || async move {
                let view = self
                    .core
                    .call(ctx, "GetInstanceView", || {
                        self.azure.compute.instance_view(group, name)
                    })
                    .await?;
                if view.provisioning == ProvisioningState::Failed {
                    return Err(CloudError::backend(
                        "GetInstanceView",
                        BackendError::new(
                            BackendErrorKind::Other,
                            format!("vm {} provisioning failed", name),
                        ),
                    ));
                }
                let reached = match (view.power, target) {
                    (Some(PowerState::Deallocated), PowerState::Stopped) => true,
                    (Some(power), target) => power == target,
                    (None, _) => false,
                };
                Ok(reached.then_some(()))
            })
            .await?;
        }
        Ok(())
    }

    async fn release(
        &self,
        ctx: &OperationContext,
        mut res: AzureResources,
    ) -> (AzureResources, Result<()>) {
        let Some(group) = res.resource_group.clone() else {
            return (res, Ok(()));
        };

        if res.owns_group {
            return match self.delete_group(ctx, &group).await {
                Ok(()) => (AzureResources::default(), Ok(())),
                Err(e) => {
                    tracing::warn!(group, error = %e, "resource group deletion failed");
                    (res, Err(e))
                }
            };
        }

        // Shared group: delete our resources one by one, dependents first
        let mut errors = Vec::new();

        let mut kept = Vec::new();
        for vm in std::mem::take(&mut res.vms) {
            let outcome = self
                .core
                .call(ctx, "DeleteVirtualMachine", || {
                    self.azure.compute.delete_vm(&group, &vm.name)
                })
                .await;
            if let Err(e) = gone_ok(outcome) {
                errors.push(e);
                kept.push(vm);
            }
        }
        res.vms = kept;

        let mut kept = Vec::new();
        for nic in std::mem::take(&mut res.nics) {
            let outcome = self
                .core
                .call(ctx, "DeleteNetworkInterface", || {
                    self.azure.network.delete_nic(&group, &nic.name)
                })
                .await;
            if let Err(e) = gone_ok(outcome) {
                errors.push(e);
                kept.push(nic);
            }
        }
        res.nics = kept;

        let mut kept = Vec::new();
        for ip in std::mem::take(&mut res.public_ips) {
            let outcome = self
                .core
                .call(ctx, "DeletePublicIPAddress", || {
                    self.azure.network.delete_public_ip(&group, &ip.name)
                })
                .await;
            if let Err(e) = gone_ok(outcome) {
                errors.push(e);
                kept.push(ip);
            }
        }
        res.public_ips = kept;

        let mut kept = Vec::new();
        for disk in std::mem::take(&mut res.disks) {
            let outcome = self
                .core
                .call(ctx, "DeleteDisk", || {
                    self.azure.storage.delete_disk(&group, &disk.name)
                })
                .await;
            if let Err(e) = gone_ok(outcome) {
                errors.push(e);
                kept.push(disk);
            }
        }
        res.disks = kept;

        if let Some(nsg) = res.nsg.clone() {
            let outcome = self
                .core
                .call(ctx, "DeleteNetworkSecurityGroup", || {
                    self.azure.network.delete_nsg(&group, &nsg.name)
                })
                .await;
            match gone_ok(outcome) {
                Ok(()) => res.nsg = None,
                Err(e) => errors.push(e),
            }
        }

        if let Some(vnet) = res.vnet.clone() {
            let outcome = self
                .core
                .call(ctx, "DeleteVirtualNetwork", || {
                    self.azure.network.delete_vnet(&group, &vnet)
                })
                .await;
            match gone_ok(outcome) {
                Ok(()) => {
                    res.vnet = None;
                    res.subnet_id = None;
                }
                Err(e) => errors.push(e),
            }
        }

        for e in &errors {
            tracing::warn!(group, error = %e, "teardown step failed");
        }
        match errors.into_iter().next() {
            Some(e) => (res, Err(e)),
            None => (AzureResources::default(), Ok(())),
        }
    }

    async fn delete_group(&self, ctx: &OperationContext, group: &str) -> Result<()> {
        gone_ok(
            self.core
                .call(ctx, "DeleteResourceGroup", || {
                    self.azure.groups.delete_resource_group(group)
                })
                .await,
        )?;
        let what = format!("resource group {} deletion", group);
        poll_until(&self.settings.poll, ctx, &what, || async move {
            let exists = self
                .core
                .call(ctx, "GetResourceGroup", || {
                    self.azure.groups.resource_group_exists(group)
                })
                .await?;
            Ok((!exists).then_some(()))
        })
        .await
    }

    async fn power(
        &self,
        ctx: &OperationContext,
        res: &AzureResources,
        target: PowerState,
    ) -> Result<()> {
        let Some(group) = &res.resource_group else {
            return Ok(());
        };
        let names = res.vm_names();
        for name in &names {
            match target {
                PowerState::Running => {
                    self.core
                        .call(ctx, "StartVirtualMachine", || {
                            self.azure.compute.start_vm(group, name)
                        })
                        .await?
                }
                _ => {
                    self.core
                        .call(ctx, "PowerOffVirtualMachine", || {
                            self.azure.compute.power_off_vm(group, name)
                        })
                        .await?
                }
            }
        }
        self.wait_for_power(ctx, group, &names, target).await
    }

    async fn observe(&self, ctx: &OperationContext, res: &AzureResources) -> Result<Observed> {
        let Some(group) = &res.resource_group else {
            return Ok(Observed::Gone);
        };
        let mut views = Vec::with_capacity(res.vms.len());
        for vm in &res.vms {
            let view = match self
                .core
                .call(ctx, "GetInstanceView", || {
                    self.azure.compute.instance_view(group, &vm.name)
                })
                .await
            {
                Ok(view) => Some(view),
                Err(e) if e.is_backend_not_found() => None,
                Err(e) => return Err(e),
            };
            views.push(view);
        }
        Ok(translate(&views))
    }
}

/// Map the instance views of a deployment's VMs (`None` for a VM the
/// backend no longer knows) to one canonical state
pub fn translate(views: &[Option<InstanceView>]) -> Observed {
    let present: Vec<&InstanceView> = views.iter().flatten().collect();
    if present.is_empty() {
        return Observed::Gone;
    }
    if present.len() < views.len()
        || present
            .iter()
            .any(|v| v.provisioning == ProvisioningState::Failed)
    {
        return Observed::Stable(WorkloadState::Failed);
    }

    let all = |f: fn(PowerState) -> bool| present.iter().all(|v| v.power.is_some_and(f));
    if all(|p| p == PowerState::Running) {
        Observed::Stable(WorkloadState::Running)
    } else if all(|p| matches!(p, PowerState::Stopped | PowerState::Deallocated)) {
        Observed::Stable(WorkloadState::Stopped)
    } else {
        // starting, stopping, deallocating, updating or unknown
        Observed::Transitional
    }
}

fn gone_ok(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_backend_not_found() => Ok(()),
        other => other,
    }
}

#[async_trait]
impl WorkloadAdapter for AzureAdapter {
    fn backend(&self) -> BackendKind {
        BackendKind::Azure
    }

    async fn deploy(
        &self,
        ctx: &OperationContext,
        manifest: &Manifest,
        deployment_id: &str,
        lease_id: &str,
        options: &DeploymentOptions,
    ) -> Result<Workload> {
        let plan = AzurePlan::build(manifest, &self.settings)?;
        let tags = options.resource_tags(deployment_id, lease_id);

        self.core
            .deploy_with(
                manifest,
                deployment_id,
                lease_id,
                options,
                |id| async move {
                    self.provision(ctx, &id, deployment_id, &plan, options, &tags)
                        .await
                },
                |teardown, res| async move { self.release(&teardown, res).await },
            )
            .await
    }

    async fn start(&self, ctx: &OperationContext, id: &WorkloadId) -> Result<()> {
        self.core
            .drive(id, WorkloadState::Running, "powered on", |_, res| async move {
                self.power(ctx, &res, PowerState::Running).await
            })
            .await
    }

    async fn stop(&self, ctx: &OperationContext, id: &WorkloadId) -> Result<()> {
        self.core
            .drive(id, WorkloadState::Stopped, "powered off", |_, res| async move {
                self.power(ctx, &res, PowerState::Stopped).await
            })
            .await
    }

    async fn pause(&self, _ctx: &OperationContext, id: &WorkloadId) -> Result<()> {
        self.core.workload(id)?;
        Err(CloudError::unsupported(BackendKind::Azure, "pause"))
    }

    async fn resume(&self, _ctx: &OperationContext, id: &WorkloadId) -> Result<()> {
        self.core.workload(id)?;
        Err(CloudError::unsupported(BackendKind::Azure, "resume"))
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

#[cfg(test)]
mod tests {
    use super::*;

    fn view(power: PowerState) -> Option<InstanceView> {
        Some(InstanceView {
            provisioning: ProvisioningState::Succeeded,
            power: Some(power),
        })
    }

    #[test]
    fn test_translate() {
        use PowerState::*;
        assert_eq!(
            translate(&[view(Running), view(Running)]),
            Observed::Stable(WorkloadState::Running)
        );
        assert_eq!(
            translate(&[view(Stopped), view(Deallocated)]),
            Observed::Stable(WorkloadState::Stopped)
        );
        assert_eq!(translate(&[view(Running), view(Stopping)]), Observed::Transitional);
        assert_eq!(translate(&[view(Unknown)]), Observed::Transitional);
        assert_eq!(translate(&[None, None]), Observed::Gone);
        assert_eq!(
            translate(&[view(Running), None]),
            Observed::Stable(WorkloadState::Failed)
        );
    }

    #[test]
    fn test_updating_vm_keeps_last_state() {
        let updating = Some(InstanceView {
            provisioning: ProvisioningState::Updating,
            power: None,
        });
        assert_eq!(translate(&[updating]), Observed::Transitional);
    }
}

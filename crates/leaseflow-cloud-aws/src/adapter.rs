//! EC2 workload adapter

use crate::client::{Ec2Clients, InstanceRequest, InstanceState, Tags, VolumeState};
use crate::plan::{AwsPlan, InstancePlan};
use crate::resources::{AddressRecord, AwsResources, InstanceRecord, LaunchRecord, VolumeRecord};
use async_trait::async_trait;
use leaseflow_cloud::{
    AdapterCore, BackendError, BackendErrorKind, BackendKind, CloudError, DeploymentOptions,
    Observed, OperationContext, Reporter, Result, UsageRecord, Workload, WorkloadAdapter,
    WorkloadId, WorkloadState, poll_until,
};
use leaseflow_config::AwsSettings;
use leaseflow_core::Manifest;
use std::time::Duration;

/// Deploys each vm service as one EC2 instance inside a per-deployment
/// VPC, security group and set of EBS volumes
pub struct AwsAdapter {
    ec2: Ec2Clients,
    settings: AwsSettings,
    core: AdapterCore<AwsResources>,
}

impl AwsAdapter {
    pub fn new(ec2: Ec2Clients, settings: AwsSettings, reporter: Reporter) -> Self {
        let core = AdapterCore::new(BackendKind::Aws, reporter, settings.retry.clone());
        Self { ec2, settings, core }
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.core = self.core.with_teardown_timeout(timeout);
        self
    }

    pub fn settings(&self) -> &AwsSettings {
        &self.settings
    }

    /// Native resources currently recorded for a workload
    pub fn resources(&self, id: &WorkloadId) -> Result<AwsResources> {
        self.core.resources(id)
    }

    fn availability_zone(&self) -> String {
        self.settings
            .availability_zone
            .clone()
            .unwrap_or_else(|| format!("{}a", self.settings.region))
    }

    async fn provision(
        &self,
        ctx: &OperationContext,
        id: &WorkloadId,
        plan: &AwsPlan,
        options: &DeploymentOptions,
        tags: &Tags,
    ) -> Result<()> {
        let (vpc_id, subnet_id) = self
            .provision_network(ctx, id, tags)
            .await
            .map_err(|e| e.at_step("network"))?;

        let group_id = self
            .provision_security_group(ctx, id, plan, &vpc_id, tags)
            .await
            .map_err(|e| e.at_step("security group"))?;

        self.provision_volumes(ctx, id, plan, tags)
            .await
            .map_err(|e| e.at_step("storage"))?;

        self.provision_instances(ctx, id, plan, &subnet_id, &group_id, tags)
            .await
            .map_err(|e| e.at_step("compute"))?;

        self.attach_volumes(ctx, id, plan)
            .await
            .map_err(|e| e.at_step("attach"))?;

        if options.assign_public_ip {
            self.provision_addresses(ctx, id, tags)
                .await
                .map_err(|e| e.at_step("public ip"))?;
        }
        Ok(())
    }

    async fn provision_network(
        &self,
        ctx: &OperationContext,
        id: &WorkloadId,
        tags: &Tags,
    ) -> Result<(String, String)> {
        let vpc_id = match &self.settings.vpc_id {
            Some(vpc_id) => vpc_id.clone(),
            None => {
                let vpc_id = self
                    .core
                    .call(ctx, "CreateVpc", || {
                        self.ec2.network.create_vpc(&self.settings.vpc_cidr, tags)
                    })
                    .await?;
                self.core.update(id, |r, _| r.vpc_id = Some(vpc_id.clone()))?;
                vpc_id
            }
        };

        let subnet_id = match (&self.settings.vpc_id, &self.settings.subnet_id) {
            (Some(_), Some(subnet_id)) => subnet_id.clone(),
            _ => {
                let az = self.availability_zone();
                let subnet_id = self
                    .core
                    .call(ctx, "CreateSubnet", || {
                        self.ec2
                            .network
                            .create_subnet(&vpc_id, &self.settings.subnet_cidr, &az, tags)
                    })
                    .await?;
                self.core
                    .update(id, |r, _| r.subnet_id = Some(subnet_id.clone()))?;
                subnet_id
            }
        };

        self.core.update(id, |_, w| {
            w.backend_ref.insert("vpc_id", &vpc_id);
            w.backend_ref.insert("subnet_id", &subnet_id);
        })?;
        tracing::debug!(workload_id = %id, vpc_id, subnet_id, "network ready");
        Ok((vpc_id, subnet_id))
    }

    async fn provision_security_group(
        &self,
        ctx: &OperationContext,
        id: &WorkloadId,
        plan: &AwsPlan,
        vpc_id: &str,
        tags: &Tags,
    ) -> Result<String> {
        let name = format!("lf-{}", id);
        let group_id = self
            .core
            .call(ctx, "CreateSecurityGroup", || {
                self.ec2.network.create_security_group(vpc_id, &name, tags)
            })
            .await?;
        self.core.update(id, |r, w| {
            r.security_group_id = Some(group_id.clone());
            w.backend_ref.insert("security_group_id", &group_id);
        })?;

        if !plan.ingress.is_empty() {
            self.core
                .call(ctx, "AuthorizeSecurityGroupIngress", || {
                    self.ec2.network.authorize_ingress(&group_id, &plan.ingress)
                })
                .await?;
        }
        Ok(group_id)
    }

    async fn provision_volumes(
        &self,
        ctx: &OperationContext,
        id: &WorkloadId,
        plan: &AwsPlan,
        tags: &Tags,
    ) -> Result<()> {
        let az = self.availability_zone();
        for volume in &plan.volumes {
            let mut volume_tags = tags.clone();
            volume_tags.insert("Name".to_string(), format!("{}-{}", id, volume.name));

            let volume_id = self
                .core
                .call(ctx, "CreateVolume", || {
                    self.ec2
                        .storage
                        .create_volume(volume.size_gib, &az, &volume_tags)
                })
                .await?;
            self.core.update(id, |r, w| {
                r.volumes.push(VolumeRecord {
                    name: volume.name.clone(),
                    volume_id: volume_id.clone(),
                    attached_to: None,
                });
                w.backend_ref
                    .insert(format!("volume/{}", volume.name), &volume_id);
            })?;
        }
        Ok(())
    }

    async fn provision_instances(
        &self,
        ctx: &OperationContext,
        id: &WorkloadId,
        plan: &AwsPlan,
        subnet_id: &str,
        group_id: &str,
        tags: &Tags,
    ) -> Result<()> {
        let mut launched = Vec::with_capacity(plan.instances.len());
        for instance in &plan.instances {
            let request = self.instance_request(id, instance, subnet_id, group_id, tags);
            // Recorded before the call so an instance that launches after an
            // abandoned call is still found by name on release
            self.core.update(id, |r, _| {
                r.launching.push(LaunchRecord {
                    service: instance.service.clone(),
                    name: request.name.clone(),
                })
            })?;
            let instance_id = self
                .core
                .call(ctx, "RunInstances", || {
                    self.ec2.compute.run_instance(&request)
                })
                .await?;
            tracing::info!(
                workload_id = %id,
                service = %instance.service,
                instance_id,
                instance_type = %instance.instance_type,
                "instance launched"
            );
            self.core.update(id, |r, w| {
                r.launching.retain(|l| l.name != request.name);
                r.instances.push(InstanceRecord {
                    service: instance.service.clone(),
                    instance_id: instance_id.clone(),
                });
                w.backend_ref
                    .insert(format!("instance/{}", instance.service), &instance_id);
            })?;
            launched.push(instance_id);
        }

        self.wait_for_instances(ctx, &launched, InstanceState::Running)
            .await
    }

    fn instance_request(
        &self,
        id: &WorkloadId,
        instance: &InstancePlan,
        subnet_id: &str,
        group_id: &str,
        tags: &Tags,
    ) -> InstanceRequest {
        let name = format!("{}-{}", id, instance.service);
        let mut tags = tags.clone();
        tags.insert("Name".to_string(), name.clone());
        InstanceRequest {
            name,
            image_id: instance.image_id.clone(),
            instance_type: instance.instance_type.clone(),
            subnet_id: subnet_id.to_string(),
            security_group_ids: vec![group_id.to_string()],
            key_name: self.settings.key_name.clone(),
            tags,
        }
    }

    async fn attach_volumes(
        &self,
        ctx: &OperationContext,
        id: &WorkloadId,
        plan: &AwsPlan,
    ) -> Result<()> {
        let resources = self.core.resources(id)?;
        for instance in &plan.instances {
            let Some(instance_id) = resources.instance_for(&instance.service) else {
                continue;
            };
            for mount in &instance.mounts {
                let Some(volume_id) = resources.volume_id(&mount.volume) else {
                    continue;
                };
                self.wait_for_volume(ctx, volume_id, VolumeState::Available)
                    .await?;
                self.core
                    .call(ctx, "AttachVolume", || {
                        self.ec2
                            .storage
                            .attach_volume(volume_id, instance_id, &mount.device)
                    })
                    .await?;
                self.core.update(id, |r, _| {
                    if let Some(v) = r.volumes.iter_mut().find(|v| v.volume_id == volume_id) {
                        v.attached_to = Some(instance_id.to_string());
                    }
                })?;
                tracing::debug!(workload_id = %id, volume_id, instance_id, device = %mount.device, "volume attached");
            }
        }
        Ok(())
    }

    async fn provision_addresses(
        &self,
        ctx: &OperationContext,
        id: &WorkloadId,
        tags: &Tags,
    ) -> Result<()> {
        let instances = self.core.resources(id)?.instances;
        for instance in &instances {
            let address = self
                .core
                .call(ctx, "AllocateAddress", || {
                    self.ec2.network.allocate_address(tags)
                })
                .await?;
            self.core.update(id, |r, w| {
                r.addresses.push(AddressRecord {
                    allocation_id: address.allocation_id.clone(),
                    public_ip: address.public_ip.clone(),
                    association_id: None,
                });
                w.backend_ref.insert(
                    format!("allocation/{}", instance.service),
                    &address.allocation_id,
                );
            })?;

            let association_id = self
                .core
                .call(ctx, "AssociateAddress", || {
                    self.ec2
                        .network
                        .associate_address(&address.allocation_id, &instance.instance_id)
                })
                .await?;
            self.core.update(id, |r, w| {
                if let Some(a) = r
                    .addresses
                    .iter_mut()
                    .find(|a| a.allocation_id == address.allocation_id)
                {
                    a.association_id = Some(association_id.clone());
                }
                if w.public_ip.is_none() {
                    w.public_ip = Some(address.public_ip.clone());
                }
            })?;
            tracing::info!(workload_id = %id, service = %instance.service, public_ip = %address.public_ip, "elastic ip associated");
        }
        Ok(())
    }

    async fn wait_for_instances(
        &self,
        ctx: &OperationContext,
        instance_ids: &[String],
        target: InstanceState,
    ) -> Result<()> {
        for instance_id in instance_ids {
            let what = format!("instance {} {:?}", instance_id, target);
            poll_until(&self.settings.poll, ctx, &what, || async move {
                let info = match self
                    .core
                    .call(ctx, "DescribeInstances", || {
                        self.ec2.compute.describe_instance(instance_id)
                    })
                    .await
                {
                    Ok(info) => info,
                    Err(e) if e.is_backend_not_found() && target == InstanceState::Terminated => {
                        return Ok(Some(()));
                    }
                    Err(e) => return Err(e),
                };

                if info.state == target {
                    return Ok(Some(()));
                }
                if matches!(
                    info.state,
                    InstanceState::ShuttingDown | InstanceState::Terminated
                ) && target != InstanceState::Terminated
                {
                    return Err(CloudError::backend(
                        "DescribeInstances",
                        BackendError::new(
                            BackendErrorKind::Other,
                            format!("instance {} terminated unexpectedly", instance_id),
                        ),
                    ));
                }
                Ok(None)
            })
            .await?;
        }
        Ok(())
    }

    async fn wait_for_volume(
        &self,
        ctx: &OperationContext,
        volume_id: &str,
        target: VolumeState,
    ) -> Result<()> {
        let what = format!("volume {} {:?}", volume_id, target);
        poll_until(&self.settings.poll, ctx, &what, || async move {
            let state = self
                .core
                .call(ctx, "DescribeVolumes", || {
                    self.ec2.storage.volume_state(volume_id)
                })
                .await?;
            match state {
                s if s == target => Ok(Some(())),
                VolumeState::Error => Err(CloudError::backend(
                    "DescribeVolumes",
                    BackendError::new(
                        BackendErrorKind::Other,
                        format!("volume {} entered error state", volume_id),
                    ),
                )),
                _ => Ok(None),
            }
        })
        .await
    }

    /// Release everything in `res`, newest first
    ///
    /// Returns what could not be released. Resources the backend no longer
    /// knows count as released.
    async fn release(
        &self,
        ctx: &OperationContext,
        mut res: AwsResources,
    ) -> (AwsResources, Result<()>) {
        let mut errors = Vec::new();

        let mut kept = Vec::new();
        for address in std::mem::take(&mut res.addresses) {
            if let Err(e) = self.release_address(ctx, &address).await {
                errors.push(e);
                kept.push(address);
            }
        }
        res.addresses = kept;

        for volume in res.volumes.iter_mut().filter(|v| v.attached_to.is_some()) {
            let volume_id = volume.volume_id.clone();
            match gone_ok(
                self.core
                    .call(ctx, "DetachVolume", || {
                        self.ec2.storage.detach_volume(&volume_id)
                    })
                    .await,
            ) {
                Ok(()) => volume.attached_to = None,
                Err(e) => errors.push(e),
            }
        }

        let mut unresolved = Vec::new();
        for launch in std::mem::take(&mut res.launching) {
            let found = self
                .core
                .call(ctx, "DescribeInstances", || {
                    self.ec2.compute.find_instance(&launch.name)
                })
                .await;
            match found {
                Ok(Some(instance_id)) => {
                    tracing::info!(instance_id, name = %launch.name, "found instance from abandoned launch");
                    res.instances.push(InstanceRecord {
                        service: launch.service,
                        instance_id,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    errors.push(e);
                    unresolved.push(launch);
                }
            }
        }
        res.launching = unresolved;

        if !res.instances.is_empty() {
            let ids = res.instance_ids();
            let terminated = async {
                gone_ok(
                    self.core
                        .call(ctx, "TerminateInstances", || {
                            self.ec2.compute.terminate_instances(&ids)
                        })
                        .await,
                )?;
                self.wait_for_instances(ctx, &ids, InstanceState::Terminated)
                    .await
            };
            match terminated.await {
                Ok(()) => res.instances.clear(),
                Err(e) => errors.push(e),
            }
        }

        let mut kept = Vec::new();
        for volume in std::mem::take(&mut res.volumes) {
            if let Err(e) = self.delete_volume(ctx, &volume.volume_id).await {
                errors.push(e);
                kept.push(volume);
            }
        }
        res.volumes = kept;

        if let Some(group_id) = res.security_group_id.clone() {
            match gone_ok(
                self.core
                    .call(ctx, "DeleteSecurityGroup", || {
                        self.ec2.network.delete_security_group(&group_id)
                    })
                    .await,
            ) {
                Ok(()) => res.security_group_id = None,
                Err(e) => errors.push(e),
            }
        }

        if let Some(subnet_id) = res.subnet_id.clone() {
            match gone_ok(
                self.core
                    .call(ctx, "DeleteSubnet", || {
                        self.ec2.network.delete_subnet(&subnet_id)
                    })
                    .await,
            ) {
                Ok(()) => res.subnet_id = None,
                Err(e) => errors.push(e),
            }
        }

        if let Some(vpc_id) = res.vpc_id.clone() {
            match gone_ok(
                self.core
                    .call(ctx, "DeleteVpc", || self.ec2.network.delete_vpc(&vpc_id))
                    .await,
            ) {
                Ok(()) => res.vpc_id = None,
                Err(e) => errors.push(e),
            }
        }

        for e in &errors {
            tracing::warn!(error = %e, "teardown step failed");
        }
        let outcome = match errors.into_iter().next() {
            Some(e) => Err(e),
            None => Ok(()),
        };
        (res, outcome)
    }

    async fn release_address(&self, ctx: &OperationContext, address: &AddressRecord) -> Result<()> {
        if let Some(association_id) = &address.association_id {
            gone_ok(
                self.core
                    .call(ctx, "DisassociateAddress", || {
                        self.ec2.network.disassociate_address(association_id)
                    })
                    .await,
            )?;
        }
        gone_ok(
            self.core
                .call(ctx, "ReleaseAddress", || {
                    self.ec2.network.release_address(&address.allocation_id)
                })
                .await,
        )
    }

    async fn delete_volume(&self, ctx: &OperationContext, volume_id: &str) -> Result<()> {
        match self.wait_for_volume(ctx, volume_id, VolumeState::Available).await {
            Ok(()) => {}
            Err(e) if e.is_backend_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }
        gone_ok(
            self.core
                .call(ctx, "DeleteVolume", || {
                    self.ec2.storage.delete_volume(volume_id)
                })
                .await,
        )
    }

    async fn observe(&self, ctx: &OperationContext, res: &AwsResources) -> Result<Observed> {
        let mut states = Vec::with_capacity(res.instances.len());
        for instance in &res.instances {
            let state = match self
                .core
                .call(ctx, "DescribeInstances", || {
                    self.ec2.compute.describe_instance(&instance.instance_id)
                })
                .await
            {
                Ok(info) => info.state,
                Err(e) if e.is_backend_not_found() => InstanceState::Terminated,
                Err(e) => return Err(e),
            };
            states.push(state);
        }
        Ok(translate(&states))
    }
}

/// Map the states of a deployment's instances to one canonical state
pub fn translate(states: &[InstanceState]) -> Observed {
    use InstanceState::*;

    let gone = states
        .iter()
        .filter(|s| matches!(s, Terminated | ShuttingDown))
        .count();
    if gone == states.len() {
        return Observed::Gone;
    }
    if gone > 0 {
        // Part of the deployment was destroyed out of band
        return Observed::Stable(WorkloadState::Failed);
    }
    if states.iter().all(|s| *s == Running) {
        Observed::Stable(WorkloadState::Running)
    } else if states.iter().all(|s| *s == Stopped) {
        Observed::Stable(WorkloadState::Stopped)
    } else {
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
impl WorkloadAdapter for AwsAdapter {
    fn backend(&self) -> BackendKind {
        BackendKind::Aws
    }

    async fn deploy(
        &self,
        ctx: &OperationContext,
        manifest: &Manifest,
        deployment_id: &str,
        lease_id: &str,
        options: &DeploymentOptions,
    ) -> Result<Workload> {
        let plan = AwsPlan::build(manifest, &self.settings)?;
        let tags = options.resource_tags(deployment_id, lease_id);

        self.core
            .deploy_with(
                manifest,
                deployment_id,
                lease_id,
                options,
                |id| async move { self.provision(ctx, &id, &plan, options, &tags).await },
                |teardown, res| async move { self.release(&teardown, res).await },
            )
            .await
    }

    async fn start(&self, ctx: &OperationContext, id: &WorkloadId) -> Result<()> {
        self.core
            .drive(id, WorkloadState::Running, "started", |_, res| async move {
                let ids = res.instance_ids();
                self.core
                    .call(ctx, "StartInstances", || {
                        self.ec2.compute.start_instances(&ids)
                    })
                    .await?;
                self.wait_for_instances(ctx, &ids, InstanceState::Running)
                    .await
            })
            .await
    }

    async fn stop(&self, ctx: &OperationContext, id: &WorkloadId) -> Result<()> {
        self.core
            .drive(id, WorkloadState::Stopped, "stopped", |_, res| async move {
                let ids = res.instance_ids();
                self.core
                    .call(ctx, "StopInstances", || {
                        self.ec2.compute.stop_instances(&ids)
                    })
                    .await?;
                self.wait_for_instances(ctx, &ids, InstanceState::Stopped)
                    .await
            })
            .await
    }

    async fn pause(&self, _ctx: &OperationContext, id: &WorkloadId) -> Result<()> {
        self.core.workload(id)?;
        Err(CloudError::unsupported(BackendKind::Aws, "pause"))
    }

    async fn resume(&self, _ctx: &OperationContext, id: &WorkloadId) -> Result<()> {
        self.core.workload(id)?;
        Err(CloudError::unsupported(BackendKind::Aws, "resume"))
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
        // EC2 exposes no cumulative network counter outside CloudWatch
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
    use InstanceState::*;

    #[test]
    fn test_translate() {
        assert_eq!(
            translate(&[Running, Running]),
            Observed::Stable(WorkloadState::Running)
        );
        assert_eq!(translate(&[Stopped]), Observed::Stable(WorkloadState::Stopped));
        assert_eq!(translate(&[Running, Stopping]), Observed::Transitional);
        assert_eq!(translate(&[Pending]), Observed::Transitional);
        assert_eq!(translate(&[Terminated, Terminated]), Observed::Gone);
        assert_eq!(
            translate(&[Running, Terminated]),
            Observed::Stable(WorkloadState::Failed)
        );
        assert_eq!(translate(&[]), Observed::Gone);
    }
}

//! In-memory EC2 for tests
//!
//! Instances settle into their target state after a configurable number
//! of describe calls. Terminated instances stay describable, as on EC2.

use crate::client::{
    Address, ComputeClient, IngressRule, InstanceInfo, InstanceRequest, InstanceState,
    NetworkClient, StorageClient, Tags, VolumeState,
};
use crate::error::from_code;
use async_trait::async_trait;
use leaseflow_cloud::testing::Faults;
use leaseflow_cloud::{BackendResult, DEPLOYMENT_TAG};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone)]
struct FakeInstance {
    tags: Tags,
    state: InstanceState,
    settle: Option<(InstanceState, u32)>,
    request: InstanceRequest,
}

#[derive(Debug, Clone)]
struct FakeVolume {
    tags: Tags,
    state: VolumeState,
    attached_to: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    vpcs: BTreeMap<String, Tags>,
    subnets: BTreeMap<String, Tags>,
    groups: BTreeMap<String, (Tags, Vec<IngressRule>)>,
    addresses: BTreeMap<String, (Tags, Option<String>)>,
    volumes: BTreeMap<String, FakeVolume>,
    instances: BTreeMap<String, FakeInstance>,
    pending_polls: u32,
    launch_delay: Option<Duration>,
}

impl State {
    fn id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:08x}", prefix, self.next_id)
    }
}

#[derive(Debug, Default)]
pub struct FakeEc2 {
    state: Mutex<State>,
    pub faults: Faults,
}

impl FakeEc2 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Describe calls an instance needs before reaching its target state
    pub fn with_pending_polls(self, polls: u32) -> Self {
        self.lock().pending_polls = polls;
        self
    }

    /// `run_instance` creates the instance, then answers only after `delay`
    pub fn slow_launch(&self, delay: Duration) {
        self.lock().launch_delay = Some(delay);
    }

    /// Ids of live resources tagged with `deployment_id`
    pub fn tagged_resources(&self, deployment_id: &str) -> Vec<String> {
        let state = self.lock();
        let tagged = |tags: &Tags| tags.get(DEPLOYMENT_TAG).map(String::as_str) == Some(deployment_id);

        let mut ids = Vec::new();
        ids.extend(state.vpcs.iter().filter(|(_, t)| tagged(t)).map(|(id, _)| id.clone()));
        ids.extend(state.subnets.iter().filter(|(_, t)| tagged(t)).map(|(id, _)| id.clone()));
        ids.extend(state.groups.iter().filter(|(_, (t, _))| tagged(t)).map(|(id, _)| id.clone()));
        ids.extend(state.addresses.iter().filter(|(_, (t, _))| tagged(t)).map(|(id, _)| id.clone()));
        ids.extend(state.volumes.iter().filter(|(_, v)| tagged(&v.tags)).map(|(id, _)| id.clone()));
        ids.extend(
            state
                .instances
                .iter()
                .filter(|(_, i)| tagged(&i.tags) && i.state != InstanceState::Terminated)
                .map(|(id, _)| id.clone()),
        );
        ids
    }

    pub fn instance_state(&self, instance_id: &str) -> Option<InstanceState> {
        self.lock().instances.get(instance_id).map(|i| i.state)
    }

    pub fn instance_request(&self, instance_id: &str) -> Option<InstanceRequest> {
        self.lock().instances.get(instance_id).map(|i| i.request.clone())
    }

    pub fn ingress(&self, group_id: &str) -> Vec<IngressRule> {
        self.lock()
            .groups
            .get(group_id)
            .map(|(_, rules)| rules.clone())
            .unwrap_or_default()
    }

    pub fn volume_attachment(&self, volume_id: &str) -> Option<String> {
        self.lock().volumes.get(volume_id).and_then(|v| v.attached_to.clone())
    }

    /// Change an instance out of band, as the console would
    pub fn set_instance_state(&self, instance_id: &str, state: InstanceState) {
        if let Some(instance) = self.lock().instances.get_mut(instance_id) {
            instance.state = state;
            instance.settle = None;
        }
    }

    /// Forget an instance entirely
    pub fn purge_instance(&self, instance_id: &str) {
        self.lock().instances.remove(instance_id);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn move_instances(
        &self,
        ids: &[String],
        via: InstanceState,
        target: InstanceState,
    ) -> BackendResult<()> {
        let mut state = self.lock();
        if let Some(missing) = ids.iter().find(|id| !state.instances.contains_key(*id)) {
            return Err(from_code("InvalidInstanceID.NotFound", missing));
        }
        let polls = state.pending_polls;
        for id in ids {
            if let Some(instance) = state.instances.get_mut(id) {
                if instance.state == InstanceState::Terminated {
                    continue;
                }
                instance.state = via;
                instance.settle = Some((target, polls));
            }
        }
        if target == InstanceState::Terminated {
            for volume in state.volumes.values_mut() {
                if volume.attached_to.as_ref().is_some_and(|i| ids.contains(i)) {
                    volume.attached_to = None;
                    volume.state = VolumeState::Available;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkClient for FakeEc2 {
    async fn create_vpc(&self, _cidr: &str, tags: &Tags) -> BackendResult<String> {
        self.faults.enter("create_vpc").await?;
        let mut state = self.lock();
        let id = state.id("vpc");
        state.vpcs.insert(id.clone(), tags.clone());
        Ok(id)
    }

    async fn delete_vpc(&self, vpc_id: &str) -> BackendResult<()> {
        self.faults.enter("delete_vpc").await?;
        self.lock()
            .vpcs
            .remove(vpc_id)
            .map(|_| ())
            .ok_or_else(|| from_code("InvalidVpcID.NotFound", vpc_id))
    }

    async fn create_subnet(
        &self,
        _vpc_id: &str,
        _cidr: &str,
        _availability_zone: &str,
        tags: &Tags,
    ) -> BackendResult<String> {
        self.faults.enter("create_subnet").await?;
        let mut state = self.lock();
        let id = state.id("subnet");
        state.subnets.insert(id.clone(), tags.clone());
        Ok(id)
    }

    async fn delete_subnet(&self, subnet_id: &str) -> BackendResult<()> {
        self.faults.enter("delete_subnet").await?;
        self.lock()
            .subnets
            .remove(subnet_id)
            .map(|_| ())
            .ok_or_else(|| from_code("InvalidSubnetID.NotFound", subnet_id))
    }

    async fn create_security_group(
        &self,
        _vpc_id: &str,
        _name: &str,
        tags: &Tags,
    ) -> BackendResult<String> {
        self.faults.enter("create_security_group").await?;
        let mut state = self.lock();
        let id = state.id("sg");
        state.groups.insert(id.clone(), (tags.clone(), Vec::new()));
        Ok(id)
    }

    async fn authorize_ingress(&self, group_id: &str, rules: &[IngressRule]) -> BackendResult<()> {
        self.faults.enter("authorize_ingress").await?;
        let mut state = self.lock();
        let (_, existing) = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| from_code("InvalidGroup.NotFound", group_id))?;
        existing.extend(rules.iter().cloned());
        Ok(())
    }

    async fn delete_security_group(&self, group_id: &str) -> BackendResult<()> {
        self.faults.enter("delete_security_group").await?;
        self.lock()
            .groups
            .remove(group_id)
            .map(|_| ())
            .ok_or_else(|| from_code("InvalidGroup.NotFound", group_id))
    }

    async fn allocate_address(&self, tags: &Tags) -> BackendResult<Address> {
        self.faults.enter("allocate_address").await?;
        let mut state = self.lock();
        let allocation_id = state.id("eipalloc");
        let public_ip = format!("203.0.113.{}", state.next_id % 250 + 1);
        state
            .addresses
            .insert(allocation_id.clone(), (tags.clone(), None));
        Ok(Address {
            allocation_id,
            public_ip,
        })
    }

    async fn associate_address(
        &self,
        allocation_id: &str,
        instance_id: &str,
    ) -> BackendResult<String> {
        self.faults.enter("associate_address").await?;
        let mut state = self.lock();
        if !state.instances.contains_key(instance_id) {
            return Err(from_code("InvalidInstanceID.NotFound", instance_id));
        }
        let association_id = state.id("eipassoc");
        let (_, association) = state
            .addresses
            .get_mut(allocation_id)
            .ok_or_else(|| from_code("InvalidAllocationID.NotFound", allocation_id))?;
        *association = Some(association_id.clone());
        Ok(association_id)
    }

    async fn disassociate_address(&self, association_id: &str) -> BackendResult<()> {
        self.faults.enter("disassociate_address").await?;
        let mut state = self.lock();
        let slot = state
            .addresses
            .values_mut()
            .find(|(_, a)| a.as_deref() == Some(association_id))
            .ok_or_else(|| from_code("InvalidAssociationID.NotFound", association_id))?;
        slot.1 = None;
        Ok(())
    }

    async fn release_address(&self, allocation_id: &str) -> BackendResult<()> {
        self.faults.enter("release_address").await?;
        let mut state = self.lock();
        match state.addresses.get(allocation_id) {
            None => Err(from_code("InvalidAllocationID.NotFound", allocation_id)),
            Some((_, Some(_))) => Err(from_code("InvalidIPAddress.InUse", allocation_id)),
            Some(_) => {
                state.addresses.remove(allocation_id);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl StorageClient for FakeEc2 {
    async fn create_volume(
        &self,
        _size_gib: u32,
        _availability_zone: &str,
        tags: &Tags,
    ) -> BackendResult<String> {
        self.faults.enter("create_volume").await?;
        let mut state = self.lock();
        let id = state.id("vol");
        state.volumes.insert(
            id.clone(),
            FakeVolume {
                tags: tags.clone(),
                state: VolumeState::Available,
                attached_to: None,
            },
        );
        Ok(id)
    }

    async fn volume_state(&self, volume_id: &str) -> BackendResult<VolumeState> {
        self.faults.enter("volume_state").await?;
        self.lock()
            .volumes
            .get(volume_id)
            .map(|v| v.state)
            .ok_or_else(|| from_code("InvalidVolume.NotFound", volume_id))
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        _device: &str,
    ) -> BackendResult<()> {
        self.faults.enter("attach_volume").await?;
        let mut state = self.lock();
        if !state.instances.contains_key(instance_id) {
            return Err(from_code("InvalidInstanceID.NotFound", instance_id));
        }
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| from_code("InvalidVolume.NotFound", volume_id))?;
        if volume.attached_to.is_some() {
            return Err(from_code("VolumeInUse", volume_id));
        }
        volume.attached_to = Some(instance_id.to_string());
        volume.state = VolumeState::InUse;
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str) -> BackendResult<()> {
        self.faults.enter("detach_volume").await?;
        let mut state = self.lock();
        let volume = state
            .volumes
            .get_mut(volume_id)
            .ok_or_else(|| from_code("InvalidVolume.NotFound", volume_id))?;
        volume.attached_to = None;
        volume.state = VolumeState::Available;
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> BackendResult<()> {
        self.faults.enter("delete_volume").await?;
        let mut state = self.lock();
        match state.volumes.get(volume_id) {
            None => Err(from_code("InvalidVolume.NotFound", volume_id)),
            Some(v) if v.attached_to.is_some() => Err(from_code("VolumeInUse", volume_id)),
            Some(_) => {
                state.volumes.remove(volume_id);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl ComputeClient for FakeEc2 {
    async fn run_instance(&self, request: &InstanceRequest) -> BackendResult<String> {
        self.faults.enter("run_instance").await?;
        let (id, delay) = {
            let mut state = self.lock();
            let id = state.id("i");
            let polls = state.pending_polls;
            state.instances.insert(
                id.clone(),
                FakeInstance {
                    tags: request.tags.clone(),
                    state: InstanceState::Pending,
                    settle: Some((InstanceState::Running, polls)),
                    request: request.clone(),
                },
            );
            (id, state.launch_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(id)
    }

    async fn find_instance(&self, name: &str) -> BackendResult<Option<String>> {
        self.faults.enter("find_instance").await?;
        Ok(self
            .lock()
            .instances
            .iter()
            .find(|(_, i)| i.request.name == name && i.state != InstanceState::Terminated)
            .map(|(id, _)| id.clone()))
    }

    async fn describe_instance(&self, instance_id: &str) -> BackendResult<InstanceInfo> {
        self.faults.enter("describe_instance").await?;
        let mut state = self.lock();
        let instance = state
            .instances
            .get_mut(instance_id)
            .ok_or_else(|| from_code("InvalidInstanceID.NotFound", instance_id))?;
        match instance.settle {
            Some((target, 0)) => {
                instance.state = target;
                instance.settle = None;
            }
            Some((target, n)) => instance.settle = Some((target, n - 1)),
            None => {}
        }
        Ok(InstanceInfo {
            instance_id: instance_id.to_string(),
            state: instance.state,
            private_ip: Some("10.0.1.10".to_string()),
            public_ip: None,
        })
    }

    async fn start_instances(&self, instance_ids: &[String]) -> BackendResult<()> {
        self.faults.enter("start_instances").await?;
        self.move_instances(instance_ids, InstanceState::Pending, InstanceState::Running)
    }

    async fn stop_instances(&self, instance_ids: &[String]) -> BackendResult<()> {
        self.faults.enter("stop_instances").await?;
        self.move_instances(instance_ids, InstanceState::Stopping, InstanceState::Stopped)
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> BackendResult<()> {
        self.faults.enter("terminate_instances").await?;
        self.move_instances(
            instance_ids,
            InstanceState::ShuttingDown,
            InstanceState::Terminated,
        )
    }
}

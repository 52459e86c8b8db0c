//! In-memory Azure Resource Manager for tests
//!
//! Resources live inside resource groups; deleting a group removes
//! everything in it. VM power changes settle after a configurable number
//! of instance view reads.

use crate::client::{
    ComputeClient, InstanceView, NetworkClient, NicRequest, PowerState, ProvisioningState,
    PublicIp, ResourceGroupClient, SecurityRule, StorageClient, Tags, VmRequest,
};
use crate::error::from_response;
use async_trait::async_trait;
use leaseflow_cloud::testing::Faults;
use leaseflow_cloud::{BackendError, BackendResult, DEPLOYMENT_TAG};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone)]
struct FakeVm {
    tags: Tags,
    provisioning: ProvisioningState,
    power: Option<PowerState>,
    settle: Option<(PowerState, u32)>,
    request: VmRequest,
}

/// (group, type, name)
type Key = (String, &'static str, String);

#[derive(Debug, Default)]
struct State {
    next_ip: u8,
    groups: BTreeMap<String, Tags>,
    resources: BTreeMap<Key, Tags>,
    rules: BTreeMap<String, Vec<SecurityRule>>,
    vms: BTreeMap<(String, String), FakeVm>,
    pending_polls: u32,
    create_delay: Option<Duration>,
}

fn resource_id(group: &str, kind: &str, name: &str) -> String {
    format!(
        "/subscriptions/00000000-0000-0000-0000-000000000000/resourceGroups/{}/providers/{}/{}",
        group, kind, name
    )
}

fn not_found(what: &str) -> BackendError {
    from_response(404, "ResourceNotFound", what)
}

#[derive(Debug, Default)]
pub struct FakeAzure {
    state: Mutex<State>,
    pub faults: Faults,
}

impl FakeAzure {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pending_polls(self, polls: u32) -> Self {
        self.lock().pending_polls = polls;
        self
    }

    /// `create_vm` creates the VM, then answers only after `delay`
    pub fn slow_create(&self, delay: Duration) {
        self.lock().create_delay = Some(delay);
    }

    /// Pre-create an untagged group, as an operator would
    pub fn with_group(self, name: &str) -> Self {
        self.lock().groups.insert(name.to_string(), Tags::new());
        self
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.lock().groups.contains_key(name)
    }

    /// Everything tagged with `deployment_id`, as `type/name`
    pub fn tagged_resources(&self, deployment_id: &str) -> Vec<String> {
        let state = self.lock();
        let tagged = |tags: &Tags| tags.get(DEPLOYMENT_TAG).map(String::as_str) == Some(deployment_id);

        let mut found: Vec<String> = state
            .groups
            .iter()
            .filter(|(_, t)| tagged(t))
            .map(|(name, _)| format!("resourceGroups/{}", name))
            .collect();
        found.extend(
            state
                .resources
                .iter()
                .filter(|(_, t)| tagged(t))
                .map(|((_, kind, name), _)| format!("{}/{}", kind, name)),
        );
        found.extend(
            state
                .vms
                .iter()
                .filter(|(_, vm)| tagged(&vm.tags))
                .map(|((_, name), _)| format!("virtualMachines/{}", name)),
        );
        found
    }

    pub fn vm_request(&self, group: &str, name: &str) -> Option<VmRequest> {
        self.lock()
            .vms
            .get(&(group.to_string(), name.to_string()))
            .map(|vm| vm.request.clone())
    }

    pub fn nsg_rules(&self, nsg_id: &str) -> Vec<SecurityRule> {
        self.lock().rules.get(nsg_id).cloned().unwrap_or_default()
    }

    /// Change a VM's power state out of band
    pub fn set_power(&self, group: &str, name: &str, power: PowerState) {
        if let Some(vm) = self.lock().vms.get_mut(&(group.to_string(), name.to_string())) {
            vm.power = Some(power);
            vm.settle = None;
        }
    }

    pub fn delete_vm_out_of_band(&self, group: &str, name: &str) {
        self.lock().vms.remove(&(group.to_string(), name.to_string()));
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn create(
        &self,
        group: &str,
        kind: &'static str,
        name: &str,
        tags: &Tags,
    ) -> BackendResult<String> {
        let mut state = self.lock();
        if !state.groups.contains_key(group) {
            return Err(from_response(404, "ResourceGroupNotFound", group));
        }
        state
            .resources
            .insert((group.to_string(), kind, name.to_string()), tags.clone());
        Ok(resource_id(group, kind, name))
    }

    fn delete(&self, group: &str, kind: &'static str, name: &str) -> BackendResult<()> {
        self.lock()
            .resources
            .remove(&(group.to_string(), kind, name.to_string()))
            .map(|_| ())
            .ok_or_else(|| not_found(name))
    }

    fn set_target(&self, group: &str, name: &str, via: PowerState, target: PowerState) -> BackendResult<()> {
        let mut state = self.lock();
        let polls = state.pending_polls;
        let vm = state
            .vms
            .get_mut(&(group.to_string(), name.to_string()))
            .ok_or_else(|| not_found(name))?;
        vm.power = Some(via);
        vm.settle = Some((target, polls));
        Ok(())
    }
}

#[async_trait]
impl ResourceGroupClient for FakeAzure {
    async fn create_resource_group(
        &self,
        name: &str,
        _location: &str,
        tags: &Tags,
    ) -> BackendResult<()> {
        self.faults.enter("create_resource_group").await?;
        self.lock().groups.insert(name.to_string(), tags.clone());
        Ok(())
    }

    async fn resource_group_exists(&self, name: &str) -> BackendResult<bool> {
        self.faults.enter("resource_group_exists").await?;
        Ok(self.lock().groups.contains_key(name))
    }

    async fn delete_resource_group(&self, name: &str) -> BackendResult<()> {
        self.faults.enter("delete_resource_group").await?;
        let mut state = self.lock();
        if state.groups.remove(name).is_none() {
            return Err(from_response(404, "ResourceGroupNotFound", name));
        }
        state.resources.retain(|(group, _, _), _| group != name);
        state.vms.retain(|(group, _), _| group != name);
        Ok(())
    }
}

#[async_trait]
impl NetworkClient for FakeAzure {
    async fn create_vnet(
        &self,
        group: &str,
        name: &str,
        _cidr: &str,
        _subnet_cidr: &str,
        tags: &Tags,
    ) -> BackendResult<String> {
        self.faults.enter("create_vnet").await?;
        let id = self.create(group, "virtualNetworks", name, tags)?;
        Ok(format!("{}/subnets/default", id))
    }

    async fn delete_vnet(&self, group: &str, name: &str) -> BackendResult<()> {
        self.faults.enter("delete_vnet").await?;
        self.delete(group, "virtualNetworks", name)
    }

    async fn create_nsg(
        &self,
        group: &str,
        name: &str,
        rules: &[SecurityRule],
        tags: &Tags,
    ) -> BackendResult<String> {
        self.faults.enter("create_nsg").await?;
        let id = self.create(group, "networkSecurityGroups", name, tags)?;
        self.lock().rules.insert(id.clone(), rules.to_vec());
        Ok(id)
    }

    async fn delete_nsg(&self, group: &str, name: &str) -> BackendResult<()> {
        self.faults.enter("delete_nsg").await?;
        self.delete(group, "networkSecurityGroups", name)
    }

    async fn create_public_ip(
        &self,
        group: &str,
        name: &str,
        tags: &Tags,
    ) -> BackendResult<PublicIp> {
        self.faults.enter("create_public_ip").await?;
        let id = self.create(group, "publicIPAddresses", name, tags)?;
        let mut state = self.lock();
        state.next_ip = state.next_ip.wrapping_add(1);
        Ok(PublicIp {
            id,
            address: format!("198.51.100.{}", state.next_ip),
        })
    }

    async fn delete_public_ip(&self, group: &str, name: &str) -> BackendResult<()> {
        self.faults.enter("delete_public_ip").await?;
        self.delete(group, "publicIPAddresses", name)
    }

    async fn create_nic(
        &self,
        group: &str,
        name: &str,
        _request: &NicRequest,
        tags: &Tags,
    ) -> BackendResult<String> {
        self.faults.enter("create_nic").await?;
        self.create(group, "networkInterfaces", name, tags)
    }

    async fn delete_nic(&self, group: &str, name: &str) -> BackendResult<()> {
        self.faults.enter("delete_nic").await?;
        self.delete(group, "networkInterfaces", name)
    }
}

#[async_trait]
impl StorageClient for FakeAzure {
    async fn create_disk(
        &self,
        group: &str,
        name: &str,
        _size_gib: u32,
        tags: &Tags,
    ) -> BackendResult<String> {
        self.faults.enter("create_disk").await?;
        self.create(group, "disks", name, tags)
    }

    async fn delete_disk(&self, group: &str, name: &str) -> BackendResult<()> {
        self.faults.enter("delete_disk").await?;
        self.delete(group, "disks", name)
    }
}

#[async_trait]
impl ComputeClient for FakeAzure {
    async fn create_vm(&self, group: &str, request: &VmRequest) -> BackendResult<String> {
        self.faults.enter("create_vm").await?;
        let delay = {
            let mut state = self.lock();
            if !state.groups.contains_key(group) {
                return Err(from_response(404, "ResourceGroupNotFound", group));
            }
            let polls = state.pending_polls;
            state.vms.insert(
                (group.to_string(), request.name.clone()),
                FakeVm {
                    tags: request.tags.clone(),
                    provisioning: ProvisioningState::Succeeded,
                    power: Some(PowerState::Starting),
                    settle: Some((PowerState::Running, polls)),
                    request: request.clone(),
                },
            );
            state.create_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(resource_id(group, "virtualMachines", &request.name))
    }

    async fn instance_view(&self, group: &str, name: &str) -> BackendResult<InstanceView> {
        self.faults.enter("instance_view").await?;
        let mut state = self.lock();
        let vm = state
            .vms
            .get_mut(&(group.to_string(), name.to_string()))
            .ok_or_else(|| not_found(name))?;
        match vm.settle {
            Some((target, 0)) => {
                vm.power = Some(target);
                vm.settle = None;
            }
            Some((target, n)) => vm.settle = Some((target, n - 1)),
            None => {}
        }
        Ok(InstanceView {
            provisioning: vm.provisioning,
            power: vm.power,
        })
    }

    async fn start_vm(&self, group: &str, name: &str) -> BackendResult<()> {
        self.faults.enter("start_vm").await?;
        self.set_target(group, name, PowerState::Starting, PowerState::Running)
    }

    async fn power_off_vm(&self, group: &str, name: &str) -> BackendResult<()> {
        self.faults.enter("power_off_vm").await?;
        self.set_target(group, name, PowerState::Stopping, PowerState::Stopped)
    }

    async fn delete_vm(&self, group: &str, name: &str) -> BackendResult<()> {
        self.faults.enter("delete_vm").await?;
        self.lock()
            .vms
            .remove(&(group.to_string(), name.to_string()))
            .map(|_| ())
            .ok_or_else(|| not_found(name))
    }
}

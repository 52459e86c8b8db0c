//! In-memory vCenter for tests
//!
//! Mutating calls return a task whose effect is applied when it completes,
//! after a configurable number of `task_info` reads. Power changes that
//! do not fit the VM's state fail the task with `InvalidPowerState`, as
//! vCenter does.

use crate::client::{
    HardwareSpec, InventoryClient, Placement, PlacementSpec, Tags, TaskClient, TaskHandle,
    TaskState, VmClient, VmPowerState,
};
use crate::error::from_fault;
use async_trait::async_trait;
use leaseflow_cloud::testing::Faults;
use leaseflow_cloud::{BackendResult, DEPLOYMENT_TAG};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct FakeVm {
    name: String,
    template: String,
    tags: Tags,
    power: VmPowerState,
    hardware: Option<HardwareSpec>,
}

#[derive(Debug, Clone)]
enum Effect {
    Clone {
        template: String,
        name: String,
        tags: Tags,
    },
    Reconfigure {
        vm: String,
        spec: HardwareSpec,
    },
    Power {
        vm: String,
        target: VmPowerState,
    },
    Destroy {
        vm: String,
    },
}

impl Effect {
    fn kind(&self) -> &'static str {
        match self {
            Effect::Clone { .. } => "clone_vm",
            Effect::Reconfigure { .. } => "reconfigure_vm",
            Effect::Power {
                target: VmPowerState::PoweredOn,
                ..
            } => "power_on",
            Effect::Power {
                target: VmPowerState::PoweredOff,
                ..
            } => "power_off",
            Effect::Power {
                target: VmPowerState::Suspended,
                ..
            } => "suspend",
            Effect::Destroy { .. } => "destroy",
        }
    }
}

#[derive(Debug)]
struct FakeTask {
    effect: Effect,
    remaining: u32,
    state: TaskState,
}

#[derive(Debug, Default)]
struct State {
    next_id: u32,
    templates: BTreeMap<(String, String), String>,
    vms: BTreeMap<String, FakeVm>,
    tasks: BTreeMap<String, FakeTask>,
    pending_polls: u32,
    slow: HashMap<&'static str, u32>,
    task_faults: HashMap<&'static str, String>,
    ignore_cancel: bool,
}

impl State {
    fn next(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, 1000 + self.next_id)
    }

    /// Apply a finished task's effect, yielding its terminal state
    fn complete(&mut self, effect: &Effect, fault: Option<&str>) -> TaskState {
        if let Some(fault) = fault {
            return error(fault, "injected task fault");
        }
        match effect {
            Effect::Clone {
                template,
                name,
                tags,
            } => {
                if self.vms.values().any(|vm| &vm.name == name) {
                    return error("DuplicateName", name);
                }
                let moref = self.next("vm");
                self.vms.insert(
                    moref.clone(),
                    FakeVm {
                        name: name.clone(),
                        template: template.clone(),
                        tags: tags.clone(),
                        power: VmPowerState::PoweredOff,
                        hardware: None,
                    },
                );
                TaskState::Success(Some(moref))
            }
            Effect::Reconfigure { vm, spec } => match self.vms.get_mut(vm) {
                Some(fake) if fake.power == VmPowerState::PoweredOff => {
                    fake.hardware = Some(spec.clone());
                    TaskState::Success(None)
                }
                Some(_) => error("InvalidPowerState", vm),
                None => error("ManagedObjectNotFound", vm),
            },
            Effect::Power { vm, target } => match self.vms.get_mut(vm) {
                Some(fake) => {
                    let allowed = match target {
                        VmPowerState::PoweredOn => fake.power != VmPowerState::PoweredOn,
                        VmPowerState::PoweredOff => fake.power != VmPowerState::PoweredOff,
                        VmPowerState::Suspended => fake.power == VmPowerState::PoweredOn,
                    };
                    if !allowed {
                        return error("InvalidPowerState", vm);
                    }
                    fake.power = *target;
                    TaskState::Success(None)
                }
                None => error("ManagedObjectNotFound", vm),
            },
            Effect::Destroy { vm } => match self.vms.get(vm) {
                Some(fake) if fake.power == VmPowerState::PoweredOn => {
                    error("InvalidPowerState", vm)
                }
                Some(_) => {
                    self.vms.remove(vm);
                    TaskState::Success(None)
                }
                None => error("ManagedObjectNotFound", vm),
            },
        }
    }
}

fn error(fault: &str, message: &str) -> TaskState {
    TaskState::Error {
        fault: fault.to_string(),
        message: message.to_string(),
    }
}

#[derive(Debug, Default)]
pub struct FakeVsphere {
    state: Mutex<State>,
    pub faults: Faults,
}

impl FakeVsphere {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads of `task_info` before a task completes
    pub fn with_pending_polls(self, polls: u32) -> Self {
        self.lock().pending_polls = polls;
        self
    }

    pub fn with_template(self, datacenter: &str, name: &str) -> Self {
        {
            let mut state = self.lock();
            let moref = state.next("vm");
            state
                .templates
                .insert((datacenter.to_string(), name.to_string()), moref);
        }
        self
    }

    /// Tasks of `kind` (a client method name) take `polls` reads instead
    pub fn slow_task(&self, kind: &'static str, polls: u32) {
        self.lock().slow.insert(kind, polls);
    }

    /// Tasks of `kind` end in error with `fault`
    pub fn fail_task(&self, kind: &'static str, fault: &str) {
        self.lock().task_faults.insert(kind, fault.to_string());
    }

    /// Let cancelled tasks run to completion anyway
    pub fn ignore_cancel(&self) {
        self.lock().ignore_cancel = true;
    }

    /// Names of VMs tagged with `deployment_id`
    pub fn tagged_resources(&self, deployment_id: &str) -> Vec<String> {
        self.lock()
            .vms
            .values()
            .filter(|vm| vm.tags.get(DEPLOYMENT_TAG).map(String::as_str) == Some(deployment_id))
            .map(|vm| vm.name.clone())
            .collect()
    }

    pub fn power_of(&self, name: &str) -> Option<VmPowerState> {
        self.find(name, |vm| vm.power)
    }

    pub fn hardware_of(&self, name: &str) -> Option<HardwareSpec> {
        self.find(name, |vm| vm.hardware.clone()).flatten()
    }

    pub fn template_of(&self, name: &str) -> Option<String> {
        self.find(name, |vm| vm.template.clone())
    }

    /// Change a VM's power state out of band
    pub fn set_power(&self, name: &str, power: VmPowerState) {
        let mut state = self.lock();
        if let Some(vm) = state.vms.values_mut().find(|vm| vm.name == name) {
            vm.power = power;
        }
    }

    pub fn destroy_out_of_band(&self, name: &str) {
        self.lock().vms.retain(|_, vm| vm.name != name);
    }

    /// Tasks not yet in a terminal state
    pub fn pending_tasks(&self) -> usize {
        self.lock()
            .tasks
            .values()
            .filter(|t| !t.state.is_terminal())
            .count()
    }

    fn find<T>(&self, name: &str, f: impl FnOnce(&FakeVm) -> T) -> Option<T> {
        self.lock().vms.values().find(|vm| vm.name == name).map(f)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn submit(&self, effect: Effect) -> TaskHandle {
        let mut state = self.lock();
        let remaining = state
            .slow
            .get(effect.kind())
            .copied()
            .unwrap_or(state.pending_polls);
        let id = state.next("task");
        state.tasks.insert(
            id.clone(),
            FakeTask {
                effect,
                remaining,
                state: TaskState::Queued,
            },
        );
        TaskHandle(id)
    }

    fn existing(&self, vm: &str) -> BackendResult<()> {
        if self.lock().vms.contains_key(vm) {
            Ok(())
        } else {
            Err(from_fault("ManagedObjectNotFound", vm))
        }
    }
}

#[async_trait]
impl InventoryClient for FakeVsphere {
    async fn find_template(&self, datacenter: &str, name: &str) -> BackendResult<Option<String>> {
        self.faults.enter("find_template").await?;
        Ok(self
            .lock()
            .templates
            .get(&(datacenter.to_string(), name.to_string()))
            .cloned())
    }

    async fn resolve_placement(&self, spec: &PlacementSpec) -> BackendResult<Placement> {
        self.faults.enter("resolve_placement").await?;
        Ok(Placement {
            resource_pool: format!("resgroup-{}", spec.cluster),
            datastore: format!("datastore-{}", spec.datastore),
            network: format!("network-{}", spec.network),
            folder: format!(
                "group-{}",
                spec.folder.as_deref().unwrap_or(spec.datacenter.as_str())
            ),
        })
    }

    async fn find_vm(&self, _datacenter: &str, name: &str) -> BackendResult<Option<String>> {
        self.faults.enter("find_vm").await?;
        Ok(self
            .lock()
            .vms
            .iter()
            .find(|(_, vm)| vm.name == name)
            .map(|(moref, _)| moref.clone()))
    }
}

#[async_trait]
impl VmClient for FakeVsphere {
    async fn clone_vm(
        &self,
        template: &str,
        name: &str,
        _placement: &Placement,
        tags: &Tags,
    ) -> BackendResult<TaskHandle> {
        self.faults.enter("clone_vm").await?;
        Ok(self.submit(Effect::Clone {
            template: template.to_string(),
            name: name.to_string(),
            tags: tags.clone(),
        }))
    }

    async fn reconfigure_vm(&self, vm: &str, spec: &HardwareSpec) -> BackendResult<TaskHandle> {
        self.faults.enter("reconfigure_vm").await?;
        self.existing(vm)?;
        Ok(self.submit(Effect::Reconfigure {
            vm: vm.to_string(),
            spec: spec.clone(),
        }))
    }

    async fn power_on(&self, vm: &str) -> BackendResult<TaskHandle> {
        self.faults.enter("power_on").await?;
        self.existing(vm)?;
        Ok(self.submit(Effect::Power {
            vm: vm.to_string(),
            target: VmPowerState::PoweredOn,
        }))
    }

    async fn power_off(&self, vm: &str) -> BackendResult<TaskHandle> {
        self.faults.enter("power_off").await?;
        self.existing(vm)?;
        Ok(self.submit(Effect::Power {
            vm: vm.to_string(),
            target: VmPowerState::PoweredOff,
        }))
    }

    async fn suspend(&self, vm: &str) -> BackendResult<TaskHandle> {
        self.faults.enter("suspend").await?;
        self.existing(vm)?;
        Ok(self.submit(Effect::Power {
            vm: vm.to_string(),
            target: VmPowerState::Suspended,
        }))
    }

    async fn destroy(&self, vm: &str) -> BackendResult<TaskHandle> {
        self.faults.enter("destroy").await?;
        self.existing(vm)?;
        Ok(self.submit(Effect::Destroy { vm: vm.to_string() }))
    }

    async fn power_state(&self, vm: &str) -> BackendResult<VmPowerState> {
        self.faults.enter("power_state").await?;
        self.lock()
            .vms
            .get(vm)
            .map(|fake| fake.power)
            .ok_or_else(|| from_fault("ManagedObjectNotFound", vm))
    }
}

#[async_trait]
impl TaskClient for FakeVsphere {
    async fn task_info(&self, task: &TaskHandle) -> BackendResult<TaskState> {
        self.faults.enter("task_info").await?;
        let mut guard = self.lock();
        let state = &mut *guard;
        let fake = state
            .tasks
            .get_mut(&task.0)
            .ok_or_else(|| from_fault("ManagedObjectNotFound", task))?;
        if fake.state.is_terminal() {
            return Ok(fake.state.clone());
        }
        if fake.remaining > 0 {
            fake.remaining -= 1;
            fake.state = TaskState::Running;
            return Ok(TaskState::Running);
        }

        let effect = fake.effect.clone();
        let fault = state.task_faults.get(effect.kind()).cloned();
        let outcome = state.complete(&effect, fault.as_deref());
        if let Some(fake) = state.tasks.get_mut(&task.0) {
            fake.state = outcome.clone();
        }
        Ok(outcome)
    }

    async fn cancel_task(&self, task: &TaskHandle) -> BackendResult<()> {
        self.faults.enter("cancel_task").await?;
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(fake) = state.tasks.get(&task.0) else {
            return Err(from_fault("ManagedObjectNotFound", task));
        };
        if fake.state.is_terminal() {
            return Ok(());
        }

        let effect = fake.effect.clone();
        let outcome = if state.ignore_cancel {
            state.complete(&effect, None)
        } else {
            error("RequestCanceled", &task.0)
        };
        if let Some(fake) = state.tasks.get_mut(&task.0) {
            fake.state = outcome;
        }
        Ok(())
    }
}

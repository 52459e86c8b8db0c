//! Native resources created for one deployment
//!
//! Filled in step by step during provisioning so that rollback and
//! terminate share a single release path.

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwsResources {
    /// Only set when the adapter created the VPC
    pub vpc_id: Option<String>,
    /// Only set when the adapter created the subnet
    pub subnet_id: Option<String>,
    pub security_group_id: Option<String>,
    pub volumes: Vec<VolumeRecord>,
    pub instances: Vec<InstanceRecord>,
    /// Launches whose `RunInstances` answer never arrived
    pub launching: Vec<LaunchRecord>,
    pub addresses: Vec<AddressRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRecord {
    pub name: String,
    pub volume_id: String,
    /// Instance the volume is attached to
    pub attached_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub service: String,
    pub instance_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    pub service: String,
    /// `Name` tag of the instance
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressRecord {
    pub allocation_id: String,
    pub public_ip: String,
    pub association_id: Option<String>,
}

impl AwsResources {
    pub fn is_empty(&self) -> bool {
        self.vpc_id.is_none()
            && self.subnet_id.is_none()
            && self.security_group_id.is_none()
            && self.volumes.is_empty()
            && self.instances.is_empty()
            && self.launching.is_empty()
            && self.addresses.is_empty()
    }

    pub fn instance_ids(&self) -> Vec<String> {
        self.instances.iter().map(|i| i.instance_id.clone()).collect()
    }

    pub fn instance_for(&self, service: &str) -> Option<&str> {
        self.instances
            .iter()
            .find(|i| i.service == service)
            .map(|i| i.instance_id.as_str())
    }

    pub fn volume_id(&self, name: &str) -> Option<&str> {
        self.volumes
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.volume_id.as_str())
    }
}

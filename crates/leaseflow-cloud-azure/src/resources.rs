//! ARM resources created for one deployment

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AzureResources {
    /// Resource group everything lives in
    pub resource_group: Option<String>,
    /// Whether the adapter created the group (and so deletes it)
    pub owns_group: bool,
    pub vnet: Option<String>,
    pub subnet_id: Option<String>,
    pub nsg: Option<NamedResource>,
    pub disks: Vec<DiskRecord>,
    pub public_ips: Vec<PublicIpRecord>,
    pub nics: Vec<NamedResource>,
    pub vms: Vec<VmRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedResource {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskRecord {
    pub volume: String,
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicIpRecord {
    pub name: String,
    pub id: String,
    pub address: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRecord {
    pub service: String,
    pub name: String,
    /// Unset until `CreateVirtualMachine` answers; release goes by name
    pub id: Option<String>,
}

impl AzureResources {
    /// Whether nothing but possibly a shared group is recorded
    pub fn is_empty(&self) -> bool {
        !self.owns_group
            && self.vnet.is_none()
            && self.nsg.is_none()
            && self.disks.is_empty()
            && self.public_ips.is_empty()
            && self.nics.is_empty()
            && self.vms.is_empty()
    }

    pub fn disk_id(&self, volume: &str) -> Option<&str> {
        self.disks
            .iter()
            .find(|d| d.volume == volume)
            .map(|d| d.id.as_str())
    }

    pub fn vm_names(&self) -> Vec<String> {
        self.vms.iter().map(|v| v.name.clone()).collect()
    }
}

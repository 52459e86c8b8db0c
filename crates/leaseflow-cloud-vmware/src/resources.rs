//! vSphere objects created for one deployment

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VsphereResources {
    pub datacenter: Option<String>,
    pub vms: Vec<VmRecord>,
}

/// A clone, recorded before its task is submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRecord {
    pub service: String,
    pub name: String,
    /// Set once the clone task reports the new VM
    pub moref: Option<String>,
}

impl VsphereResources {
    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }

    pub fn morefs(&self) -> Vec<String> {
        self.vms.iter().filter_map(|v| v.moref.clone()).collect()
    }
}

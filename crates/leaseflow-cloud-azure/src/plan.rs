//! Manifest to ARM resource plan

use crate::client::{ImageReference, SecurityRule};
use leaseflow_cloud::{BackendKind, CloudError, Result};
use leaseflow_config::AzureSettings;
use leaseflow_core::{Manifest, Protocol, ResourceSpec, ServiceKind, ServiceSpec};

const BACKEND: BackendKind = BackendKind::Azure;

/// (size, vCPUs, memory GiB, GPUs)
const B_SERIES: &[(&str, u32, f64, i64)] = &[
    ("Standard_B1ls", 1, 0.5, 0),
    ("Standard_B1s", 1, 1.0, 0),
    ("Standard_B1ms", 1, 2.0, 0),
    ("Standard_B2s", 2, 4.0, 0),
    ("Standard_B2ms", 2, 8.0, 0),
    ("Standard_B4ms", 4, 16.0, 0),
    ("Standard_B8ms", 8, 32.0, 0),
    ("Standard_B12ms", 12, 48.0, 0),
    ("Standard_B16ms", 16, 64.0, 0),
    ("Standard_B20ms", 20, 80.0, 0),
];

const NC_T4: &[(&str, u32, f64, i64)] = &[
    ("Standard_NC4as_T4_v3", 4, 28.0, 1),
    ("Standard_NC8as_T4_v3", 8, 56.0, 1),
    ("Standard_NC16as_T4_v3", 16, 110.0, 1),
    ("Standard_NC64as_T4_v3", 64, 440.0, 4),
];

const FIRST_RULE_PRIORITY: u16 = 100;
const MAX_LUNS: usize = 64;

pub fn vm_size_for(resources: &ResourceSpec) -> Option<&'static str> {
    let table = if resources.gpu > 0 { NC_T4 } else { B_SERIES };
    table
        .iter()
        .find(|(_, vcpus, mem, gpus)| {
            *vcpus >= resources.vcpus()
                && *mem >= resources.memory_gib()
                && *gpus >= resources.gpu
        })
        .map(|(name, ..)| *name)
}

/// Parse `publisher:offer:sku:version`, or `publisher:offer:sku` with the
/// version taken from the service tag
pub fn image_reference(service: &ServiceSpec) -> Result<ImageReference> {
    let parts: Vec<&str> = service.image.split(':').collect();
    let malformed = || {
        CloudError::invalid_spec(
            BACKEND,
            format!(
                "service '{}': image '{}' is not publisher:offer:sku[:version]",
                service.name, service.image
            ),
        )
    };
    if parts.iter().any(|p| p.trim().is_empty()) {
        return Err(malformed());
    }

    let version = match (parts.len(), &service.tag) {
        (4, None) => parts[3].to_string(),
        (3, Some(tag)) => tag.clone(),
        (3, None) => "latest".to_string(),
        _ => return Err(malformed()),
    };
    Ok(ImageReference {
        publisher: parts[0].to_string(),
        offer: parts[1].to_string(),
        sku: parts[2].to_string(),
        version,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct VmPlan {
    pub service: String,
    pub size: String,
    pub image: ImageReference,
    /// (volume name, LUN)
    pub disks: Vec<(String, u8)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiskPlan {
    pub name: String,
    pub size_gib: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AzurePlan {
    pub vms: Vec<VmPlan>,
    pub disks: Vec<DiskPlan>,
    pub rules: Vec<SecurityRule>,
}

impl AzurePlan {
    pub fn build(manifest: &Manifest, settings: &AzureSettings) -> Result<Self> {
        leaseflow_core::validate(manifest)?;

        let mut vms = Vec::with_capacity(manifest.services.len());
        let mut rules: Vec<SecurityRule> = Vec::new();

        for service in &manifest.services {
            if service.kind != ServiceKind::Vm {
                return Err(CloudError::invalid_spec(
                    BACKEND,
                    format!(
                        "service '{}' is a {}; Azure VMs run vm services only",
                        service.name, service.kind
                    ),
                ));
            }
            let image = image_reference(service)?;
            let size = match &settings.vm_size {
                Some(size) => size.clone(),
                None => vm_size_for(&service.resources)
                    .ok_or_else(|| {
                        CloudError::invalid_spec(
                            BACKEND,
                            format!("service '{}': no VM size fits", service.name),
                        )
                    })?
                    .to_string(),
            };

            if service.volumes.len() > MAX_LUNS {
                return Err(CloudError::invalid_spec(
                    BACKEND,
                    format!("service '{}': too many data disks", service.name),
                ));
            }
            let mut disks = Vec::with_capacity(service.volumes.len());
            for (lun, mount) in service.volumes.iter().enumerate() {
                if manifest.volume_users(&mount.name).len() > 1 {
                    return Err(CloudError::invalid_spec(
                        BACKEND,
                        format!(
                            "volume '{}' is shared; managed disks attach to one VM",
                            mount.name
                        ),
                    ));
                }
                disks.push((mount.name.clone(), lun as u8));
            }

            for port in service.exposed_ports() {
                let protocol = match port.protocol {
                    Protocol::Tcp => "Tcp",
                    Protocol::Udp => "Udp",
                };
                if rules
                    .iter()
                    .any(|r| r.port == port.container_port && r.protocol == protocol)
                {
                    continue;
                }
                rules.push(SecurityRule {
                    name: format!("allow-{}-{}", protocol.to_lowercase(), port.container_port),
                    priority: FIRST_RULE_PRIORITY + 10 * rules.len() as u16,
                    protocol: protocol.to_string(),
                    port: port.container_port,
                });
            }

            vms.push(VmPlan {
                service: service.name.clone(),
                size,
                image,
                disks,
            });
        }

        let disks = manifest
            .volumes
            .iter()
            .map(|v| DiskPlan {
                name: v.name.clone(),
                size_gib: v.size_gib(),
            })
            .collect();

        Ok(Self { vms, disks, rules })
    }
}

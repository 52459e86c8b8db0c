//! Manifest to vSphere clone plan

use crate::client::{DiskSpec, HardwareSpec, PlacementSpec};
use leaseflow_cloud::{BackendKind, CloudError, Result};
use leaseflow_config::VsphereSettings;
use leaseflow_core::{Manifest, ServiceKind, ServiceSpec};

const BACKEND: BackendKind = BackendKind::Vmware;

/// Template name for a service: the image, suffixed `-<tag>` when tagged
pub fn template_name(service: &ServiceSpec) -> String {
    match &service.tag {
        Some(tag) => format!("{}-{}", service.image, tag),
        None => service.image.clone(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClonePlan {
    pub service: String,
    pub template: String,
    pub hardware: HardwareSpec,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VspherePlan {
    pub placement: PlacementSpec,
    pub clones: Vec<ClonePlan>,
}

impl VspherePlan {
    pub fn build(manifest: &Manifest, settings: &VsphereSettings) -> Result<Self> {
        leaseflow_core::validate(manifest)?;

        let mut clones = Vec::with_capacity(manifest.services.len());
        for service in &manifest.services {
            if service.kind != ServiceKind::Vm {
                return Err(CloudError::invalid_spec(
                    BACKEND,
                    format!(
                        "service '{}' is a {}; vSphere clones run vm services only",
                        service.name, service.kind
                    ),
                ));
            }
            if service.resources.gpu > 0 {
                return Err(CloudError::invalid_spec(
                    BACKEND,
                    format!(
                        "service '{}': GPU passthrough is configured on the template, not requested",
                        service.name
                    ),
                ));
            }

            let mut disks = Vec::with_capacity(service.volumes.len());
            for mount in &service.volumes {
                if manifest.volume_users(&mount.name).len() > 1 {
                    return Err(CloudError::invalid_spec(
                        BACKEND,
                        format!(
                            "volume '{}' is shared; a virtual disk belongs to one VM",
                            mount.name
                        ),
                    ));
                }
                // validate() guarantees the volume is declared
                if let Some(volume) = manifest.volume(&mount.name) {
                    disks.push(DiskSpec {
                        label: volume.name.clone(),
                        size_gib: volume.size_gib(),
                    });
                }
            }

            clones.push(ClonePlan {
                service: service.name.clone(),
                template: template_name(service),
                hardware: HardwareSpec {
                    cpus: service.resources.vcpus(),
                    memory_mib: service.resources.memory_mib(),
                    disks,
                },
            });
        }

        Ok(Self {
            placement: PlacementSpec {
                datacenter: settings.datacenter.clone(),
                cluster: settings.cluster.clone(),
                datastore: settings.datastore.clone(),
                network: settings.network.clone(),
                folder: settings.folder.clone(),
            },
            clones,
        })
    }
}

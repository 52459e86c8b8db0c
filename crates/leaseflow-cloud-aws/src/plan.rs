//! Manifest to EC2 resource plan
//!
//! Everything here is pure; a plan that cannot be built is rejected before
//! any backend call.

use crate::client::IngressRule;
use leaseflow_cloud::{BackendKind, CloudError, Result};
use leaseflow_config::AwsSettings;
use leaseflow_core::{Manifest, ResourceSpec, ServiceKind};

const BACKEND: BackendKind = BackendKind::Aws;

/// (type, vCPUs, memory GiB, GPUs), smallest first within each family
const BURSTABLE: &[(&str, u32, f64, i64)] = &[
    ("t3.nano", 2, 0.5, 0),
    ("t3.micro", 2, 1.0, 0),
    ("t3.small", 2, 2.0, 0),
    ("t3.medium", 2, 4.0, 0),
    ("t3.large", 2, 8.0, 0),
    ("t3.xlarge", 4, 16.0, 0),
    ("t3.2xlarge", 8, 32.0, 0),
    ("m5.4xlarge", 16, 64.0, 0),
    ("m5.8xlarge", 32, 128.0, 0),
    ("m5.12xlarge", 48, 192.0, 0),
    ("m5.16xlarge", 64, 256.0, 0),
    ("m5.24xlarge", 96, 384.0, 0),
];

const GPU: &[(&str, u32, f64, i64)] = &[
    ("g4dn.xlarge", 4, 16.0, 1),
    ("g4dn.2xlarge", 8, 32.0, 1),
    ("g4dn.4xlarge", 16, 64.0, 1),
    ("g4dn.12xlarge", 48, 192.0, 4),
    ("g4dn.metal", 96, 384.0, 8),
];

/// First device name handed to data volumes
const FIRST_DEVICE: u8 = b'f';
const LAST_DEVICE: u8 = b'p';

/// Smallest instance type that satisfies `resources`
pub fn instance_type_for(resources: &ResourceSpec) -> Option<&'static str> {
    let table = if resources.gpu > 0 { GPU } else { BURSTABLE };
    table
        .iter()
        .find(|(_, vcpus, mem, gpus)| {
            *vcpus >= resources.vcpus()
                && *mem >= resources.memory_gib()
                && *gpus >= resources.gpu
        })
        .map(|(name, ..)| *name)
}

#[derive(Debug, Clone, PartialEq)]
pub struct MountPlan {
    pub volume: String,
    pub device: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstancePlan {
    pub service: String,
    pub image_id: String,
    pub instance_type: String,
    pub mounts: Vec<MountPlan>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VolumePlan {
    pub name: String,
    pub size_gib: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AwsPlan {
    pub instances: Vec<InstancePlan>,
    pub volumes: Vec<VolumePlan>,
    pub ingress: Vec<IngressRule>,
}

impl AwsPlan {
    pub fn build(manifest: &Manifest, settings: &AwsSettings) -> Result<Self> {
        leaseflow_core::validate(manifest)?;

        let mut instances = Vec::with_capacity(manifest.services.len());
        let mut ingress: Vec<IngressRule> = Vec::new();

        for service in &manifest.services {
            if service.kind != ServiceKind::Vm {
                return Err(CloudError::invalid_spec(
                    BACKEND,
                    format!(
                        "service '{}' is a {}; EC2 runs vm services only",
                        service.name, service.kind
                    ),
                ));
            }
            if !service.image.starts_with("ami-") {
                return Err(CloudError::invalid_spec(
                    BACKEND,
                    format!("service '{}': image must be an AMI id", service.name),
                ));
            }

            let instance_type = match &settings.instance_type {
                Some(t) => t.clone(),
                None => instance_type_for(&service.resources)
                    .ok_or_else(|| {
                        CloudError::invalid_spec(
                            BACKEND,
                            format!("service '{}': no instance type fits", service.name),
                        )
                    })?
                    .to_string(),
            };

            let mut mounts = Vec::with_capacity(service.volumes.len());
            for (i, mount) in service.volumes.iter().enumerate() {
                let users = manifest.volume_users(&mount.name);
                if users.len() > 1 {
                    return Err(CloudError::invalid_spec(
                        BACKEND,
                        format!(
                            "volume '{}' is mounted by {}; EBS volumes attach to one instance",
                            mount.name,
                            users.join(", ")
                        ),
                    ));
                }
                let letter = FIRST_DEVICE + i as u8;
                if letter > LAST_DEVICE {
                    return Err(CloudError::invalid_spec(
                        BACKEND,
                        format!("service '{}': too many volumes", service.name),
                    ));
                }
                mounts.push(MountPlan {
                    volume: mount.name.clone(),
                    device: format!("/dev/sd{}", letter as char),
                });
            }

            for port in service.exposed_ports() {
                let rule = IngressRule {
                    protocol: port.protocol.as_str().to_string(),
                    port: port.container_port,
                    cidr: "0.0.0.0/0".to_string(),
                };
                if !ingress.contains(&rule) {
                    ingress.push(rule);
                }
            }

            instances.push(InstancePlan {
                service: service.name.clone(),
                image_id: service.image.clone(),
                instance_type,
                mounts,
            });
        }

        let volumes = manifest
            .volumes
            .iter()
            .map(|v| VolumePlan {
                name: v.name.clone(),
                size_gib: v.size_gib(),
            })
            .collect();

        Ok(Self {
            instances,
            volumes,
            ingress,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leaseflow_core::{GIB, MIB, parse_str};

    #[test]
    fn test_instance_type_selection() {
        let spec = |cpu, memory, gpu| ResourceSpec { cpu, memory, gpu };
        assert_eq!(instance_type_for(&spec(500, 512 * MIB, 0)), Some("t3.nano"));
        assert_eq!(instance_type_for(&spec(1000, GIB, 0)), Some("t3.micro"));
        assert_eq!(instance_type_for(&spec(3000, 4 * GIB, 0)), Some("t3.xlarge"));
        assert_eq!(instance_type_for(&spec(4000, 16 * GIB, 1)), Some("g4dn.xlarge"));
        assert_eq!(instance_type_for(&spec(200_000, GIB, 0)), None);
    }

    #[test]
    fn test_plan_devices_and_ingress() {
        let manifest = parse_str(
            r#"
version: v1
name: db
services:
  - name: pg
    type: vm
    image: ami-0abc
    resources: { cpu: 2000, memory: 4294967296 }
    ports:
      - { name: ssh, containerPort: 22, expose: true }
      - { name: pg, containerPort: 5432, expose: false }
    volumes:
      - { name: data, mountPath: /var/lib/pg }
      - { name: wal, mountPath: /var/lib/wal }
volumes:
  - { name: data, size: 21474836480 }
  - { name: wal, size: 1 }
"#,
        )
        .unwrap();

        let plan = AwsPlan::build(&manifest, &AwsSettings::default()).unwrap();
        let pg = &plan.instances[0];
        assert_eq!(pg.instance_type, "t3.medium");
        assert_eq!(pg.mounts[0].device, "/dev/sdf");
        assert_eq!(pg.mounts[1].device, "/dev/sdg");
        assert_eq!(plan.ingress.len(), 1);
        assert_eq!(plan.ingress[0].port, 22);
        assert_eq!(plan.volumes[0].size_gib, 20);
        assert_eq!(plan.volumes[1].size_gib, 1);
    }

    #[test]
    fn test_shared_volume_rejected() {
        let manifest = parse_str(
            r#"
version: v1
name: shared
services:
  - name: a
    type: vm
    image: ami-1
    resources: { cpu: 1000, memory: 1073741824 }
    volumes: [{ name: data, mountPath: /data }]
  - name: b
    type: vm
    image: ami-1
    resources: { cpu: 1000, memory: 1073741824 }
    volumes: [{ name: data, mountPath: /data }]
volumes:
  - { name: data, size: 1073741824 }
"#,
        )
        .unwrap();
        let err = AwsPlan::build(&manifest, &AwsSettings::default()).unwrap_err();
        assert!(matches!(err, CloudError::InvalidSpec { .. }));
    }

    #[test]
    fn test_container_service_rejected() {
        let manifest = parse_str(
            r#"
version: v1
name: web
services:
  - name: web
    type: container
    image: nginx
    resources: { cpu: 500, memory: 268435456 }
"#,
        )
        .unwrap();
        assert!(AwsPlan::build(&manifest, &AwsSettings::default()).is_err());
    }

    #[test]
    fn test_instance_type_override() {
        let manifest = parse_str(
            r#"
version: v1
name: web
services:
  - name: web
    type: vm
    image: ami-1
    resources: { cpu: 500, memory: 268435456 }
"#,
        )
        .unwrap();
        let settings = AwsSettings {
            instance_type: Some("c6i.large".into()),
            ..AwsSettings::default()
        };
        let plan = AwsPlan::build(&manifest, &settings).unwrap();
        assert_eq!(plan.instances[0].instance_type, "c6i.large");
    }
}

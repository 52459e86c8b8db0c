//! Manifest to Kubernetes object plan

use crate::client::{
    AccessMode, ContainerLimits, ContainerPort, DeploymentRequest, Labels, NetworkPolicyRequest,
    PvcRequest, ServiceRequest, ServiceType, VolumeMount,
};
use leaseflow_cloud::{BackendKind, CloudError, DeploymentOptions, Result};
use leaseflow_config::KubernetesSettings;
use leaseflow_core::{Manifest, ServiceKind};

const BACKEND: BackendKind = BackendKind::Kubernetes;

pub const NAME_LABEL: &str = "app.kubernetes.io/name";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const REGISTRY_SECRET: &str = "lf-registry";
pub const ISOLATION_POLICY: &str = "lf-isolation";

/// RFC 1123 label, as required for namespace, Deployment and Service names
pub fn is_dns_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

fn is_label_value(s: &str) -> bool {
    s.len() <= 63
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

#[derive(Debug, Clone, PartialEq)]
pub struct K8sPlan {
    pub namespace: String,
    pub labels: Labels,
    pub pvcs: Vec<PvcRequest>,
    pub deployments: Vec<DeploymentRequest>,
    pub services: Vec<ServiceRequest>,
    pub network_policy: Option<NetworkPolicyRequest>,
}

impl K8sPlan {
    pub fn build(
        manifest: &Manifest,
        settings: &KubernetesSettings,
        deployment_id: &str,
        lease_id: &str,
        options: &DeploymentOptions,
    ) -> Result<Self> {
        leaseflow_core::validate(manifest)?;

        let namespace = format!("{}{}", settings.namespace_prefix, deployment_id);
        if !is_dns_label(&namespace) {
            return Err(CloudError::invalid_spec(
                BACKEND,
                format!("namespace '{}' is not a valid DNS label", namespace),
            ));
        }
        if options.replicas == 0 {
            return Err(CloudError::invalid_spec(BACKEND, "replicas must be at least 1"));
        }

        // Tags whose values are not valid label values are left off
        let mut labels: Labels = options
            .resource_tags(deployment_id, lease_id)
            .into_iter()
            .filter(|(_, v)| is_label_value(v))
            .collect();
        labels.insert(MANAGED_BY_LABEL.to_string(), "leaseflow".to_string());

        let pvcs = manifest
            .volumes
            .iter()
            .map(|volume| {
                let shared = manifest.volume_users(&volume.name).len() > 1 || options.replicas > 1;
                PvcRequest {
                    name: volume.name.clone(),
                    size_gib: volume.size_gib(),
                    storage_class: settings.storage_class.clone(),
                    access_mode: if shared {
                        AccessMode::ReadWriteMany
                    } else {
                        AccessMode::ReadWriteOnce
                    },
                    labels: labels.clone(),
                }
            })
            .collect::<Vec<_>>();
        for pvc in &pvcs {
            if !is_dns_label(&pvc.name) {
                return Err(CloudError::invalid_spec(
                    BACKEND,
                    format!("volume name '{}' is not a valid DNS label", pvc.name),
                ));
            }
        }

        let image_pull_secret = options
            .registry_credentials
            .as_ref()
            .map(|_| REGISTRY_SECRET.to_string());

        let mut deployments = Vec::with_capacity(manifest.services.len());
        let mut services = Vec::new();
        let mut exposed = Vec::new();
        for service in &manifest.services {
            if service.kind != ServiceKind::Container {
                return Err(CloudError::invalid_spec(
                    BACKEND,
                    format!(
                        "service '{}' is a {}; Kubernetes runs container services only",
                        service.name, service.kind
                    ),
                ));
            }
            if !is_dns_label(&service.name) {
                return Err(CloudError::invalid_spec(
                    BACKEND,
                    format!("service name '{}' is not a valid DNS label", service.name),
                ));
            }

            let selector = Labels::from([(NAME_LABEL.to_string(), service.name.clone())]);
            let mut pod_labels = labels.clone();
            pod_labels.extend(selector.clone());

            let ports: Vec<ContainerPort> = service
                .ports
                .iter()
                .map(|p| ContainerPort {
                    name: p.name.clone(),
                    port: p.container_port,
                    protocol: p.protocol.as_upper_str().to_string(),
                })
                .collect();
            let service_exposed: Vec<ContainerPort> = service
                .exposed_ports()
                .map(|p| ContainerPort {
                    name: p.name.clone(),
                    port: p.container_port,
                    protocol: p.protocol.as_upper_str().to_string(),
                })
                .collect();

            deployments.push(DeploymentRequest {
                name: service.name.clone(),
                labels: pod_labels.clone(),
                selector: selector.clone(),
                image: service.image_ref(),
                replicas: options.replicas,
                limits: ContainerLimits {
                    cpu: service.resources.cpu_quantity(),
                    memory: service.resources.memory_quantity(),
                    gpu: service.resources.gpu,
                },
                ports: ports.clone(),
                volumes: service
                    .volumes
                    .iter()
                    .map(|m| VolumeMount {
                        claim: m.name.clone(),
                        mount_path: m.mount_path.clone(),
                    })
                    .collect(),
                image_pull_secret: image_pull_secret.clone(),
            });

            if !ports.is_empty() {
                let kind = if options.assign_public_ip && !service_exposed.is_empty() {
                    ServiceType::LoadBalancer
                } else {
                    ServiceType::ClusterIp
                };
                services.push(ServiceRequest {
                    name: service.name.clone(),
                    kind,
                    selector,
                    ports,
                    labels: labels.clone(),
                });
            }
            exposed.extend(service_exposed);
        }

        let network_policy = options.network_isolation.then(|| NetworkPolicyRequest {
            name: ISOLATION_POLICY.to_string(),
            exposed,
            labels: labels.clone(),
        });

        Ok(Self {
            namespace,
            labels,
            pvcs,
            deployments,
            services,
            network_policy,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use leaseflow_core::parse_str;

    const WEB: &str = r#"
version: v1
name: web
services:
  - name: web
    type: container
    image: nginx
    tag: "1.27"
    resources: { cpu: 500, memory: 268435456 }
    ports:
      - { name: http, containerPort: 80, expose: true }
      - { name: metrics, containerPort: 9100 }
  - name: worker
    type: container
    image: ghcr.io/acme/worker
    resources: { cpu: 250, memory: 134217728, gpu: 1 }
"#;

    fn build(options: &DeploymentOptions) -> Result<K8sPlan> {
        K8sPlan::build(
            &parse_str(WEB).unwrap(),
            &KubernetesSettings::default(),
            "d-1",
            "l-1",
            options,
        )
    }

    #[test]
    fn test_plan_objects() {
        let plan = build(&DeploymentOptions::default()).unwrap();
        assert_eq!(plan.namespace, "lf-d-1");

        let web = &plan.deployments[0];
        assert_eq!(web.image, "nginx:1.27");
        assert_eq!(web.limits.cpu, "500m");
        assert_eq!(web.limits.memory, "256Mi");
        assert_eq!(web.selector.get(NAME_LABEL).map(String::as_str), Some("web"));
        assert_eq!(plan.deployments[1].limits.gpu, 1);

        // worker has no ports and so no Service
        assert_eq!(plan.services.len(), 1);
        assert_eq!(plan.services[0].kind, ServiceType::ClusterIp);
        assert!(plan.network_policy.is_none());
    }

    #[test]
    fn test_public_ip_and_isolation() {
        let options = DeploymentOptions {
            network_isolation: true,
            ..DeploymentOptions::default().with_public_ip()
        };
        let plan = build(&options).unwrap();
        assert_eq!(plan.services[0].kind, ServiceType::LoadBalancer);
        let policy = plan.network_policy.unwrap();
        assert_eq!(policy.exposed.len(), 1);
        assert_eq!(policy.exposed[0].port, 80);
    }

    #[test]
    fn test_invalid_names_are_rejected() {
        let err = K8sPlan::build(
            &parse_str(WEB).unwrap(),
            &KubernetesSettings::default(),
            "Deploy_1",
            "l-1",
            &DeploymentOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, CloudError::InvalidSpec { .. }));

        let zero = DeploymentOptions {
            replicas: 0,
            ..DeploymentOptions::default()
        };
        assert!(build(&zero).is_err());
    }

    #[test]
    fn test_dns_label() {
        assert!(is_dns_label("lf-d-1"));
        assert!(!is_dns_label("-a"));
        assert!(!is_dns_label("A"));
        assert!(!is_dns_label(&"a".repeat(64)));
    }
}

//! Manifest data model
//!
//! The provider-agnostic description of a workload. Each concern lives in
//! its own module and is re-exported here.

mod manifest;
mod port;
mod resources;
mod service;
mod volume;

// Re-exports
pub use manifest::*;
pub use port::*;
pub use resources::*;
pub use service::*;
pub use volume::*;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest() -> Manifest {
        Manifest {
            version: "v1".to_string(),
            name: "inference".to_string(),
            services: vec![
                ServiceSpec {
                    name: "api".to_string(),
                    kind: ServiceKind::Container,
                    image: "ghcr.io/acme/api".to_string(),
                    tag: Some("1.4.0".to_string()),
                    resources: ResourceSpec {
                        cpu: 500,
                        memory: 256 * MIB,
                        gpu: 0,
                    },
                    ports: vec![
                        PortSpec::new("http", 8080, true),
                        PortSpec::new("metrics", 9090, false),
                    ],
                    volumes: vec![VolumeMountSpec::new("cache", "/var/cache")],
                },
                ServiceSpec {
                    name: "worker".to_string(),
                    kind: ServiceKind::Container,
                    image: "ghcr.io/acme/worker".to_string(),
                    tag: None,
                    resources: ResourceSpec {
                        cpu: 2000,
                        memory: 2 * GIB,
                        gpu: 1,
                    },
                    ports: vec![],
                    volumes: vec![],
                },
            ],
            volumes: vec![VolumeSpec::persistent("cache", 10 * GIB)],
        }
    }

    #[test]
    fn test_total_resources() {
        let manifest = sample_manifest();
        let total = manifest.total_resources();
        assert_eq!(total.cpu, 2500);
        assert_eq!(total.memory, 256 * MIB + 2 * GIB);
        assert_eq!(total.gpu, 1);
    }

    #[test]
    fn test_exposed_ports() {
        let manifest = sample_manifest();
        let exposed: Vec<_> = manifest.services[0].exposed_ports().collect();
        assert_eq!(exposed.len(), 1);
        assert_eq!(exposed[0].container_port, 8080);
        assert!(manifest.has_exposed_ports());
    }

    #[test]
    fn test_image_reference() {
        let manifest = sample_manifest();
        assert_eq!(manifest.services[0].image_ref(), "ghcr.io/acme/api:1.4.0");
        assert_eq!(manifest.services[1].image_ref(), "ghcr.io/acme/worker");
    }

    #[test]
    fn test_volume_lookup() {
        let manifest = sample_manifest();
        assert_eq!(manifest.volume("cache").map(|v| v.size), Some(10 * GIB));
        assert!(manifest.volume("missing").is_none());
    }

    #[test]
    fn test_manifest_serialization() {
        let manifest = sample_manifest();
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("\"containerPort\":8080"));
        assert!(json.contains("\"type\":\"container\""));
        assert!(json.contains("\"mountPath\":\"/var/cache\""));
    }
}

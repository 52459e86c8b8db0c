//! Manifest definition

use super::resources::ResourceSpec;
use super::service::ServiceSpec;
use super::volume::VolumeSpec;
use serde::{Deserialize, Serialize};

/// Manifest schema versions this crate understands
pub const SUPPORTED_VERSIONS: &[&str] = &["v1"];

/// Manifest
///
/// YAML form:
/// ```yaml
/// version: "v1"
/// name: inference
/// services:
///   - name: api
///     type: container
///     image: ghcr.io/acme/api
///     tag: "1.4.0"
///     resources: { cpu: 500, memory: 268435456, gpu: 0 }
///     ports:
///       - { name: http, containerPort: 8080, expose: true }
///     volumes:
///       - { name: cache, mountPath: /var/cache }
/// volumes:
///   - { name: cache, type: persistent, size: 10737418240 }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    /// Human-readable workload name, not a key
    pub name: String,
    pub services: Vec<ServiceSpec>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
}

impl Manifest {
    /// Look up a declared volume by name
    pub fn volume(&self, name: &str) -> Option<&VolumeSpec> {
        self.volumes.iter().find(|v| v.name == name)
    }

    /// Look up a service by name
    pub fn service(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Sum of the resources requested by every service
    pub fn total_resources(&self) -> ResourceSpec {
        self.services
            .iter()
            .fold(ResourceSpec::default(), |acc, s| acc + s.resources)
    }

    pub fn has_exposed_ports(&self) -> bool {
        self.services.iter().any(|s| s.exposed_ports().next().is_some())
    }

    /// Names of the services mounting the given volume
    pub fn volume_users(&self, volume: &str) -> Vec<&str> {
        self.services
            .iter()
            .filter(|s| s.volumes.iter().any(|m| m.name == volume))
            .map(|s| s.name.as_str())
            .collect()
    }
}

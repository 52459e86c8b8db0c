//! Service definition

use super::port::PortSpec;
use super::resources::ResourceSpec;
use super::volume::VolumeMountSpec;
use serde::{Deserialize, Serialize};

/// One deployable unit: a VM or a container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ServiceKind,
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    pub resources: ResourceSpec,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub volumes: Vec<VolumeMountSpec>,
}

/// Service kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Vm,
    Container,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Vm => "vm",
            Self::Container => "container",
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, Self::Container)
    }
}

impl std::fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ServiceSpec {
    /// Image with the tag appended when one is given
    pub fn image_ref(&self) -> String {
        match &self.tag {
            Some(tag) => format!("{}:{}", self.image, tag),
            None => self.image.clone(),
        }
    }

    /// Ports that should be reachable from outside the deployment
    pub fn exposed_ports(&self) -> impl Iterator<Item = &PortSpec> {
        self.ports.iter().filter(|p| p.expose)
    }
}

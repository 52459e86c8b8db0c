//! Port definition

use serde::{Deserialize, Serialize};

/// Port exposed by a service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    #[serde(rename = "containerPort")]
    pub container_port: u16,
    #[serde(default)]
    pub expose: bool,
    #[serde(default)]
    pub protocol: Protocol,
}

impl PortSpec {
    pub fn new(name: impl Into<String>, container_port: u16, expose: bool) -> Self {
        Self {
            name: name.into(),
            container_port,
            expose,
            protocol: Protocol::Tcp,
        }
    }
}

/// Transport protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    /// Lowercase name as used by EC2 and NSG rules
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }

    /// Uppercase name as used by Kubernetes
    pub fn as_upper_str(&self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }
}

//! Volume definitions

use super::resources::{GIB, TIB};

/// Largest volume `validate` accepts
pub const MAX_VOLUME_BYTES: i64 = 64 * TIB;
use serde::{Deserialize, Serialize};

/// Named persistent storage declared at manifest level
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: VolumeKind,
    /// Size in bytes
    pub size: i64,
}

impl VolumeSpec {
    pub fn persistent(name: impl Into<String>, size: i64) -> Self {
        Self {
            name: name.into(),
            kind: VolumeKind::Persistent,
            size,
        }
    }

    /// Size in whole GiB, rounded up, at least 1
    pub fn size_gib(&self) -> u32 {
        let gib = self.size.max(0).unsigned_abs().div_ceil(GIB.unsigned_abs());
        u32::try_from(gib).unwrap_or(u32::MAX).max(1)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    #[default]
    Persistent,
}

/// A service's reference to a declared volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeMountSpec {
    pub name: String,
    #[serde(rename = "mountPath")]
    pub mount_path: String,
}

impl VolumeMountSpec {
    pub fn new(name: impl Into<String>, mount_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mount_path: mount_path.into(),
        }
    }
}

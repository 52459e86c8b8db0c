//! Resource requests

use serde::{Deserialize, Serialize};
use std::ops::Add;

pub const KIB: i64 = 1024;
pub const MIB: i64 = 1024 * KIB;
pub const GIB: i64 = 1024 * MIB;
pub const TIB: i64 = 1024 * GIB;

/// Largest per-service request `validate` accepts
pub const MAX_CPU_MILLICORES: i64 = 1_024_000;
pub const MAX_MEMORY_BYTES: i64 = 64 * TIB;
pub const MAX_GPUS: i64 = 64;

/// Resources requested by one service
///
/// Always expressed in normalized units regardless of backend:
/// CPU in millicores, memory in bytes, GPU as a device count.
/// Signed so that validation can report non-positive values instead of
/// failing at deserialization.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    pub cpu: i64,
    pub memory: i64,
    #[serde(default)]
    pub gpu: i64,
}

impl ResourceSpec {
    /// CPU in whole vCPUs, rounded up
    pub fn vcpus(&self) -> u32 {
        let vcpus = self.cpu.max(0).unsigned_abs().div_ceil(1000);
        u32::try_from(vcpus).unwrap_or(u32::MAX)
    }

    /// Memory in MiB, rounded up
    pub fn memory_mib(&self) -> u64 {
        self.memory.max(0).unsigned_abs().div_ceil(MIB.unsigned_abs())
    }

    /// Memory in GiB as a fraction
    pub fn memory_gib(&self) -> f64 {
        self.memory.max(0) as f64 / GIB as f64
    }

    /// Kubernetes-style CPU quantity (e.g. `500m`)
    pub fn cpu_quantity(&self) -> String {
        format!("{}m", self.cpu)
    }

    /// Kubernetes-style memory quantity in MiB (e.g. `256Mi`)
    pub fn memory_quantity(&self) -> String {
        format!("{}Mi", self.memory_mib())
    }
}

impl Add for ResourceSpec {
    type Output = ResourceSpec;

    fn add(self, rhs: ResourceSpec) -> ResourceSpec {
        ResourceSpec {
            cpu: self.cpu.saturating_add(rhs.cpu),
            memory: self.memory.saturating_add(rhs.memory),
            gpu: self.gpu.saturating_add(rhs.gpu),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_conversions() {
        let spec = ResourceSpec {
            cpu: 1500,
            memory: GIB + 1,
            gpu: 0,
        };
        assert_eq!(spec.vcpus(), 2);
        assert_eq!(spec.memory_mib(), 1025);
        assert_eq!(spec.cpu_quantity(), "1500m");
        assert_eq!(spec.memory_quantity(), "1025Mi");
    }

    #[test]
    fn test_extreme_values_saturate() {
        let huge = ResourceSpec {
            cpu: i64::MAX,
            memory: i64::MAX,
            gpu: i64::MAX,
        };
        assert_eq!(huge.vcpus(), u32::MAX);
        assert_eq!(huge.memory_mib(), (i64::MAX / MIB + 1) as u64);

        let sum = huge + huge;
        assert_eq!(sum.cpu, i64::MAX);
        assert_eq!(sum.memory, i64::MAX);
    }

    #[test]
    fn test_exact_vcpu() {
        let spec = ResourceSpec {
            cpu: 1000,
            memory: GIB,
            gpu: 0,
        };
        assert_eq!(spec.vcpus(), 1);
        assert!((spec.memory_gib() - 1.0).abs() < f64::EPSILON);
    }
}

//! vSphere fault classification

use leaseflow_cloud::{BackendError, BackendErrorKind};

/// Classify a vSphere fault type name
pub fn classify(fault: &str) -> BackendErrorKind {
    match fault {
        "TaskInProgress" | "ConcurrentAccess" | "HostCommunication" | "HostNotConnected"
        | "HostNotReachable" | "RequestTimeout" | "ResourceInUse" => BackendErrorKind::Transient,
        "NotAuthenticated" | "NoPermission" | "InvalidLogin" => BackendErrorKind::Unauthorized,
        "InsufficientResourcesFault" | "InsufficientCpuResourcesFault"
        | "InsufficientMemoryResourcesFault" | "InsufficientStorageSpace" | "NoDiskSpace"
        | "LicenseRestricted" => BackendErrorKind::QuotaExceeded,
        "InvalidArgument" | "InvalidDeviceSpec" | "InvalidName" | "InvalidVmConfig"
        | "VmConfigFault" => BackendErrorKind::InvalidSpec,
        "ManagedObjectNotFound" | "NotFound" => BackendErrorKind::NotFound,
        "DuplicateName" | "InvalidPowerState" | "InvalidState" => BackendErrorKind::Conflict,
        _ => BackendErrorKind::Other,
    }
}

pub fn from_fault(fault: &str, message: impl std::fmt::Display) -> BackendError {
    BackendError::new(classify(fault), format!("{}: {}", fault, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify("TaskInProgress"), BackendErrorKind::Transient);
        assert_eq!(classify("NoPermission"), BackendErrorKind::Unauthorized);
        assert_eq!(classify("InsufficientResourcesFault"), BackendErrorKind::QuotaExceeded);
        assert_eq!(classify("ManagedObjectNotFound"), BackendErrorKind::NotFound);
        assert_eq!(classify("InvalidPowerState"), BackendErrorKind::Conflict);
        assert_eq!(classify("SystemError"), BackendErrorKind::Other);
    }
}

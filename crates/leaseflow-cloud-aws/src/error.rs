//! EC2 error classification

use leaseflow_cloud::{BackendError, BackendErrorKind};

/// Classify an EC2 API error code
///
/// See the EC2 API error code reference. Unknown codes are `Other`, which
/// is neither retried nor treated as gone.
pub fn classify(code: &str) -> BackendErrorKind {
    match code {
        "RequestLimitExceeded" | "Throttling" | "ThrottlingException" | "InternalError"
        | "InternalFailure" | "ServiceUnavailable" | "Unavailable"
        | "InsufficientInstanceCapacity" | "RequestExpired" | "IncorrectState"
        | "IncorrectInstanceState" | "DependencyViolation" => BackendErrorKind::Transient,

        "AuthFailure" | "UnauthorizedOperation" | "Blocked" | "OptInRequired" => {
            BackendErrorKind::Unauthorized
        }

        "InstanceLimitExceeded" | "VolumeLimitExceeded" | "AddressLimitExceeded"
        | "VpcLimitExceeded" | "SecurityGroupLimitExceeded" | "MaxIOPSLimitExceeded"
        | "VcpuLimitExceeded" => BackendErrorKind::QuotaExceeded,

        "InvalidParameterValue" | "InvalidParameterCombination" | "InvalidAMIID.Malformed"
        | "InvalidAMIID.NotFound" | "InvalidAMIID.Unavailable" | "InvalidBlockDeviceMapping"
        | "Unsupported" | "InvalidInstanceType" => BackendErrorKind::InvalidSpec,

        "InvalidPermission.Duplicate" | "InvalidGroup.Duplicate" | "Resource.AlreadyAssociated" => {
            BackendErrorKind::Conflict
        }

        code if code.ends_with(".NotFound") => {
            BackendErrorKind::NotFound
        }

        _ => BackendErrorKind::Other,
    }
}

/// Build a [`BackendError`] from an EC2 error code and message
pub fn from_code(code: &str, message: impl std::fmt::Display) -> BackendError {
    BackendError::new(classify(code), format!("{}: {}", code, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify("RequestLimitExceeded"), BackendErrorKind::Transient);
        assert_eq!(classify("AuthFailure"), BackendErrorKind::Unauthorized);
        assert_eq!(classify("VolumeLimitExceeded"), BackendErrorKind::QuotaExceeded);
        assert_eq!(classify("InvalidAMIID.Malformed"), BackendErrorKind::InvalidSpec);
        assert_eq!(classify("InvalidInstanceID.NotFound"), BackendErrorKind::NotFound);
        assert_eq!(classify("InvalidVolume.NotFound"), BackendErrorKind::NotFound);
        assert_eq!(classify("SomethingNew"), BackendErrorKind::Other);
    }

    #[test]
    fn test_invalid_ami_is_not_retried() {
        // A missing AMI is a bad image reference, not a vanished resource
        let err = from_code("InvalidAMIID.NotFound", "ami-123 does not exist");
        assert_eq!(err.kind, BackendErrorKind::InvalidSpec);
        assert!(!err.is_transient());
    }
}

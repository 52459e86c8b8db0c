//! ARM error classification

use leaseflow_cloud::{BackendError, BackendErrorKind};

/// Classify an ARM error by HTTP status and error code
pub fn classify(status: u16, code: &str) -> BackendErrorKind {
    match code {
        "TooManyRequests" | "RetryableError" | "InternalServerError" | "ServerTimeout"
        | "AnotherOperationInProgress" | "AllocationFailed" => return BackendErrorKind::Transient,
        "AuthorizationFailed" | "InvalidAuthenticationToken" | "AuthenticationFailed"
        | "LinkedAuthorizationFailed" => return BackendErrorKind::Unauthorized,
        "QuotaExceeded" | "OperationNotAllowed" | "SkuNotAvailable"
        | "PublicIPCountLimitReached" => return BackendErrorKind::QuotaExceeded,
        "InvalidParameter" | "PlatformImageNotFound" | "ImageNotFound"
        | "InvalidTemplate" | "InvalidResourceName" => return BackendErrorKind::InvalidSpec,
        "ResourceNotFound" | "ResourceGroupNotFound" | "NotFound" => {
            return BackendErrorKind::NotFound;
        }
        "Conflict" | "InUseSubnetCannotBeDeleted" | "NicInUse" => {
            return BackendErrorKind::Conflict;
        }
        _ => {}
    }

    match status {
        408 | 429 | 500 | 502 | 503 | 504 => BackendErrorKind::Transient,
        401 | 403 => BackendErrorKind::Unauthorized,
        404 => BackendErrorKind::NotFound,
        409 => BackendErrorKind::Conflict,
        400 => BackendErrorKind::InvalidSpec,
        _ => BackendErrorKind::Other,
    }
}

pub fn from_response(status: u16, code: &str, message: impl std::fmt::Display) -> BackendError {
    BackendError::new(classify(status, code), format!("{} ({}): {}", code, status, message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_wins_over_status() {
        assert_eq!(classify(409, "AnotherOperationInProgress"), BackendErrorKind::Transient);
        assert_eq!(classify(400, "PlatformImageNotFound"), BackendErrorKind::InvalidSpec);
        assert_eq!(classify(409, "OperationNotAllowed"), BackendErrorKind::QuotaExceeded);
    }

    #[test]
    fn test_status_fallback() {
        assert_eq!(classify(503, "Whatever"), BackendErrorKind::Transient);
        assert_eq!(classify(404, "Whatever"), BackendErrorKind::NotFound);
        assert_eq!(classify(403, "Whatever"), BackendErrorKind::Unauthorized);
        assert_eq!(classify(418, "Whatever"), BackendErrorKind::Other);
    }
}

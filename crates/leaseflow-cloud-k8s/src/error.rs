//! API server error classification

use leaseflow_cloud::{BackendError, BackendErrorKind};

/// Classify a `Status` response by HTTP code and `reason`
pub fn classify(code: u16, reason: &str, message: &str) -> BackendErrorKind {
    match reason {
        "AlreadyExists" => BackendErrorKind::Conflict,
        // resourceVersion races; the next attempt reads fresh state
        "Conflict" => BackendErrorKind::Transient,
        "NotFound" | "Gone" => BackendErrorKind::NotFound,
        "Invalid" | "BadRequest" | "RequestEntityTooLarge" => BackendErrorKind::InvalidSpec,
        "Unauthorized" => BackendErrorKind::Unauthorized,
        "Forbidden" if message.contains("exceeded quota") => BackendErrorKind::QuotaExceeded,
        "Forbidden" if message.contains("being terminated") => BackendErrorKind::Conflict,
        "Forbidden" => BackendErrorKind::Unauthorized,
        "TooManyRequests" | "ServerTimeout" | "Timeout" | "ServiceUnavailable"
        | "InternalError" => BackendErrorKind::Transient,
        _ => match code {
            429 | 500 | 502 | 503 | 504 => BackendErrorKind::Transient,
            401 | 403 => BackendErrorKind::Unauthorized,
            404 => BackendErrorKind::NotFound,
            409 => BackendErrorKind::Conflict,
            400 | 422 => BackendErrorKind::InvalidSpec,
            _ => BackendErrorKind::Other,
        },
    }
}

pub fn from_status(code: u16, reason: &str, message: impl std::fmt::Display) -> BackendError {
    let message = message.to_string();
    BackendError::new(
        classify(code, reason, &message),
        format!("{} ({}): {}", reason, code, message),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forbidden_variants() {
        assert_eq!(
            classify(403, "Forbidden", "pods \"web\" is forbidden: exceeded quota: compute"),
            BackendErrorKind::QuotaExceeded
        );
        assert_eq!(
            classify(403, "Forbidden", "namespace lf-d-1 is being terminated"),
            BackendErrorKind::Conflict
        );
        assert_eq!(
            classify(403, "Forbidden", "User cannot create resource"),
            BackendErrorKind::Unauthorized
        );
    }

    #[test]
    fn test_reason_and_code() {
        assert_eq!(classify(409, "AlreadyExists", ""), BackendErrorKind::Conflict);
        assert_eq!(classify(409, "Conflict", ""), BackendErrorKind::Transient);
        assert_eq!(classify(422, "Invalid", ""), BackendErrorKind::InvalidSpec);
        assert_eq!(classify(503, "", ""), BackendErrorKind::Transient);
        assert_eq!(classify(418, "", ""), BackendErrorKind::Other);
    }
}

//! Adapter error types

use crate::state::WorkloadState;
use leaseflow_core::ManifestError;
use thiserror::Error;

/// Classification of a backend client failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Timeouts, throttling, 5xx: safe to retry
    Transient,
    /// The backend has no record of the object
    NotFound,
    /// The object exists or is in a state that rejects the call
    Conflict,
    Unauthorized,
    QuotaExceeded,
    /// The request itself is invalid (bad image reference, bad size)
    InvalidSpec,
    Other,
}

impl std::fmt::Display for BackendErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Transient => "transient",
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::Unauthorized => "unauthorized",
            Self::QuotaExceeded => "quota exceeded",
            Self::InvalidSpec => "invalid spec",
            Self::Other => "backend error",
        };
        f.write_str(s)
    }
}

/// Error returned by a backend client implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub message: String,
}

impl BackendError {
    pub fn new(kind: BackendErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Transient, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::Conflict, message)
    }

    pub fn invalid_spec(message: impl Into<String>) -> Self {
        Self::new(BackendErrorKind::InvalidSpec, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == BackendErrorKind::Transient
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == BackendErrorKind::NotFound
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// What a caller should do about an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The request was invalid; retrying it unchanged will fail again
    InvalidRequest,
    /// The backend is temporarily unavailable; retry later
    RetryLater,
    /// The resource no longer exists
    Gone,
    /// The backend lacks the capability
    Unsupported,
    /// The operation failed for good
    Failed,
}

/// Adapter errors
#[derive(Error, Debug)]
pub enum CloudError {
    #[error("invalid manifest: {0}")]
    InvalidManifest(#[from] ManifestError),

    #[error("invalid spec for {backend}: {message}")]
    InvalidSpec { backend: String, message: String },

    #[error("workload not found: {0}")]
    NotFound(String),

    #[error("workload already exists: {0}")]
    AlreadyExists(String),

    #[error("workload {workload}: illegal transition {from} -> {to}")]
    InvalidTransition {
        workload: String,
        from: WorkloadState,
        to: WorkloadState,
    },

    #[error("operation '{operation}' is not supported by {backend}")]
    Unsupported { backend: String, operation: String },

    #[error("{operation} failed: {source}")]
    Backend {
        operation: String,
        #[source]
        source: BackendError,
    },

    #[error("{operation} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: BackendError,
    },

    #[error("provisioning step '{step}' failed: {source}")]
    Provisioning {
        step: String,
        #[source]
        source: Box<CloudError>,
    },

    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),
}

impl CloudError {
    pub fn backend(operation: impl Into<String>, source: BackendError) -> Self {
        Self::Backend {
            operation: operation.into(),
            source,
        }
    }

    pub fn unsupported(backend: impl ToString, operation: impl Into<String>) -> Self {
        Self::Unsupported {
            backend: backend.to_string(),
            operation: operation.into(),
        }
    }

    pub fn invalid_spec(backend: impl ToString, message: impl Into<String>) -> Self {
        Self::InvalidSpec {
            backend: backend.to_string(),
            message: message.into(),
        }
    }

    /// Wrap an error as the failure of a named provisioning step
    pub fn at_step(self, step: impl Into<String>) -> Self {
        match self {
            // Already attributed to the innermost step
            e @ CloudError::Provisioning { .. } => e,
            e => CloudError::Provisioning {
                step: step.into(),
                source: Box::new(e),
            },
        }
    }

    /// Innermost error, looking through provisioning wrappers
    pub fn root(&self) -> &CloudError {
        match self {
            CloudError::Provisioning { source, .. } => source.root(),
            e => e,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self.root() {
            CloudError::InvalidManifest(_)
            | CloudError::InvalidSpec { .. }
            | CloudError::AlreadyExists(_)
            | CloudError::InvalidTransition { .. } => ErrorClass::InvalidRequest,
            CloudError::NotFound(_) => ErrorClass::Gone,
            CloudError::Unsupported { .. } => ErrorClass::Unsupported,
            CloudError::RetriesExhausted { .. } | CloudError::Timeout(_) => ErrorClass::RetryLater,
            CloudError::Backend { source, .. } => match source.kind {
                BackendErrorKind::Transient => ErrorClass::RetryLater,
                BackendErrorKind::NotFound => ErrorClass::Gone,
                BackendErrorKind::InvalidSpec => ErrorClass::InvalidRequest,
                _ => ErrorClass::Failed,
            },
            CloudError::Cancelled(_) | CloudError::Provisioning { .. } => ErrorClass::Failed,
        }
    }

    /// Whether the error should drive the workload into `Failed`
    ///
    /// Authentication, quota and invalid-spec failures are unrecoverable.
    /// Transient exhaustion, timeouts, cancellation, conflicts and not-found
    /// leave the recorded state to be reconciled by the next status query.
    pub fn is_unrecoverable(&self) -> bool {
        match self.root() {
            CloudError::InvalidSpec { .. } => true,
            CloudError::Backend { source, .. } => matches!(
                source.kind,
                BackendErrorKind::Unauthorized
                    | BackendErrorKind::QuotaExceeded
                    | BackendErrorKind::InvalidSpec
                    | BackendErrorKind::Other
            ),
            _ => false,
        }
    }

    /// Whether the backend reported the object as gone
    pub fn is_backend_not_found(&self) -> bool {
        matches!(self.root(), CloudError::Backend { source, .. } if source.is_not_found())
    }
}

pub type Result<T> = std::result::Result<T, CloudError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(
            CloudError::NotFound("aws-d1".into()).class(),
            ErrorClass::Gone
        );
        assert_eq!(
            CloudError::Timeout("run_instances".into()).class(),
            ErrorClass::RetryLater
        );
        assert_eq!(
            CloudError::unsupported("azure", "pause").class(),
            ErrorClass::Unsupported
        );
        assert_eq!(
            CloudError::backend("run", BackendError::invalid_spec("bad ami")).class(),
            ErrorClass::InvalidRequest
        );
    }

    #[test]
    fn test_provisioning_wraps_once() {
        let err = CloudError::backend(
            "create_volume",
            BackendError::new(BackendErrorKind::QuotaExceeded, "VolumeLimitExceeded"),
        )
        .at_step("storage")
        .at_step("deploy");

        match &err {
            CloudError::Provisioning { step, .. } => assert_eq!(step, "storage"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(err.is_unrecoverable());
        assert_eq!(err.class(), ErrorClass::Failed);
    }

    #[test]
    fn test_transient_is_recoverable() {
        let err = CloudError::RetriesExhausted {
            operation: "describe".into(),
            attempts: 3,
            source: BackendError::transient("throttled"),
        };
        assert!(!err.is_unrecoverable());
        assert_eq!(err.class(), ErrorClass::RetryLater);
    }
}

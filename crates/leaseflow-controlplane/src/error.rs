//! Control plane errors

use leaseflow_cloud::{BackendKind, CloudError, ErrorClass, WorkloadId};
use leaseflow_core::ManifestError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures at the ledger boundary
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),

    #[error("unknown ledger resource: {0}")]
    UnknownResource(String),
}

/// Dispatcher errors
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("invalid manifest: {0}")]
    InvalidManifest(#[from] ManifestError),

    #[error("no adapter registered for backend {0}")]
    NoAdapter(BackendKind),

    #[error("unknown lease: {0}")]
    UnknownLease(String),

    #[error("lease already registered: {0}")]
    LeaseExists(String),

    #[error("workload {workload_id} already belongs to lease {lease_id}")]
    WorkloadExists {
        workload_id: WorkloadId,
        lease_id: String,
    },

    #[error(transparent)]
    Cloud(#[from] CloudError),

    #[error("ledger update failed: {0}")]
    Ledger(#[from] LedgerError),
}

impl DispatchError {
    pub fn class(&self) -> FailureClass {
        match self {
            DispatchError::InvalidManifest(_)
            | DispatchError::NoAdapter(_)
            | DispatchError::LeaseExists(_)
            | DispatchError::WorkloadExists { .. } => FailureClass::InvalidRequest,
            DispatchError::UnknownLease(_) => FailureClass::Gone,
            DispatchError::Cloud(e) => e.class().into(),
            DispatchError::Ledger(_) => FailureClass::RetryLater,
        }
    }
}

/// Failure category carried back to the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureClass {
    InvalidRequest,
    RetryLater,
    Gone,
    Unsupported,
    Failed,
}

impl From<ErrorClass> for FailureClass {
    fn from(class: ErrorClass) -> Self {
        match class {
            ErrorClass::InvalidRequest => Self::InvalidRequest,
            ErrorClass::RetryLater => Self::RetryLater,
            ErrorClass::Gone => Self::Gone,
            ErrorClass::Unsupported => Self::Unsupported,
            ErrorClass::Failed => Self::Failed,
        }
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;
    use leaseflow_cloud::BackendError;

    #[test]
    fn test_class_follows_cloud_error() {
        let transient = DispatchError::from(CloudError::backend(
            "RunInstances",
            BackendError::transient("RequestLimitExceeded"),
        ));
        assert_eq!(transient.class(), FailureClass::RetryLater);

        let gone = DispatchError::from(CloudError::NotFound("aws-d1".into()));
        assert_eq!(gone.class(), FailureClass::Gone);

        let unsupported = DispatchError::from(CloudError::unsupported(BackendKind::Azure, "pause"));
        assert_eq!(unsupported.class(), FailureClass::Unsupported);
    }

    #[test]
    fn test_lease_errors() {
        assert_eq!(
            DispatchError::UnknownLease("l-1".into()).class(),
            FailureClass::Gone
        );
        assert_eq!(
            DispatchError::NoAdapter(BackendKind::Vmware).class(),
            FailureClass::InvalidRequest
        );
        let taken = DispatchError::WorkloadExists {
            workload_id: WorkloadId::from("aws-d-1"),
            lease_id: "l-1".into(),
        };
        assert_eq!(taken.class(), FailureClass::InvalidRequest);
        assert!(taken.to_string().contains("l-1"));
    }

    #[test]
    fn test_failure_class_wire_names() {
        let json = serde_json::to_string(&FailureClass::RetryLater).unwrap();
        assert_eq!(json, "\"retryLater\"");
    }
}

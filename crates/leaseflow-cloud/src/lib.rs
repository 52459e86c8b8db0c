//! leaseflow cloud
//!
//! Backend-independent half of the adapter layer: the canonical state
//! machine, the adapter trait, and the bookkeeping every backend shares
//! (workload table, per-workload locking, retries, deadlines, and the
//! status/usage reporting channel).

pub mod adapter;
pub mod context;
pub mod error;
pub mod lifecycle;
pub mod lock;
pub mod report;
pub mod retry;
pub mod state;
pub mod table;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
pub mod usage;
pub mod workload;

pub use adapter::WorkloadAdapter;
pub use context::OperationContext;
pub use error::{
    BackendError, BackendErrorKind, BackendResult, CloudError, ErrorClass, Result,
};
pub use lifecycle::{AdapterCore, DEFAULT_TEARDOWN_TIMEOUT, WorkloadGuard};
pub use lock::KeyedLock;
pub use report::{Report, ReportReceiver, Reporter, ReporterStats, report_channel};
pub use retry::{PollConfig, RetryConfig, poll_until, retry};
pub use state::{Observed, StatusUpdate, WorkloadState};
pub use table::{OBSERVED_DETAIL, Observation, WorkloadRecord, WorkloadTable};
pub use usage::{UsageMeter, UsageRecord};
pub use workload::{
    BackendKind, BackendRef, DEPLOYMENT_TAG, DeploymentOptions, LEASE_TAG, RegistryCredentials,
    Workload, WorkloadId,
};

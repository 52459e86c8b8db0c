//! Backend adapter contract

use crate::context::OperationContext;
use crate::error::Result;
use crate::state::WorkloadState;
use crate::usage::UsageRecord;
use crate::workload::{BackendKind, DeploymentOptions, Workload, WorkloadId};
use async_trait::async_trait;
use leaseflow_core::Manifest;

/// One provisioning target behind the uniform lifecycle contract
///
/// The adapter that deployed a workload is the sole owner of its
/// backend-side lifecycle. Operations on the same workload are serialized
/// by the adapter; operations on different workloads run concurrently.
#[async_trait]
pub trait WorkloadAdapter: Send + Sync {
    fn backend(&self) -> BackendKind;

    /// Provision every resource the manifest needs as one unit
    ///
    /// On failure the resources created so far are torn down, the workload
    /// is recorded as `Failed`, and the error is returned. A deployment id
    /// is provisioned at most once.
    async fn deploy(
        &self,
        ctx: &OperationContext,
        manifest: &Manifest,
        deployment_id: &str,
        lease_id: &str,
        options: &DeploymentOptions,
    ) -> Result<Workload>;

    /// No-op on a running workload
    async fn start(&self, ctx: &OperationContext, id: &WorkloadId) -> Result<()>;

    /// No-op on a stopped workload
    async fn stop(&self, ctx: &OperationContext, id: &WorkloadId) -> Result<()>;

    async fn pause(&self, ctx: &OperationContext, id: &WorkloadId) -> Result<()>;

    async fn resume(&self, ctx: &OperationContext, id: &WorkloadId) -> Result<()>;

    /// Release every backend resource; safe to call twice
    async fn terminate(&self, ctx: &OperationContext, id: &WorkloadId) -> Result<()>;

    /// Query the backend and translate its state
    async fn get_status(&self, ctx: &OperationContext, id: &WorkloadId) -> Result<WorkloadState>;

    /// Close the usage interval since the previous sample
    async fn sample_usage(&self, ctx: &OperationContext, id: &WorkloadId) -> Result<UsageRecord>;

    /// Last recorded handle, without a backend call
    fn workload(&self, id: &WorkloadId) -> Result<Workload>;

    /// Every live workload this adapter owns
    fn workloads(&self) -> Vec<Workload>;
}

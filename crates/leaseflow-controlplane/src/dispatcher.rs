//! Lifecycle dispatcher
//!
//! Routes ledger lifecycle requests to the adapter that deployed the lease
//! and mirrors each successful outcome into the ledger. A failed call
//! leaves the ledger untouched.

use crate::error::{DispatchError, FailureClass, Result};
use crate::ledger::{Ledger, LedgerState};
use crate::registry::{LeaseEntry, LeaseRegistry};
use leaseflow_cloud::{
    BackendKind, DeploymentOptions, ErrorClass, KeyedLock, OperationContext, UsageRecord,
    Workload, WorkloadAdapter, WorkloadId, WorkloadState,
};
use leaseflow_core::Manifest;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, error, info, warn};

/// Operations the ledger may request on a lease
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleOperation {
    Start,
    Stop,
    Pause,
    Resume,
    Terminate,
}

impl LifecycleOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Terminate => "terminate",
        }
    }
}

impl std::fmt::Display for LifecycleOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleRequest {
    #[serde(rename = "resourceUUID")]
    pub resource_uuid: String,
    pub operation: LifecycleOperation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleFailure {
    pub class: FailureClass,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleResponse {
    /// Canonical state after the operation; absent when it failed
    pub new_state: Option<WorkloadState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<LifecycleFailure>,
}

impl From<Result<WorkloadState>> for LifecycleResponse {
    fn from(result: Result<WorkloadState>) -> Self {
        match result {
            Ok(state) => Self {
                new_state: Some(state),
                error: None,
            },
            Err(e) => Self {
                new_state: None,
                error: Some(LifecycleFailure {
                    class: e.class(),
                    message: e.to_string(),
                }),
            },
        }
    }
}

/// Everything needed to deploy one lease
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub lease_id: String,
    pub deployment_id: String,
    pub backend: BackendKind,
    pub manifest: Manifest,
    pub options: DeploymentOptions,
}

/// Releases a lease reservation unless the deploy committed it
///
/// Covers a deploy future dropped mid-flight as well as a failed one.
struct Reservation<'a> {
    registry: &'a LeaseRegistry,
    lease_id: &'a str,
    committed: bool,
}

impl Reservation<'_> {
    fn commit(mut self) {
        self.registry.commit(self.lease_id);
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.registry.release(self.lease_id);
        }
    }
}

pub struct Dispatcher {
    adapters: RwLock<HashMap<BackendKind, Arc<dyn WorkloadAdapter>>>,
    registry: Arc<LeaseRegistry>,
    ledger: Arc<dyn Ledger>,
    /// Keeps the ledger write of one operation ahead of the next one
    lease_locks: KeyedLock<String>,
}

impl Dispatcher {
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        Self {
            adapters: RwLock::new(HashMap::new()),
            registry: Arc::new(LeaseRegistry::new()),
            ledger,
            lease_locks: KeyedLock::new(),
        }
    }

    /// Replaces any adapter already registered for the same backend
    pub fn register_adapter(&self, adapter: Arc<dyn WorkloadAdapter>) {
        let backend = adapter.backend();
        let previous = self
            .adapters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(backend, adapter);
        if previous.is_some() {
            warn!(backend = %backend, "adapter replaced");
        } else {
            info!(backend = %backend, "adapter registered");
        }
    }

    pub fn backends(&self) -> Vec<BackendKind> {
        self.adapters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    pub fn registry(&self) -> Arc<LeaseRegistry> {
        self.registry.clone()
    }

    pub fn ledger(&self) -> Arc<dyn Ledger> {
        self.ledger.clone()
    }

    fn adapter(&self, backend: BackendKind) -> Result<Arc<dyn WorkloadAdapter>> {
        self.adapters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&backend)
            .cloned()
            .ok_or(DispatchError::NoAdapter(backend))
    }

    fn entry(&self, lease_id: &str) -> Result<LeaseEntry> {
        self.registry
            .get(lease_id)
            .ok_or_else(|| DispatchError::UnknownLease(lease_id.to_string()))
    }

    /// Deploy a manifest for a lease
    ///
    /// The lease is registered only once the adapter reports success.
    /// Lifecycle requests arriving meanwhile wait for the outcome.
    pub async fn deploy(&self, ctx: &OperationContext, request: &DeployRequest) -> Result<Workload> {
        leaseflow_core::validate(&request.manifest)?;
        let adapter = self.adapter(request.backend)?;

        let workload_id = WorkloadId::for_deployment(request.backend, &request.deployment_id);
        self.registry
            .reserve(&request.lease_id, request.backend, workload_id)?;
        let reservation = Reservation {
            registry: &self.registry,
            lease_id: &request.lease_id,
            committed: false,
        };
        // Lifecycle requests for this lease wait until the deploy settles
        let guard = self.lease_locks.lock(&request.lease_id).await;

        info!(
            lease_id = %request.lease_id,
            deployment_id = %request.deployment_id,
            backend = %request.backend,
            "deploying lease"
        );
        let workload = match adapter
            .deploy(
                ctx,
                &request.manifest,
                &request.deployment_id,
                &request.lease_id,
                &request.options,
            )
            .await
        {
            Ok(workload) => workload,
            Err(e) => {
                error!(lease_id = %request.lease_id, error = %e, "deploy failed");
                drop(reservation);
                drop(guard);
                self.lease_locks.prune();
                return Err(e.into());
            }
        };
        reservation.commit();

        if let Some(state) = LedgerState::from_workload(workload.state) {
            self.ledger
                .set_resource_state(&request.lease_id, state)
                .await?;
        }
        drop(guard);
        info!(lease_id = %request.lease_id, workload_id = %workload.id, "lease deployed");
        Ok(workload)
    }

    /// Serve one ledger lifecycle request
    pub async fn dispatch(
        &self,
        ctx: &OperationContext,
        request: &LifecycleRequest,
    ) -> LifecycleResponse {
        self.apply(ctx, &request.resource_uuid, request.operation)
            .await
            .into()
    }

    /// Run a lifecycle operation and record the resulting state
    pub async fn apply(
        &self,
        ctx: &OperationContext,
        lease_id: &str,
        operation: LifecycleOperation,
    ) -> Result<WorkloadState> {
        // An in-flight deploy holds the lease lock; wait for it to settle
        if self.registry.resolve(lease_id).is_none() {
            return Err(DispatchError::UnknownLease(lease_id.to_string()));
        }
        let guard = self.lease_locks.lock(&lease_id.to_string()).await;
        let entry = match self.entry(lease_id) {
            Ok(entry) => entry,
            Err(e) => {
                drop(guard);
                self.lease_locks.prune();
                return Err(e);
            }
        };
        let adapter = self.adapter(entry.backend)?;
        let id = &entry.workload_id;

        debug!(lease_id, workload_id = %id, operation = %operation, "dispatching");
        let result = match operation {
            LifecycleOperation::Start => adapter.start(ctx, id).await,
            LifecycleOperation::Stop => adapter.stop(ctx, id).await,
            LifecycleOperation::Pause => adapter.pause(ctx, id).await,
            LifecycleOperation::Resume => adapter.resume(ctx, id).await,
            LifecycleOperation::Terminate => adapter.terminate(ctx, id).await,
        };
        if let Err(e) = result {
            warn!(lease_id, workload_id = %id, operation = %operation, error = %e, "operation failed");
            return Err(e.into());
        }

        let state = match operation {
            LifecycleOperation::Terminate => {
                self.registry.retire(lease_id);
                WorkloadState::Terminated
            }
            _ => adapter.workload(id)?.state,
        };
        if let Some(ledger_state) = LedgerState::from_workload(state) {
            self.ledger.set_resource_state(lease_id, ledger_state).await?;
        }
        drop(guard);
        if operation == LifecycleOperation::Terminate {
            self.lease_locks.prune();
        }

        info!(lease_id, workload_id = %id, operation = %operation, state = %state, "lifecycle applied");
        Ok(state)
    }

    /// Query the backend for a lease's current state
    ///
    /// A lease whose workload the backend no longer knows is retired.
    pub async fn status(&self, ctx: &OperationContext, lease_id: &str) -> Result<WorkloadState> {
        let entry = self.entry(lease_id)?;
        let adapter = self.adapter(entry.backend)?;
        match adapter.get_status(ctx, &entry.workload_id).await {
            Ok(state) => Ok(state),
            Err(e) => {
                if e.class() == ErrorClass::Gone {
                    info!(lease_id, workload_id = %entry.workload_id, "workload gone, lease retired");
                    self.registry.retire(lease_id);
                }
                Err(e.into())
            }
        }
    }

    pub async fn sample_usage(&self, ctx: &OperationContext, lease_id: &str) -> Result<UsageRecord> {
        let entry = self.entry(lease_id)?;
        let adapter = self.adapter(entry.backend)?;
        Ok(adapter.sample_usage(ctx, &entry.workload_id).await?)
    }

    /// Last recorded workload handle of a lease, without a backend call
    pub fn workload(&self, lease_id: &str) -> Result<Workload> {
        let entry = self.entry(lease_id)?;
        let adapter = self.adapter(entry.backend)?;
        Ok(adapter.workload(&entry.workload_id)?)
    }

    /// Live leases
    pub fn leases(&self) -> Vec<LeaseEntry> {
        self.registry.live()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request: LifecycleRequest =
            serde_json::from_str(r#"{"resourceUUID":"l-1","operation":"Stop"}"#).unwrap();
        assert_eq!(request.resource_uuid, "l-1");
        assert_eq!(request.operation, LifecycleOperation::Stop);
    }

    #[test]
    fn test_response_from_result() {
        let ok = LifecycleResponse::from(Ok(WorkloadState::Stopped));
        let json = serde_json::to_string(&ok).unwrap();
        assert_eq!(json, r#"{"newState":"Stopped"}"#);

        let failed = LifecycleResponse::from(Err(DispatchError::UnknownLease("l-9".into())));
        assert_eq!(failed.new_state, None);
        let error = failed.error.unwrap();
        assert_eq!(error.class, FailureClass::Gone);
        assert!(error.message.contains("l-9"));
    }
}

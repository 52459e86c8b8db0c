//! Shared lifecycle bookkeeping for adapters
//!
//! [`AdapterCore`] owns the pieces every backend needs in the same shape:
//! the workload table, per-workload locks, the reporter and the retry
//! policy. Adapters keep only their clients and their provisioning steps.

use crate::context::OperationContext;
use crate::error::{BackendResult, CloudError, Result};
use crate::lock::KeyedLock;
use crate::report::Reporter;
use crate::retry::{RetryConfig, retry};
use crate::state::{Observed, StatusUpdate, WorkloadState};
use crate::table::{Observation, WorkloadRecord, WorkloadTable};
use crate::usage::{UsageMeter, UsageRecord};
use crate::workload::{BackendKind, BackendRef, DeploymentOptions, Workload, WorkloadId};
use chrono::Utc;
use leaseflow_core::Manifest;
use std::future::Future;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

/// Default bound on teardown after a failed or cancelled operation
pub const DEFAULT_TEARDOWN_TIMEOUT: Duration = Duration::from_secs(600);

/// Exclusive access to one workload for the duration of an operation
pub type WorkloadGuard = OwnedMutexGuard<()>;

#[derive(Debug)]
pub struct AdapterCore<R> {
    backend: BackendKind,
    table: WorkloadTable<R>,
    locks: KeyedLock<WorkloadId>,
    reporter: Reporter,
    retry: RetryConfig,
    teardown_timeout: Duration,
}

impl<R: Clone + Default> AdapterCore<R> {
    pub fn new(backend: BackendKind, reporter: Reporter, retry: RetryConfig) -> Self {
        Self {
            backend,
            table: WorkloadTable::new(),
            locks: KeyedLock::new(),
            reporter,
            retry,
            teardown_timeout: DEFAULT_TEARDOWN_TIMEOUT,
        }
    }

    pub fn with_teardown_timeout(mut self, timeout: Duration) -> Self {
        self.teardown_timeout = timeout;
        self
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    pub fn table(&self) -> &WorkloadTable<R> {
        &self.table
    }

    /// Context for rollback and release, independent of the caller's
    pub fn teardown_context(&self) -> OperationContext {
        OperationContext::detached(self.teardown_timeout)
    }

    pub async fn lock(&self, id: &WorkloadId) -> WorkloadGuard {
        self.locks.lock(id).await
    }

    /// Run one backend call under the retry policy
    pub async fn call<T, F, Fut>(&self, ctx: &OperationContext, operation: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = BackendResult<T>>,
    {
        tracing::debug!(backend = %self.backend, operation, "backend call");
        retry(&self.retry, ctx, operation, f).await
    }

    /// Claim a workload id and move it to `Deploying`
    ///
    /// Fails with `AlreadyExists` when the deployment was seen before,
    /// whatever became of it.
    pub async fn begin_deploy(
        &self,
        manifest: &Manifest,
        deployment_id: &str,
        lease_id: &str,
        options: &DeploymentOptions,
    ) -> Result<(WorkloadId, WorkloadGuard)> {
        let id = WorkloadId::for_deployment(self.backend, deployment_id);
        let guard = self.lock(&id).await;

        let now = Utc::now();
        let replicas = if manifest.services.iter().all(|s| s.kind.is_container()) {
            options.replicas
        } else {
            1
        };
        let record = WorkloadRecord {
            workload: Workload {
                id: id.clone(),
                backend: self.backend,
                deployment_id: deployment_id.to_string(),
                lease_id: lease_id.to_string(),
                state: WorkloadState::Pending,
                backend_ref: BackendRef::new(),
                public_ip: None,
                created_at: now,
                updated_at: now,
            },
            resources: R::default(),
            meter: UsageMeter::new(manifest.total_resources(), replicas),
        };
        if let Err(e) = self.table.insert(record) {
            drop(guard);
            self.locks.prune();
            return Err(e);
        }

        tracing::info!(
            backend = %self.backend,
            workload_id = %id,
            lease_id,
            manifest = %manifest.name,
            services = manifest.services.len(),
            "deploying workload"
        );
        self.transition(&id, WorkloadState::Deploying, "deploy accepted")
            .await?;
        Ok((id, guard))
    }

    /// Mark a deployment as running and return the final workload
    pub async fn complete_deploy(&self, id: &WorkloadId) -> Result<Workload> {
        let workload = self
            .transition(id, WorkloadState::Running, "deployed")
            .await?;
        tracing::info!(
            backend = %self.backend,
            workload_id = %id,
            public_ip = workload.public_ip.as_deref().unwrap_or("-"),
            "workload running"
        );
        Ok(workload)
    }

    /// Record a failed deployment; returns the error for the caller
    ///
    /// `remaining` is whatever rollback could not release; a later
    /// `Terminate` retries it.
    pub async fn fail_deploy(&self, id: &WorkloadId, remaining: R, error: CloudError) -> CloudError {
        tracing::error!(backend = %self.backend, workload_id = %id, error = %error, "deploy failed");
        if let Err(e) = self.table.with_record(id, |r| r.resources = remaining) {
            tracing::warn!(workload_id = %id, error = %e, "could not record leftover resources");
        }
        if let Err(e) = self
            .transition(id, WorkloadState::Failed, &error.to_string())
            .await
        {
            tracing::warn!(workload_id = %id, error = %e, "could not record failure");
        }
        error
    }

    /// Full deploy sequence around an adapter's provisioning steps
    ///
    /// `provision` records what it creates through [`AdapterCore::update`]
    /// as it goes. If it fails, `rollback` receives that record under a
    /// fresh teardown context and returns what it could not release.
    pub async fn deploy_with<P, PFut, B, BFut>(
        &self,
        manifest: &Manifest,
        deployment_id: &str,
        lease_id: &str,
        options: &DeploymentOptions,
        provision: P,
        rollback: B,
    ) -> Result<Workload>
    where
        P: FnOnce(WorkloadId) -> PFut,
        PFut: Future<Output = Result<()>>,
        B: FnOnce(OperationContext, R) -> BFut,
        BFut: Future<Output = (R, Result<()>)>,
    {
        let (id, _guard) = self
            .begin_deploy(manifest, deployment_id, lease_id, options)
            .await?;

        match provision(id.clone()).await {
            Ok(()) => self.complete_deploy(&id).await,
            Err(error) => {
                let created = self.resources(&id)?;
                tracing::warn!(workload_id = %id, error = %error, "rolling back partial deployment");
                let (remaining, outcome) = rollback(self.teardown_context(), created).await;
                if let Err(e) = outcome {
                    tracing::warn!(workload_id = %id, error = %e, "rollback incomplete");
                }
                Err(self.fail_deploy(&id, remaining, error).await)
            }
        }
    }

    /// Move a workload to `target` by running `action`
    ///
    /// Already being in `target` is a successful no-op. The action gets the
    /// current handle and resource record.
    pub async fn drive<F, Fut>(
        &self,
        id: &WorkloadId,
        target: WorkloadState,
        detail: &str,
        action: F,
    ) -> Result<()>
    where
        F: FnOnce(Workload, R) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let _guard = self.lock(id).await;
        let workload = self.table.workload(id)?;
        if workload.state == target {
            tracing::debug!(workload_id = %id, state = %target, "already in requested state");
            return Ok(());
        }
        if !workload.state.can_transition_to(target) {
            return Err(CloudError::InvalidTransition {
                workload: id.to_string(),
                from: workload.state,
                to: target,
            });
        }

        let resources = self.resources(id)?;
        match action(workload, resources).await {
            Ok(()) => {
                self.transition(id, target, detail).await?;
                Ok(())
            }
            Err(e) => Err(self.fail_if_unrecoverable(id, e).await),
        }
    }

    /// Release everything and retire the id; a second call is a no-op
    pub async fn terminate_with<F, Fut>(&self, id: &WorkloadId, release: F) -> Result<()>
    where
        F: FnOnce(R) -> Fut,
        Fut: Future<Output = (R, Result<()>)>,
    {
        let guard = self.lock(id).await;
        let Some((_, resources)) = self.for_terminate(id)? else {
            tracing::debug!(workload_id = %id, "already terminated");
            return Ok(());
        };

        let (remaining, outcome) = release(resources).await;
        match outcome {
            Ok(()) => {
                self.finish_terminate(id).await?;
                drop(guard);
                self.locks.prune();
                Ok(())
            }
            Err(e) => {
                self.update(id, |r, _| *r = remaining)?;
                Err(self.fail_if_unrecoverable(id, e).await)
            }
        }
    }

    /// Query the backend through `query` and reconcile the answer
    ///
    /// A not-found answer from the backend counts as [`Observed::Gone`].
    /// A `Failed` workload is reported as is without asking the backend.
    pub async fn status_with<F, Fut>(&self, id: &WorkloadId, query: F) -> Result<WorkloadState>
    where
        F: FnOnce(Workload, R) -> Fut,
        Fut: Future<Output = Result<Observed>>,
    {
        let guard = self.lock(id).await;
        let workload = self.table.workload(id)?;
        if workload.state == WorkloadState::Failed {
            return Ok(WorkloadState::Failed);
        }
        let resources = self.resources(id)?;

        let observed = match query(workload, resources).await {
            Ok(observed) => observed,
            Err(e) if e.is_backend_not_found() => Observed::Gone,
            Err(e) => return Err(e),
        };
        let outcome = self.observe(id, observed).await;
        if outcome.is_err() {
            drop(guard);
            self.locks.prune();
        }
        Ok(outcome?.state)
    }

    /// Apply a transition and emit its status update
    ///
    /// The update is sent after the table lock is released but while the
    /// caller still holds the workload guard, so updates for one workload
    /// leave in transition order.
    pub async fn transition(
        &self,
        id: &WorkloadId,
        to: WorkloadState,
        detail: &str,
    ) -> Result<Workload> {
        let update = self.table.transition(id, to, detail)?;
        self.emit(update).await;
        self.table.workload(id)
    }

    /// Turn an operation error into `Failed` when it is unrecoverable
    pub async fn fail_if_unrecoverable(&self, id: &WorkloadId, error: CloudError) -> CloudError {
        if error.is_unrecoverable() {
            match self
                .table
                .transition(id, WorkloadState::Failed, &error.to_string())
            {
                Ok(update) => self.emit(update).await,
                Err(e) => tracing::debug!(workload_id = %id, error = %e, "not marking failed"),
            }
        }
        error
    }

    /// Reconcile a backend observation, emitting any change
    pub async fn observe(&self, id: &WorkloadId, observed: Observed) -> Result<Workload> {
        match self.table.observe(id, observed)? {
            Observation::Current { workload, update } => {
                if let Some(u) = &update {
                    tracing::info!(
                        workload_id = %id,
                        from = %u.previous_state,
                        to = %u.new_state,
                        "out-of-band state change"
                    );
                }
                self.emit(update).await;
                Ok(workload)
            }
            Observation::Vanished { update } => {
                tracing::warn!(workload_id = %id, "workload no longer exists on backend");
                self.emit(update).await;
                Err(CloudError::NotFound(id.to_string()))
            }
        }
    }

    pub fn workload(&self, id: &WorkloadId) -> Result<Workload> {
        self.table.workload(id)
    }

    pub fn workloads(&self) -> Vec<Workload> {
        self.table.workloads()
    }

    pub fn resources(&self, id: &WorkloadId) -> Result<R> {
        self.table.with_record(id, |r| r.resources.clone())
    }

    /// Mutate the resource record and workload handle in place
    pub fn update(&self, id: &WorkloadId, f: impl FnOnce(&mut R, &mut Workload)) -> Result<()> {
        self.table
            .with_record(id, |r| f(&mut r.resources, &mut r.workload))
    }

    /// Look up a workload for `Terminate`
    ///
    /// `Ok(None)` means it was terminated already.
    pub fn for_terminate(&self, id: &WorkloadId) -> Result<Option<(Workload, R)>> {
        if self.table.is_tombstone(id) {
            return Ok(None);
        }
        self.table
            .with_record(id, |r| (r.workload.clone(), r.resources.clone()))
            .map(Some)
    }

    /// Retire a workload whose resources have been released
    ///
    /// A `Failed` workload is retired without a transition.
    pub async fn finish_terminate(&self, id: &WorkloadId) -> Result<Workload> {
        let current = self.table.workload(id)?;
        let mut workload = if current.state == WorkloadState::Failed {
            current
        } else {
            self.transition(id, WorkloadState::Terminated, "terminated")
                .await?
        };
        self.table.tombstone(id);

        workload.updated_at = Utc::now();
        tracing::info!(backend = %self.backend, workload_id = %id, "workload terminated");
        Ok(workload)
    }

    /// Close the current usage interval for a workload
    pub fn sample_usage(&self, id: &WorkloadId, network_total: Option<u64>) -> Result<UsageRecord> {
        self.table.with_record(id, |r| {
            r.meter.sample(r.workload.id.as_str(), Utc::now(), network_total)
        })
    }

    async fn emit(&self, update: Option<StatusUpdate>) {
        if let Some(update) = update {
            self.reporter.status(update).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BackendError, BackendErrorKind};
    use crate::report::{Report, ReportReceiver, report_channel};
    use leaseflow_core::parse_str;

    const MANIFEST: &str = r#"
version: v1
name: web
services:
  - name: api
    type: container
    image: nginx
    resources: { cpu: 500, memory: 268435456 }
"#;

    type Core = AdapterCore<Vec<String>>;

    fn core() -> (Core, ReportReceiver) {
        let (reporter, rx) = report_channel(32, 4, Duration::from_secs(1));
        (
            AdapterCore::new(BackendKind::Kubernetes, reporter, RetryConfig::none()),
            rx,
        )
    }

    fn transitions(rx: &mut ReportReceiver) -> Vec<(WorkloadState, WorkloadState)> {
        rx.drain()
            .into_iter()
            .filter_map(|r| match r {
                Report::Status(u) => Some((u.previous_state, u.new_state)),
                Report::Usage(_) => None,
            })
            .collect()
    }

    async fn deployed(core: &Core) -> WorkloadId {
        let manifest = parse_str(MANIFEST).unwrap();
        core.deploy_with(
            &manifest,
            "d1",
            "l1",
            &DeploymentOptions::default(),
            |id| async move {
                core.update(&id, |res, w| {
                    res.push("namespace".into());
                    w.backend_ref.insert("namespace", "lf-d1");
                })
            },
            |_, res| async move { (res, Ok(())) },
        )
        .await
        .unwrap()
        .id
    }

    #[tokio::test]
    async fn test_deploy_lifecycle_emits_in_order() {
        let (core, mut rx) = core();
        let id = deployed(&core).await;

        let workload = core.workload(&id).unwrap();
        assert_eq!(workload.state, WorkloadState::Running);
        assert_eq!(workload.backend_ref.get("namespace"), Some("lf-d1"));
        assert_eq!(
            transitions(&mut rx),
            vec![
                (WorkloadState::Pending, WorkloadState::Deploying),
                (WorkloadState::Deploying, WorkloadState::Running),
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_deploy_rolls_back_and_blocks_redeploy() {
        let (core, mut rx) = core();
        let manifest = parse_str(MANIFEST).unwrap();
        let options = DeploymentOptions::default();

        let err = core
            .deploy_with(
                &manifest,
                "d1",
                "l1",
                &options,
                |id| {
                    let core = &core;
                    async move {
                        core.update(&id, |res, _| res.push("pvc".into()))?;
                        Err(CloudError::backend(
                            "create deployment",
                            BackendError::new(BackendErrorKind::QuotaExceeded, "pods"),
                        ))
                    }
                },
                |_, mut res| async move {
                    res.clear();
                    (res, Ok(()))
                },
            )
            .await
            .unwrap_err();
        assert!(err.is_unrecoverable());

        let id = WorkloadId::from("k8s-d1");
        assert_eq!(core.workload(&id).unwrap().state, WorkloadState::Failed);
        assert!(core.resources(&id).unwrap().is_empty());
        assert_eq!(
            transitions(&mut rx).last(),
            Some(&(WorkloadState::Deploying, WorkloadState::Failed))
        );

        let again = core
            .deploy_with(
                &manifest,
                "d1",
                "l1",
                &options,
                |_| async { Ok(()) },
                |_, res| async move { (res, Ok(())) },
            )
            .await;
        assert!(matches!(again, Err(CloudError::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_drive_is_idempotent() {
        let (core, mut rx) = core();
        let id = deployed(&core).await;
        rx.drain();

        core.drive(&id, WorkloadState::Stopped, "stopped", |_, _| async { Ok(()) })
            .await
            .unwrap();
        // Second stop never reaches the backend
        core.drive(&id, WorkloadState::Stopped, "stopped", |_, _| async {
            Err(CloudError::Timeout("should not run".into()))
        })
        .await
        .unwrap();

        assert_eq!(
            transitions(&mut rx),
            vec![(WorkloadState::Running, WorkloadState::Stopped)]
        );
    }

    #[tokio::test]
    async fn test_drive_rejects_illegal_transition() {
        let (core, _rx) = core();
        let id = deployed(&core).await;
        core.drive(&id, WorkloadState::Stopped, "stopped", |_, _| async { Ok(()) })
            .await
            .unwrap();

        let result = core
            .drive(&id, WorkloadState::Paused, "paused", |_, _| async { Ok(()) })
            .await;
        assert!(matches!(result, Err(CloudError::InvalidTransition { .. })));
    }

    #[tokio::test]
    async fn test_terminate_twice_then_not_found() {
        let (core, mut rx) = core();
        let id = deployed(&core).await;

        core.terminate_with(&id, |mut res| async move {
            res.clear();
            (res, Ok(()))
        })
        .await
        .unwrap();
        assert!(core.locks.is_empty());
        core.terminate_with(&id, |res| async move {
            (res, Err(CloudError::Timeout("should not run".into())))
        })
        .await
        .unwrap();

        assert!(matches!(core.workload(&id), Err(CloudError::NotFound(_))));
        assert!(matches!(
            core.drive(&id, WorkloadState::Running, "start", |_, _| async { Ok(()) })
                .await,
            Err(CloudError::NotFound(_))
        ));
        assert_eq!(
            transitions(&mut rx).last(),
            Some(&(WorkloadState::Running, WorkloadState::Terminated))
        );
    }

    #[tokio::test]
    async fn test_incomplete_release_keeps_workload() {
        let (core, _rx) = core();
        let id = deployed(&core).await;

        let result = core
            .terminate_with(&id, |res| async move {
                (res, Err(CloudError::Timeout("delete namespace".into())))
            })
            .await;
        assert!(matches!(result, Err(CloudError::Timeout(_))));
        assert_eq!(core.workload(&id).unwrap().state, WorkloadState::Running);
        assert_eq!(core.resources(&id).unwrap(), vec!["namespace".to_string()]);
    }

    #[tokio::test]
    async fn test_unrecoverable_error_fails_workload() {
        let (core, _rx) = core();
        let id = deployed(&core).await;

        let transient = CloudError::RetriesExhausted {
            operation: "scale".into(),
            attempts: 1,
            source: BackendError::transient("503"),
        };
        core.fail_if_unrecoverable(&id, transient).await;
        assert_eq!(core.workload(&id).unwrap().state, WorkloadState::Running);

        let auth = CloudError::backend(
            "scale",
            BackendError::new(BackendErrorKind::Unauthorized, "forbidden"),
        );
        core.fail_if_unrecoverable(&id, auth).await;
        assert_eq!(core.workload(&id).unwrap().state, WorkloadState::Failed);
    }

    #[tokio::test]
    async fn test_status_not_found_means_gone() {
        let (core, mut rx) = core();
        let id = deployed(&core).await;

        let result = core
            .status_with(&id, |_, _| async {
                Err(CloudError::backend(
                    "read deployment",
                    BackendError::not_found("deployments.apps \"api\" not found"),
                ))
            })
            .await;
        assert!(matches!(result, Err(CloudError::NotFound(_))));
        assert!(core.locks.is_empty());
        assert_eq!(
            transitions(&mut rx).last(),
            Some(&(WorkloadState::Running, WorkloadState::Terminated))
        );
    }

    #[tokio::test]
    async fn test_status_after_failed_deploy_stays_failed() {
        let (core, mut rx) = core();
        let manifest = parse_str(MANIFEST).unwrap();
        core.deploy_with(
            &manifest,
            "d1",
            "l1",
            &DeploymentOptions::default(),
            |_| async { Err(CloudError::Timeout("create namespace".into())) },
            |_, res| async move { (res, Ok(())) },
        )
        .await
        .unwrap_err();
        rx.drain();

        let id = WorkloadId::from("k8s-d1");
        let state = core
            .status_with(&id, |_, _| async { Ok(Observed::Gone) })
            .await
            .unwrap();
        assert_eq!(state, WorkloadState::Failed);
        assert_eq!(core.workload(&id).unwrap().state, WorkloadState::Failed);
        assert!(transitions(&mut rx).is_empty());

        // A Gone observation straight into the table keeps the record too
        core.observe(&id, Observed::Gone).await.unwrap();
        assert_eq!(core.workload(&id).unwrap().state, WorkloadState::Failed);
    }

    #[tokio::test]
    async fn test_status_transitional_keeps_last_stable() {
        let (core, _rx) = core();
        let id = deployed(&core).await;
        let state = core
            .status_with(&id, |_, _| async { Ok(Observed::Transitional) })
            .await
            .unwrap();
        assert_eq!(state, WorkloadState::Running);
    }
}

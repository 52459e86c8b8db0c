//! Dispatcher scenarios against the in-memory backends

use leaseflow_cloud::{
    BackendKind, DeploymentOptions, OBSERVED_DETAIL, OperationContext, PollConfig, Reporter,
    RetryConfig, WorkloadState, report_channel,
};
use leaseflow_cloud_aws::error::from_code;
use leaseflow_cloud_aws::testing::FakeEc2;
use leaseflow_cloud_aws::{AwsAdapter, Ec2Clients, InstanceState};
use leaseflow_cloud_k8s::testing::FakeKube;
use leaseflow_cloud_k8s::{K8sAdapter, KubeClients};
use leaseflow_cloud_vmware::testing::FakeVsphere;
use leaseflow_cloud_vmware::{VmPowerState, VsphereAdapter, VsphereClients};
use leaseflow_config::{AwsSettings, KubernetesSettings, VsphereSettings};
use leaseflow_controlplane::{
    DeployRequest, DispatchError, Dispatcher, FailureClass, LedgerState, LifecycleOperation,
    LifecycleRequest, MemoryLedger, Reconciler, SinkStats, UsagePoller, spawn_report_sink,
};
use leaseflow_core::{Manifest, parse_str};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SSH_VM: &str = r#"
version: v1
name: bastion
services:
  - name: bastion
    type: vm
    image: ami-0123456789abcdef0
    resources: { cpu: 1000, memory: 1073741824 }
    ports:
      - { name: ssh, containerPort: 22, expose: true }
"#;

const WEB: &str = r#"
version: v1
name: web
services:
  - name: web
    type: container
    image: nginx
    resources: { cpu: 500, memory: 268435456 }
    ports:
      - { name: http, containerPort: 80, expose: true }
    volumes:
      - { name: data, mountPath: /data }
volumes:
  - { name: data, size: 1073741824 }
"#;

fn poll() -> PollConfig {
    PollConfig {
        interval_ms: 100,
        max_interval_ms: 1_000,
        max_polls: 50,
    }
}

struct Harness {
    dispatcher: Arc<Dispatcher>,
    ledger: Arc<MemoryLedger>,
    ec2: Arc<FakeEc2>,
    kube: Arc<FakeKube>,
    reporter: Reporter,
    shutdown: CancellationToken,
    sink: JoinHandle<SinkStats>,
}

impl Harness {
    fn new() -> Self {
        let (reporter, rx) = report_channel(256, 16, Duration::from_secs(1));
        let ledger = Arc::new(MemoryLedger::new());
        let dispatcher = Arc::new(Dispatcher::new(ledger.clone()));

        let ec2 = Arc::new(FakeEc2::new().with_pending_polls(1));
        let aws = AwsSettings {
            retry: RetryConfig::new(3, 10),
            poll: poll(),
            ..AwsSettings::default()
        };
        dispatcher.register_adapter(Arc::new(AwsAdapter::new(
            Ec2Clients::from_shared(ec2.clone()),
            aws,
            reporter.clone(),
        )));

        let kube = Arc::new(FakeKube::new().with_pending_polls(1).with_deletion_polls(1));
        let k8s = KubernetesSettings {
            retry: RetryConfig::new(3, 10),
            rollout: poll(),
            namespace_deletion: poll(),
            ..KubernetesSettings::default()
        };
        dispatcher.register_adapter(Arc::new(K8sAdapter::new(
            KubeClients::from_shared(kube.clone()),
            k8s,
            reporter.clone(),
        )));

        let shutdown = CancellationToken::new();
        let sink = spawn_report_sink(
            rx,
            ledger.clone(),
            dispatcher.registry(),
            shutdown.clone(),
        );
        Self {
            dispatcher,
            ledger,
            ec2,
            kube,
            reporter,
            shutdown,
            sink,
        }
    }

    /// Stop the sink once everything buffered reached the ledger
    async fn flush(self) -> (Arc<MemoryLedger>, SinkStats) {
        self.shutdown.cancel();
        let stats = self.sink.await.unwrap();
        (self.ledger, stats)
    }
}

fn request(lease: &str, dep: &str, backend: BackendKind, manifest: Manifest) -> DeployRequest {
    DeployRequest {
        lease_id: lease.into(),
        deployment_id: dep.into(),
        backend,
        manifest,
        options: DeploymentOptions::default(),
    }
}

fn vm(lease: &str, dep: &str) -> DeployRequest {
    let mut request = request(lease, dep, BackendKind::Aws, parse_str(SSH_VM).unwrap());
    request.options.assign_public_ip = true;
    request
}

fn lifecycle(lease: &str, operation: LifecycleOperation) -> LifecycleRequest {
    LifecycleRequest {
        resource_uuid: lease.into(),
        operation,
    }
}

#[tokio::test(start_paused = true)]
async fn test_aws_lease_end_to_end() {
    let h = Harness::new();
    let ctx = OperationContext::new();

    let workload = h.dispatcher.deploy(&ctx, &vm("l-1", "d-1")).await.unwrap();
    assert_eq!(workload.state, WorkloadState::Running);
    assert!(workload.public_ip.is_some());
    assert_eq!(h.ledger.resource_state("l-1"), Some(LedgerState::Running));
    assert_eq!(h.dispatcher.leases().len(), 1);

    let response = h
        .dispatcher
        .dispatch(&ctx, &lifecycle("l-1", LifecycleOperation::Stop))
        .await;
    assert_eq!(response.new_state, Some(WorkloadState::Stopped));
    assert!(response.error.is_none());
    assert_eq!(h.ledger.resource_state("l-1"), Some(LedgerState::Stopped));

    let response = h
        .dispatcher
        .dispatch(&ctx, &lifecycle("l-1", LifecycleOperation::Start))
        .await;
    assert_eq!(response.new_state, Some(WorkloadState::Running));

    let response = h
        .dispatcher
        .dispatch(&ctx, &lifecycle("l-1", LifecycleOperation::Terminate))
        .await;
    assert_eq!(response.new_state, Some(WorkloadState::Terminated));
    assert_eq!(h.ledger.resource_state("l-1"), Some(LedgerState::Terminated));
    assert!(h.ec2.tagged_resources("d-1").is_empty());
    assert!(h.dispatcher.leases().is_empty());

    let err = h.dispatcher.status(&ctx, "l-1").await.unwrap_err();
    assert_eq!(err.class(), FailureClass::Gone);

    let (ledger, stats) = h.flush().await;
    assert_eq!(stats.unrouted, 0);
    use WorkloadState::*;
    let history: Vec<_> = ledger
        .status_history("l-1")
        .into_iter()
        .map(|u| u.new_state)
        .collect();
    assert_eq!(
        history,
        vec![Deploying, Running, Stopped, Running, Terminated]
    );
}

#[tokio::test(start_paused = true)]
async fn test_repeated_operations_are_idempotent() {
    let h = Harness::new();
    let ctx = OperationContext::new();
    h.dispatcher.deploy(&ctx, &vm("l-1", "d-1")).await.unwrap();

    for _ in 0..2 {
        let state = h
            .dispatcher
            .apply(&ctx, "l-1", LifecycleOperation::Stop)
            .await
            .unwrap();
        assert_eq!(state, WorkloadState::Stopped);
    }
    assert_eq!(h.ec2.faults.calls("stop_instances"), 1);

    for _ in 0..2 {
        h.dispatcher
            .apply(&ctx, "l-1", LifecycleOperation::Terminate)
            .await
            .unwrap();
    }
    let err = h
        .dispatcher
        .apply(&ctx, "l-1", LifecycleOperation::Start)
        .await
        .unwrap_err();
    assert_eq!(err.class(), FailureClass::Gone);
}

#[tokio::test(start_paused = true)]
async fn test_failed_deploy_is_not_registered() {
    let h = Harness::new();
    h.ec2
        .faults
        .fail("run_instance", from_code("UnauthorizedOperation", "denied"));

    let err = h
        .dispatcher
        .deploy(&OperationContext::new(), &vm("l-1", "d-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Cloud(_)));
    assert!(h.dispatcher.leases().is_empty());
    assert!(h.dispatcher.registry().lease_for("aws-d-1").is_none());
    assert!(h.ec2.tagged_resources("d-1").is_empty());
    assert_eq!(h.ledger.resource_state("l-1"), None);

    let response = h
        .dispatcher
        .dispatch(
            &OperationContext::new(),
            &lifecycle("l-1", LifecycleOperation::Start),
        )
        .await;
    assert_eq!(response.error.unwrap().class, FailureClass::Gone);
}

#[tokio::test(start_paused = true)]
async fn test_failed_operation_leaves_ledger_unchanged() {
    let h = Harness::new();
    let ctx = OperationContext::new();
    h.dispatcher.deploy(&ctx, &vm("l-1", "d-1")).await.unwrap();

    h.ec2
        .faults
        .fail("stop_instances", from_code("RequestLimitExceeded", "slow down"));
    let response = h
        .dispatcher
        .dispatch(&ctx, &lifecycle("l-1", LifecycleOperation::Stop))
        .await;
    assert_eq!(response.new_state, None);
    assert_eq!(response.error.unwrap().class, FailureClass::RetryLater);
    assert_eq!(h.ledger.resource_state("l-1"), Some(LedgerState::Running));

    // Pause has no EC2 counterpart here
    let err = h
        .dispatcher
        .apply(&ctx, "l-1", LifecycleOperation::Pause)
        .await
        .unwrap_err();
    assert_eq!(err.class(), FailureClass::Unsupported);
    assert_eq!(h.ledger.resource_state("l-1"), Some(LedgerState::Running));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_stop_and_terminate() {
    let h = Harness::new();
    let ctx = OperationContext::new();
    h.dispatcher.deploy(&ctx, &vm("l-1", "d-1")).await.unwrap();

    let stop = {
        let dispatcher = h.dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .apply(&OperationContext::new(), "l-1", LifecycleOperation::Stop)
                .await
        })
    };
    let terminate = {
        let dispatcher = h.dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .apply(&OperationContext::new(), "l-1", LifecycleOperation::Terminate)
                .await
        })
    };
    let stop = stop.await.unwrap();
    let terminate = terminate.await.unwrap();

    assert_eq!(terminate.unwrap(), WorkloadState::Terminated);
    // Stop either ran first or found the workload gone
    if let Err(e) = stop {
        assert_eq!(e.class(), FailureClass::Gone);
    }
    assert_eq!(h.ledger.resource_state("l-1"), Some(LedgerState::Terminated));
    assert!(h.ec2.tagged_resources("d-1").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_invalid_manifest_never_reaches_backend() {
    let h = Harness::new();
    let manifest = parse_str(
        r#"
version: v1
name: broken
services:
  - name: web
    type: container
    image: nginx
    resources: { cpu: 500, memory: 268435456 }
    volumes:
      - { name: missing, mountPath: /data }
"#,
    )
    .unwrap();

    let err = h
        .dispatcher
        .deploy(
            &OperationContext::new(),
            &request("l-1", "d-1", BackendKind::Kubernetes, manifest),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::InvalidManifest(_)));
    assert_eq!(err.class(), FailureClass::InvalidRequest);
    assert_eq!(h.kube.faults.calls("create_namespace"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_lease_and_missing_adapter() {
    let ledger = Arc::new(MemoryLedger::new());
    let dispatcher = Dispatcher::new(ledger);
    let err = dispatcher
        .deploy(&OperationContext::new(), &vm("l-1", "d-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NoAdapter(BackendKind::Aws)));

    let h = Harness::new();
    let ctx = OperationContext::new();
    h.dispatcher.deploy(&ctx, &vm("l-1", "d-1")).await.unwrap();
    let err = h.dispatcher.deploy(&ctx, &vm("l-1", "d-2")).await.unwrap_err();
    assert!(matches!(err, DispatchError::LeaseExists(_)));
    assert!(h.ec2.tagged_resources("d-2").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_second_lease_cannot_take_a_live_workload() {
    let h = Harness::new();
    let ctx = OperationContext::new();
    h.dispatcher.deploy(&ctx, &vm("l-1", "d-1")).await.unwrap();

    let err = h.dispatcher.deploy(&ctx, &vm("l-2", "d-1")).await.unwrap_err();
    assert!(matches!(err, DispatchError::WorkloadExists { ref lease_id, .. } if lease_id == "l-1"));
    assert_eq!(err.class(), FailureClass::InvalidRequest);
    assert_eq!(h.ec2.faults.calls("run_instance"), 1);
    assert_eq!(
        h.dispatcher.registry().lease_for("aws-d-1").as_deref(),
        Some("l-1")
    );

    let response = h
        .dispatcher
        .dispatch(&ctx, &lifecycle("l-1", LifecycleOperation::Stop))
        .await;
    assert_eq!(response.new_state, Some(WorkloadState::Stopped));

    let (ledger, stats) = h.flush().await;
    assert_eq!(stats.unrouted, 0);
    let history: Vec<_> = ledger
        .status_history("l-1")
        .into_iter()
        .map(|u| u.new_state)
        .collect();
    assert_eq!(history.last(), Some(&WorkloadState::Stopped));
    assert!(ledger.status_history("l-2").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_stop_waits_for_in_flight_deploy() {
    let h = Harness::new();
    h.ec2.faults.delay("run_instance", Duration::from_secs(5));

    let deploy = {
        let dispatcher = h.dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .deploy(&OperationContext::new(), &vm("l-1", "d-1"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(h.dispatcher.leases().is_empty());

    let response = h
        .dispatcher
        .dispatch(
            &OperationContext::new(),
            &lifecycle("l-1", LifecycleOperation::Stop),
        )
        .await;
    assert!(response.error.is_none(), "{:?}", response.error);
    assert_eq!(response.new_state, Some(WorkloadState::Stopped));

    let workload = deploy.await.unwrap().unwrap();
    assert_eq!(workload.state, WorkloadState::Running);
    assert_eq!(h.ledger.resource_state("l-1"), Some(LedgerState::Stopped));
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_failed_deploy_is_gone() {
    let h = Harness::new();
    h.ec2.faults.delay("run_instance", Duration::from_secs(5));
    h.ec2
        .faults
        .fail("run_instance", from_code("UnauthorizedOperation", "denied"));

    let deploy = {
        let dispatcher = h.dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .deploy(&OperationContext::new(), &vm("l-1", "d-1"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;

    let err = h
        .dispatcher
        .apply(&OperationContext::new(), "l-1", LifecycleOperation::Stop)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::UnknownLease(_)));
    assert!(deploy.await.unwrap().is_err());
    assert!(h.dispatcher.registry().resolve("l-1").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_kubernetes_pause_and_resume() {
    let h = Harness::new();
    let ctx = OperationContext::new();
    h.dispatcher
        .deploy(
            &ctx,
            &request("l-2", "d-2", BackendKind::Kubernetes, parse_str(WEB).unwrap()),
        )
        .await
        .unwrap();
    assert!(h.kube.pvc("lf-d-2", "data").is_some());

    let state = h
        .dispatcher
        .apply(&ctx, "l-2", LifecycleOperation::Pause)
        .await
        .unwrap();
    assert_eq!(state, WorkloadState::Paused);
    assert_eq!(h.kube.replicas("lf-d-2", "web"), Some(0));
    assert_eq!(h.ledger.resource_state("l-2"), Some(LedgerState::Paused));

    h.dispatcher
        .apply(&ctx, "l-2", LifecycleOperation::Resume)
        .await
        .unwrap();
    assert_eq!(h.kube.replicas("lf-d-2", "web"), Some(1));

    h.dispatcher
        .apply(&ctx, "l-2", LifecycleOperation::Terminate)
        .await
        .unwrap();
    assert!(!h.kube.has_namespace("lf-d-2"));
}

#[tokio::test(start_paused = true)]
async fn test_reconciler_surfaces_out_of_band_changes() {
    let h = Harness::new();
    let ctx = OperationContext::new();
    h.dispatcher.deploy(&ctx, &vm("l-1", "d-1")).await.unwrap();
    h.dispatcher.deploy(&ctx, &vm("l-2", "d-2")).await.unwrap();

    let instance = |lease: &str| {
        h.dispatcher
            .workload(lease)
            .unwrap()
            .backend_ref
            .get("instance/bastion")
            .unwrap()
            .to_string()
    };
    h.ec2
        .set_instance_state(&instance("l-1"), InstanceState::Stopped);
    h.ec2.purge_instance(&instance("l-2"));

    let reconciler = Reconciler::new(h.dispatcher.clone(), Duration::from_secs(30));
    let stats = reconciler.reconcile_once().await;
    assert_eq!(stats.leases, 2);
    assert_eq!(stats.ok, 1);
    assert_eq!(stats.gone, 1);

    // The lost lease is retired; the stopped one is still live
    let live = h.dispatcher.leases();
    assert_eq!(live.len(), 1);
    assert_eq!(live[0].lease_id, "l-1");

    let (ledger, _) = h.flush().await;
    let observed: Vec<_> = ledger
        .status_history("l-1")
        .into_iter()
        .filter(|u| u.detail == OBSERVED_DETAIL)
        .map(|u| u.new_state)
        .collect();
    assert_eq!(observed, vec![WorkloadState::Stopped]);
    let lost = ledger.status_history("l-2");
    assert_eq!(
        lost.last().map(|u| u.new_state),
        Some(WorkloadState::Terminated)
    );
}

#[tokio::test(start_paused = true)]
async fn test_usage_poller_publishes_samples() {
    let h = Harness::new();
    let ctx = OperationContext::new();
    h.dispatcher.deploy(&ctx, &vm("l-1", "d-1")).await.unwrap();

    let poller = UsagePoller::new(
        h.dispatcher.clone(),
        h.reporter.clone(),
        Duration::from_secs(60),
    );
    let stats = poller.poll_once().await;
    assert_eq!(stats.ok, 1);

    let shutdown = CancellationToken::new();
    let task = poller.spawn(shutdown.clone());
    tokio::time::sleep(Duration::from_secs(150)).await;
    shutdown.cancel();
    task.await.unwrap();

    let (ledger, stats) = h.flush().await;
    // One direct pass and two ticks
    assert_eq!(stats.usage, 3);
    assert!(ledger.usage("l-1").iter().all(|r| r.workload_id == "aws-d-1"));
}

#[tokio::test(start_paused = true)]
async fn test_vsphere_suspend_goes_through_dispatch() {
    let (reporter, rx) = report_channel(64, 8, Duration::from_secs(1));
    let ledger = Arc::new(MemoryLedger::new());
    let dispatcher = Dispatcher::new(ledger.clone());
    let vcenter = Arc::new(FakeVsphere::new().with_template("Datacenter", "ubuntu-24.04"));
    let settings = VsphereSettings {
        retry: RetryConfig::new(3, 10),
        task_poll: poll(),
        ..VsphereSettings::default()
    };
    dispatcher.register_adapter(Arc::new(VsphereAdapter::new(
        VsphereClients::from_shared(vcenter.clone()),
        settings,
        reporter,
    )));
    let shutdown = CancellationToken::new();
    let sink = spawn_report_sink(rx, ledger.clone(), dispatcher.registry(), shutdown.clone());

    let manifest = parse_str(
        r#"
version: v1
name: db
services:
  - name: db
    type: vm
    image: ubuntu-24.04
    resources: { cpu: 1000, memory: 2147483648 }
"#,
    )
    .unwrap();
    let ctx = OperationContext::new();
    dispatcher
        .deploy(&ctx, &request("l-5", "d-5", BackendKind::Vmware, manifest))
        .await
        .unwrap();

    let response = dispatcher
        .dispatch(&ctx, &lifecycle("l-5", LifecycleOperation::Pause))
        .await;
    assert_eq!(response.new_state, Some(WorkloadState::Paused));
    assert_eq!(vcenter.power_of("vs-d-5-db"), Some(VmPowerState::Suspended));
    assert_eq!(ledger.resource_state("l-5"), Some(LedgerState::Paused));

    let response = dispatcher
        .dispatch(&ctx, &lifecycle("l-5", LifecycleOperation::Terminate))
        .await;
    assert_eq!(response.new_state, Some(WorkloadState::Terminated));
    assert!(vcenter.tagged_resources("d-5").is_empty());

    shutdown.cancel();
    let stats = sink.await.unwrap();
    assert_eq!(stats.unrouted, 0);
    assert_eq!(
        ledger.status_history("l-5").last().map(|u| u.new_state),
        Some(WorkloadState::Terminated)
    );
}

//! Reporting channel consumer
//!
//! Drains status updates and usage samples into the ledger in the order
//! the adapters emitted them.

use crate::ledger::Ledger;
use crate::registry::LeaseRegistry;
use leaseflow_cloud::{Report, ReportReceiver};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the sink did before it stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStats {
    pub statuses: u64,
    pub usage: u64,
    /// Reports for workloads no lease owns
    pub unrouted: u64,
    /// Reports the ledger refused
    pub rejected: u64,
}

/// Forward reports until every reporter is dropped or `shutdown` fires
///
/// Reports still buffered at shutdown are forwarded before the task ends.
pub fn spawn_report_sink(
    mut receiver: ReportReceiver,
    ledger: Arc<dyn Ledger>,
    registry: Arc<LeaseRegistry>,
    shutdown: CancellationToken,
) -> JoinHandle<SinkStats> {
    tokio::spawn(async move {
        let mut stats = SinkStats::default();
        loop {
            let report = tokio::select! {
                report = receiver.recv() => report,
                _ = shutdown.cancelled() => {
                    receiver.close();
                    for report in receiver.drain() {
                        forward(report, ledger.as_ref(), &registry, &mut stats).await;
                    }
                    break;
                }
            };
            let Some(report) = report else { break };
            forward(report, ledger.as_ref(), &registry, &mut stats).await;
        }
        info!(
            statuses = stats.statuses,
            usage = stats.usage,
            unrouted = stats.unrouted,
            rejected = stats.rejected,
            "report sink stopped"
        );
        stats
    })
}

async fn forward(
    report: Report,
    ledger: &dyn Ledger,
    registry: &LeaseRegistry,
    stats: &mut SinkStats,
) {
    let Some(lease_id) = registry.lease_for(report.workload_id()) else {
        // A deploy that failed is never a lease
        debug!(workload_id = %report.workload_id(), "report for unknown workload dropped");
        stats.unrouted += 1;
        return;
    };

    let result = match report {
        Report::Status(update) => {
            stats.statuses += 1;
            ledger.record_status(&lease_id, update).await
        }
        Report::Usage(record) => {
            stats.usage += 1;
            ledger.record_usage(&lease_id, record).await
        }
    };
    if let Err(e) = result {
        stats.rejected += 1;
        warn!(lease_id = %lease_id, error = %e, "ledger rejected report");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::MemoryLedger;
    use chrono::Utc;
    use leaseflow_cloud::{
        BackendKind, StatusUpdate, UsageRecord, WorkloadId, WorkloadState, report_channel,
    };
    use std::time::Duration;

    fn status(id: &str, from: WorkloadState, to: WorkloadState) -> StatusUpdate {
        StatusUpdate {
            workload_id: id.into(),
            previous_state: from,
            new_state: to,
            occurred_at: Utc::now(),
            detail: String::new(),
        }
    }

    fn registry() -> Arc<LeaseRegistry> {
        let registry = LeaseRegistry::new();
        registry
            .reserve(
                "l-1",
                BackendKind::Kubernetes,
                WorkloadId::for_deployment(BackendKind::Kubernetes, "d-1"),
            )
            .unwrap();
        registry.commit("l-1");
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_status_order_is_preserved() {
        use WorkloadState::*;

        let (reporter, rx) = report_channel(16, 4, Duration::from_secs(1));
        let ledger = Arc::new(MemoryLedger::new());
        let sink = spawn_report_sink(rx, ledger.clone(), registry(), CancellationToken::new());

        for (from, to) in [
            (Pending, Deploying),
            (Deploying, Running),
            (Running, Paused),
            (Paused, Running),
            (Running, Terminated),
        ] {
            assert!(reporter.status(status("k8s-d-1", from, to)).await);
        }
        reporter.usage(UsageRecord {
            workload_id: "k8s-d-1".into(),
            measured_at: Utc::now(),
            cpu_seconds: 1.5,
            memory_byte_seconds: 4096.0,
            network_bytes: 0,
        });
        drop(reporter);

        let stats = sink.await.unwrap();
        assert_eq!(stats.statuses, 5);
        assert_eq!(stats.usage, 1);

        let history: Vec<_> = ledger
            .status_history("l-1")
            .into_iter()
            .map(|u| u.new_state)
            .collect();
        assert_eq!(history, vec![Deploying, Running, Paused, Running, Terminated]);
        assert_eq!(ledger.usage("l-1").len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_workload_is_not_routed() {
        let (reporter, rx) = report_channel(4, 0, Duration::from_secs(1));
        let ledger = Arc::new(MemoryLedger::new());
        let sink = spawn_report_sink(rx, ledger.clone(), registry(), CancellationToken::new());

        reporter
            .status(status("aws-x", WorkloadState::Deploying, WorkloadState::Failed))
            .await;
        drop(reporter);

        let stats = sink.await.unwrap();
        assert_eq!(stats.unrouted, 1);
        assert!(ledger.status_history("l-1").is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_buffered_reports() {
        let (reporter, rx) = report_channel(8, 0, Duration::from_secs(1));
        let ledger = Arc::new(MemoryLedger::new());
        let shutdown = CancellationToken::new();

        reporter
            .status(status("k8s-d-1", WorkloadState::Running, WorkloadState::Stopped))
            .await;
        shutdown.cancel();
        let stats = spawn_report_sink(rx, ledger.clone(), registry(), shutdown)
            .await
            .unwrap();

        // The reporter is still alive; the sink stopped on the token
        assert!(reporter.is_closed());
        assert_eq!(stats.statuses, 1);
        assert_eq!(ledger.status_history("l-1").len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_reports_are_counted() {
        let (reporter, rx) = report_channel(4, 0, Duration::from_secs(1));
        let ledger = Arc::new(MemoryLedger::new());
        ledger.set_unavailable(true);
        let sink = spawn_report_sink(rx, ledger.clone(), registry(), CancellationToken::new());

        reporter
            .status(status("k8s-d-1", WorkloadState::Running, WorkloadState::Stopped))
            .await;
        drop(reporter);
        assert_eq!(sink.await.unwrap().rejected, 1);
    }
}

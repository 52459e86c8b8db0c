//! Status and usage reporting channel
//!
//! One bounded channel carries both kinds of report. Status updates wait
//! a bounded time for capacity; usage samples never wait and are only
//! admitted while enough capacity remains free for status updates.

use crate::state::StatusUpdate;
use crate::usage::UsageRecord;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};

/// A report emitted by an adapter
#[derive(Debug, Clone, PartialEq)]
pub enum Report {
    Status(StatusUpdate),
    Usage(UsageRecord),
}

impl Report {
    pub fn workload_id(&self) -> &str {
        match self {
            Report::Status(update) => &update.workload_id,
            Report::Usage(record) => &record.workload_id,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    status_sent: AtomicU64,
    status_dropped: AtomicU64,
    usage_sent: AtomicU64,
    usage_dropped: AtomicU64,
}

/// Snapshot of the reporter's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReporterStats {
    pub status_sent: u64,
    pub status_dropped: u64,
    pub usage_sent: u64,
    pub usage_dropped: u64,
}

/// Producer half, shared by every adapter
#[derive(Debug, Clone)]
pub struct Reporter {
    tx: mpsc::Sender<Report>,
    headroom: usize,
    status_timeout: Duration,
    counters: Arc<Counters>,
}

/// Consumer half
#[derive(Debug)]
pub struct ReportReceiver {
    rx: mpsc::Receiver<Report>,
}

/// Create a reporting channel
///
/// `headroom` slots are reserved for status updates: a usage sample is
/// dropped unless more than `headroom` slots are free.
pub fn report_channel(
    capacity: usize,
    headroom: usize,
    status_timeout: Duration,
) -> (Reporter, ReportReceiver) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let reporter = Reporter {
        tx,
        headroom: headroom.min(capacity - 1),
        status_timeout,
        counters: Arc::new(Counters::default()),
    };
    (reporter, ReportReceiver { rx })
}

impl Reporter {
    /// Emit a state transition
    ///
    /// Waits at most the configured timeout for capacity. Returns whether
    /// the update was accepted.
    pub async fn status(&self, update: StatusUpdate) -> bool {
        let workload_id = update.workload_id.clone();
        match self
            .tx
            .send_timeout(Report::Status(update), self.status_timeout)
            .await
        {
            Ok(()) => {
                self.counters.status_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(SendTimeoutError::Timeout(_)) => {
                self.counters.status_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    workload_id = %workload_id,
                    timeout_ms = self.status_timeout.as_millis() as u64,
                    "status channel full, update dropped"
                );
                false
            }
            Err(SendTimeoutError::Closed(_)) => {
                self.counters.status_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(workload_id = %workload_id, "status channel closed");
                false
            }
        }
    }

    /// Emit a usage sample without waiting
    pub fn usage(&self, record: UsageRecord) -> bool {
        if self.tx.capacity() <= self.headroom {
            self.counters.usage_dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                workload_id = %record.workload_id,
                free = self.tx.capacity(),
                headroom = self.headroom,
                "reporting channel congested, usage sample dropped"
            );
            return false;
        }

        match self.tx.try_send(Report::Usage(record)) {
            Ok(()) => {
                self.counters.usage_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(report)) => {
                self.counters.usage_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    workload_id = %report.workload_id(),
                    "reporting channel full, usage sample dropped"
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.usage_dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn stats(&self) -> ReporterStats {
        ReporterStats {
            status_sent: self.counters.status_sent.load(Ordering::Relaxed),
            status_dropped: self.counters.status_dropped.load(Ordering::Relaxed),
            usage_sent: self.counters.usage_sent.load(Ordering::Relaxed),
            usage_dropped: self.counters.usage_dropped.load(Ordering::Relaxed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl ReportReceiver {
    pub async fn recv(&mut self) -> Option<Report> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Report> {
        self.rx.try_recv().ok()
    }

    /// Everything currently buffered
    pub fn drain(&mut self) -> Vec<Report> {
        let mut reports = Vec::new();
        while let Some(report) = self.try_recv() {
            reports.push(report);
        }
        reports
    }

    pub fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WorkloadState;
    use chrono::Utc;

    fn status(id: &str, to: WorkloadState) -> StatusUpdate {
        StatusUpdate {
            workload_id: id.into(),
            previous_state: WorkloadState::Deploying,
            new_state: to,
            occurred_at: Utc::now(),
            detail: String::new(),
        }
    }

    fn usage(id: &str) -> UsageRecord {
        UsageRecord {
            workload_id: id.into(),
            measured_at: Utc::now(),
            cpu_seconds: 1.0,
            memory_byte_seconds: 1.0,
            network_bytes: 0,
        }
    }

    #[tokio::test]
    async fn test_usage_dropped_before_status_blocks() {
        let (reporter, mut rx) = report_channel(4, 2, Duration::from_millis(50));

        assert!(reporter.usage(usage("a")));
        assert!(reporter.usage(usage("a")));
        // Only the reserved headroom is left
        assert!(!reporter.usage(usage("a")));

        assert!(reporter.status(status("a", WorkloadState::Running)).await);
        assert!(reporter.status(status("a", WorkloadState::Paused)).await);

        let stats = reporter.stats();
        assert_eq!(stats.usage_sent, 2);
        assert_eq!(stats.usage_dropped, 1);
        assert_eq!(stats.status_sent, 2);
        assert_eq!(rx.drain().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_times_out_on_full_channel() {
        let (reporter, _rx) = report_channel(1, 0, Duration::from_millis(100));
        assert!(reporter.status(status("a", WorkloadState::Running)).await);
        assert!(!reporter.status(status("a", WorkloadState::Paused)).await);
        assert_eq!(reporter.stats().status_dropped, 1);
    }

    #[tokio::test]
    async fn test_per_workload_order_is_preserved() {
        let (reporter, mut rx) = report_channel(16, 4, Duration::from_secs(1));
        for to in [
            WorkloadState::Running,
            WorkloadState::Paused,
            WorkloadState::Running,
            WorkloadState::Stopped,
        ] {
            reporter.status(status("k8s-d1", to)).await;
        }

        let states: Vec<_> = rx
            .drain()
            .into_iter()
            .filter_map(|r| match r {
                Report::Status(u) => Some(u.new_state),
                Report::Usage(_) => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                WorkloadState::Running,
                WorkloadState::Paused,
                WorkloadState::Running,
                WorkloadState::Stopped,
            ]
        );
    }

    #[tokio::test]
    async fn test_closed_receiver_does_not_block() {
        let (reporter, rx) = report_channel(2, 0, Duration::from_secs(60));
        drop(rx);
        assert!(reporter.is_closed());
        assert!(!reporter.status(status("a", WorkloadState::Running)).await);
        assert!(!reporter.usage(usage("a")));
    }
}

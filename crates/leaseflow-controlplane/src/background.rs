//! Periodic usage sampling and status reconciliation

use crate::dispatcher::Dispatcher;
use crate::error::FailureClass;
use futures_util::future::join_all;
use leaseflow_cloud::{OperationContext, Reporter};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Result of one pass over the live leases
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub leases: usize,
    pub ok: usize,
    /// Leases whose workload the backend no longer has
    pub gone: usize,
    pub failed: usize,
}

/// Samples usage for every live lease and publishes it
pub struct UsagePoller {
    dispatcher: Arc<Dispatcher>,
    reporter: Reporter,
    interval: Duration,
    call_timeout: Duration,
}

impl UsagePoller {
    pub fn new(dispatcher: Arc<Dispatcher>, reporter: Reporter, interval: Duration) -> Self {
        Self {
            dispatcher,
            reporter,
            interval,
            call_timeout: interval,
        }
    }

    /// Bound on each sampling call; defaults to the interval
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Sample every live lease once
    ///
    /// A dropped sample is not an error here; the reporter counts it.
    pub async fn poll_once(&self) -> PassStats {
        let leases = self.dispatcher.leases();
        let results = join_all(leases.iter().map(|lease| async move {
            let ctx = OperationContext::with_timeout(self.call_timeout);
            (lease, self.dispatcher.sample_usage(&ctx, &lease.lease_id).await)
        }))
        .await;

        let mut stats = PassStats {
            leases: leases.len(),
            ..PassStats::default()
        };
        for (lease, result) in results {
            match result {
                Ok(record) => {
                    self.reporter.usage(record);
                    stats.ok += 1;
                }
                Err(e) => {
                    warn!(lease_id = %lease.lease_id, error = %e, "usage sample failed");
                    stats.failed += 1;
                }
            }
        }
        stats
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick fires immediately; nothing has run yet
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stats = self.poll_once().await;
                        debug!(leases = stats.leases, failed = stats.failed, "usage pass");
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }
}

/// Queries every live lease so out-of-band changes surface
///
/// The adapters emit a status update for every difference they observe;
/// the report sink carries those to the ledger.
pub struct Reconciler {
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    call_timeout: Duration,
}

impl Reconciler {
    pub fn new(dispatcher: Arc<Dispatcher>, interval: Duration) -> Self {
        Self {
            dispatcher,
            interval,
            call_timeout: interval,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub async fn reconcile_once(&self) -> PassStats {
        let leases = self.dispatcher.leases();
        let results = join_all(leases.iter().map(|lease| async move {
            let ctx = OperationContext::with_timeout(self.call_timeout);
            (lease, self.dispatcher.status(&ctx, &lease.lease_id).await)
        }))
        .await;

        let mut stats = PassStats {
            leases: leases.len(),
            ..PassStats::default()
        };
        for (lease, result) in results {
            match result {
                Ok(state) => {
                    debug!(lease_id = %lease.lease_id, state = %state, "reconciled");
                    stats.ok += 1;
                }
                // The dispatcher has retired it already
                Err(e) if e.class() == FailureClass::Gone => {
                    debug!(lease_id = %lease.lease_id, "workload gone");
                    stats.gone += 1;
                }
                Err(e) => {
                    warn!(lease_id = %lease.lease_id, error = %e, "status query failed");
                    stats.failed += 1;
                }
            }
        }
        stats
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stats = self.reconcile_once().await;
                        debug!(leases = stats.leases, failed = stats.failed, "reconcile pass");
                    }
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }
}

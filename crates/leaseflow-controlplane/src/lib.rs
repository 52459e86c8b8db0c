//! leaseflow control plane
//!
//! Sits between the external ledger and the backend adapters:
//!
//! - [`Dispatcher`] deploys leases and serves lifecycle requests
//! - [`spawn_report_sink`] drains adapter reports into the [`Ledger`]
//! - [`UsagePoller`] and [`Reconciler`] run the periodic passes

pub mod background;
pub mod dispatcher;
pub mod error;
pub mod ledger;
pub mod registry;
pub mod sink;

pub use background::{PassStats, Reconciler, UsagePoller};
pub use dispatcher::{
    DeployRequest, Dispatcher, LifecycleFailure, LifecycleOperation, LifecycleRequest,
    LifecycleResponse,
};
pub use error::{DispatchError, FailureClass, LedgerError, Result};
pub use ledger::{Ledger, LedgerState, MemoryLedger};
pub use registry::{LeaseEntry, LeasePhase, LeaseRegistry};
pub use sink::{SinkStats, spawn_report_sink};

use leaseflow_cloud::{ReportReceiver, Reporter, report_channel};
use leaseflow_config::ReportingSettings;

/// Reporting channel sized from configuration
pub fn reporting_channel(settings: &ReportingSettings) -> (Reporter, ReportReceiver) {
    report_channel(
        settings.capacity,
        settings.usage_headroom,
        settings.status_timeout(),
    )
}

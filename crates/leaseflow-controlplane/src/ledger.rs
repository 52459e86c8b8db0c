//! External ledger boundary
//!
//! The ledger owns lease and billing records. The control plane only
//! pushes resource states, status history and usage samples into it.

use crate::error::LedgerError;
use async_trait::async_trait;
use leaseflow_cloud::{StatusUpdate, UsageRecord, WorkloadState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Resource state as the ledger records it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LedgerState {
    Running,
    Paused,
    Stopped,
    Terminated,
    Failed,
}

impl LedgerState {
    /// Ledger counterpart of a canonical state
    ///
    /// `Pending` and `Deploying` have none: a resource reaches the ledger
    /// only once its deploy has succeeded.
    pub fn from_workload(state: WorkloadState) -> Option<Self> {
        match state {
            WorkloadState::Pending | WorkloadState::Deploying => None,
            WorkloadState::Running => Some(Self::Running),
            WorkloadState::Paused => Some(Self::Paused),
            WorkloadState::Stopped => Some(Self::Stopped),
            WorkloadState::Terminated => Some(Self::Terminated),
            WorkloadState::Failed => Some(Self::Failed),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Stopped => "Stopped",
            Self::Terminated => "Terminated",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for LedgerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn set_resource_state(
        &self,
        resource_uuid: &str,
        state: LedgerState,
    ) -> Result<(), LedgerError>;

    async fn record_status(&self, lease_id: &str, update: StatusUpdate) -> Result<(), LedgerError>;

    /// Usage records are append-only
    async fn record_usage(&self, lease_id: &str, record: UsageRecord) -> Result<(), LedgerError>;
}

#[derive(Debug, Default)]
struct Books {
    states: HashMap<String, LedgerState>,
    history: HashMap<String, Vec<StatusUpdate>>,
    usage: HashMap<String, Vec<UsageRecord>>,
    unavailable: bool,
}

/// In-memory ledger for tests and local runs
#[derive(Debug, Default)]
pub struct MemoryLedger {
    books: Mutex<Books>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource_state(&self, resource_uuid: &str) -> Option<LedgerState> {
        self.lock().states.get(resource_uuid).copied()
    }

    pub fn status_history(&self, lease_id: &str) -> Vec<StatusUpdate> {
        self.lock().history.get(lease_id).cloned().unwrap_or_default()
    }

    pub fn usage(&self, lease_id: &str) -> Vec<UsageRecord> {
        self.lock().usage.get(lease_id).cloned().unwrap_or_default()
    }

    /// Make every write fail until called again with `false`
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    fn lock(&self) -> MutexGuard<'_, Books> {
        self.books.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn writable(&self) -> Result<MutexGuard<'_, Books>, LedgerError> {
        let books = self.lock();
        if books.unavailable {
            return Err(LedgerError::Unavailable("memory ledger offline".into()));
        }
        Ok(books)
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn set_resource_state(
        &self,
        resource_uuid: &str,
        state: LedgerState,
    ) -> Result<(), LedgerError> {
        self.writable()?
            .states
            .insert(resource_uuid.to_string(), state);
        Ok(())
    }

    async fn record_status(&self, lease_id: &str, update: StatusUpdate) -> Result<(), LedgerError> {
        self.writable()?
            .history
            .entry(lease_id.to_string())
            .or_default()
            .push(update);
        Ok(())
    }

    async fn record_usage(&self, lease_id: &str, record: UsageRecord) -> Result<(), LedgerError> {
        self.writable()?
            .usage
            .entry(lease_id.to_string())
            .or_default()
            .push(record);
        Ok(())
    }
}

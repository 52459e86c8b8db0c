//! Adapter-owned workload records
//!
//! Every state change goes through [`WorkloadState::can_transition_to`]
//! and yields the [`StatusUpdate`] to emit. Terminated ids stay behind as
//! tombstones so a repeated `Terminate` is a no-op and a repeated
//! `Deploy` of the same deployment is still rejected.

use crate::error::{CloudError, Result};
use crate::state::{Observed, StatusUpdate, WorkloadState};
use crate::usage::UsageMeter;
use crate::workload::{Workload, WorkloadId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Detail attached to transitions discovered by a status query
pub const OBSERVED_DETAIL: &str = "observed on backend";

/// One live workload and the native resources created for it
#[derive(Debug, Clone)]
pub struct WorkloadRecord<R> {
    pub workload: Workload,
    /// Typed record of native resources, filled in as provisioning proceeds
    pub resources: R,
    pub meter: UsageMeter,
}

#[derive(Debug)]
enum Entry<R> {
    Live(WorkloadRecord<R>),
    Tombstone,
}

/// Result of reconciling a backend observation
#[derive(Debug, Clone)]
pub enum Observation {
    /// The workload is still known; `update` is set when the state changed
    Current {
        workload: Workload,
        update: Option<StatusUpdate>,
    },
    /// The backend lost the workload; it is now tombstoned
    Vanished { update: Option<StatusUpdate> },
}

#[derive(Debug)]
pub struct WorkloadTable<R> {
    entries: Mutex<HashMap<WorkloadId, Entry<R>>>,
}

impl<R> Default for WorkloadTable<R> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<R: Clone> WorkloadTable<R> {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<WorkloadId, Entry<R>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim an id for a new deployment
    pub fn insert(&self, record: WorkloadRecord<R>) -> Result<()> {
        let mut entries = self.entries();
        let id = record.workload.id.clone();
        if entries.contains_key(&id) {
            return Err(CloudError::AlreadyExists(id.to_string()));
        }
        entries.insert(id, Entry::Live(record));
        Ok(())
    }

    pub fn contains(&self, id: &WorkloadId) -> bool {
        matches!(self.entries().get(id), Some(Entry::Live(_)))
    }

    pub fn is_tombstone(&self, id: &WorkloadId) -> bool {
        matches!(self.entries().get(id), Some(Entry::Tombstone))
    }

    /// Run `f` against a live record
    pub fn with_record<T>(
        &self,
        id: &WorkloadId,
        f: impl FnOnce(&mut WorkloadRecord<R>) -> T,
    ) -> Result<T> {
        match self.entries().get_mut(id) {
            Some(Entry::Live(record)) => Ok(f(record)),
            _ => Err(CloudError::NotFound(id.to_string())),
        }
    }

    pub fn workload(&self, id: &WorkloadId) -> Result<Workload> {
        self.with_record(id, |r| r.workload.clone())
    }

    pub fn record(&self, id: &WorkloadId) -> Result<WorkloadRecord<R>> {
        self.with_record(id, |r| r.clone())
    }

    /// Snapshot of every live workload
    pub fn workloads(&self) -> Vec<Workload> {
        let mut workloads: Vec<_> = self
            .entries()
            .values()
            .filter_map(|e| match e {
                Entry::Live(r) => Some(r.workload.clone()),
                Entry::Tombstone => None,
            })
            .collect();
        workloads.sort_by(|a, b| a.id.cmp(&b.id));
        workloads
    }

    /// Apply a transition
    ///
    /// Staying in the current state is a no-op returning `None`.
    pub fn transition(
        &self,
        id: &WorkloadId,
        to: WorkloadState,
        detail: &str,
    ) -> Result<Option<StatusUpdate>> {
        self.with_record(id, |record| apply(record, to, detail, Utc::now()))?
    }

    /// Reconcile the recorded state with what the backend reports
    pub fn observe(&self, id: &WorkloadId, observed: Observed) -> Result<Observation> {
        let mut entries = self.entries();
        let record = match entries.get_mut(id) {
            Some(Entry::Live(record)) => record,
            _ => return Err(CloudError::NotFound(id.to_string())),
        };

        match observed {
            Observed::Transitional => Ok(Observation::Current {
                workload: record.workload.clone(),
                update: None,
            }),
            Observed::Stable(state) => {
                let update = match apply(record, state, OBSERVED_DETAIL, Utc::now()) {
                    Ok(update) => update,
                    Err(e) => {
                        tracing::warn!(
                            workload_id = %id,
                            recorded = %record.workload.state,
                            observed = %state,
                            error = %e,
                            "ignoring observed state"
                        );
                        None
                    }
                };
                Ok(Observation::Current {
                    workload: record.workload.clone(),
                    update,
                })
            }
            // Failed keeps its record so rollback leftovers stay visible
            Observed::Gone if record.workload.state == WorkloadState::Failed => {
                Ok(Observation::Current {
                    workload: record.workload.clone(),
                    update: None,
                })
            }
            Observed::Gone => {
                let update = apply(
                    record,
                    WorkloadState::Terminated,
                    OBSERVED_DETAIL,
                    Utc::now(),
                )
                .ok()
                .flatten();
                entries.insert(id.clone(), Entry::Tombstone);
                Ok(Observation::Vanished { update })
            }
        }
    }

    /// Retire a workload, returning its last record
    pub fn tombstone(&self, id: &WorkloadId) -> Option<WorkloadRecord<R>> {
        match self.entries().insert(id.clone(), Entry::Tombstone) {
            Some(Entry::Live(record)) => Some(record),
            _ => None,
        }
    }
}

fn apply<R>(
    record: &mut WorkloadRecord<R>,
    to: WorkloadState,
    detail: &str,
    now: DateTime<Utc>,
) -> Result<Option<StatusUpdate>> {
    let from = record.workload.state;
    if from == to {
        return Ok(None);
    }
    if !from.can_transition_to(to) {
        return Err(CloudError::InvalidTransition {
            workload: record.workload.id.to_string(),
            from,
            to,
        });
    }

    record.workload.state = to;
    record.workload.updated_at = now;
    record.meter.set_running(to == WorkloadState::Running, now);

    Ok(Some(StatusUpdate {
        workload_id: record.workload.id.to_string(),
        previous_state: from,
        new_state: to,
        occurred_at: now,
        detail: detail.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::{BackendKind, BackendRef};
    use leaseflow_core::ResourceSpec;

    fn record(state: WorkloadState) -> WorkloadRecord<Vec<String>> {
        let now = Utc::now();
        WorkloadRecord {
            workload: Workload {
                id: WorkloadId::for_deployment(BackendKind::Aws, "d1"),
                backend: BackendKind::Aws,
                deployment_id: "d1".into(),
                lease_id: "l1".into(),
                state,
                backend_ref: BackendRef::new(),
                public_ip: None,
                created_at: now,
                updated_at: now,
            },
            resources: Vec::new(),
            meter: UsageMeter::new(ResourceSpec::default(), 1),
        }
    }

    fn id() -> WorkloadId {
        WorkloadId::from("aws-d1")
    }

    #[test]
    fn test_insert_rejects_duplicates_and_tombstones() {
        let table = WorkloadTable::new();
        table.insert(record(WorkloadState::Pending)).unwrap();
        assert!(matches!(
            table.insert(record(WorkloadState::Pending)),
            Err(CloudError::AlreadyExists(_))
        ));

        table.tombstone(&id());
        assert!(matches!(
            table.insert(record(WorkloadState::Pending)),
            Err(CloudError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_transition_emits_update() {
        let table = WorkloadTable::new();
        table.insert(record(WorkloadState::Running)).unwrap();

        let update = table
            .transition(&id(), WorkloadState::Stopped, "stop")
            .unwrap()
            .unwrap();
        assert_eq!(update.previous_state, WorkloadState::Running);
        assert_eq!(update.new_state, WorkloadState::Stopped);
        assert_eq!(update.detail, "stop");

        // Same state again is a no-op
        assert!(
            table
                .transition(&id(), WorkloadState::Stopped, "stop")
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_illegal_transition_is_rejected() {
        let table = WorkloadTable::new();
        table.insert(record(WorkloadState::Stopped)).unwrap();
        assert!(matches!(
            table.transition(&id(), WorkloadState::Paused, "pause"),
            Err(CloudError::InvalidTransition { .. })
        ));
        assert_eq!(table.workload(&id()).unwrap().state, WorkloadState::Stopped);
    }

    #[test]
    fn test_observe_transitional_keeps_state() {
        let table = WorkloadTable::new();
        table.insert(record(WorkloadState::Running)).unwrap();
        match table.observe(&id(), Observed::Transitional).unwrap() {
            Observation::Current { workload, update } => {
                assert_eq!(workload.state, WorkloadState::Running);
                assert!(update.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_observe_out_of_band_stop() {
        let table = WorkloadTable::new();
        table.insert(record(WorkloadState::Running)).unwrap();
        match table
            .observe(&id(), Observed::Stable(WorkloadState::Stopped))
            .unwrap()
        {
            Observation::Current { update: Some(u), .. } => {
                assert_eq!(u.new_state, WorkloadState::Stopped);
                assert_eq!(u.detail, OBSERVED_DETAIL);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_observe_gone_tombstones() {
        let table = WorkloadTable::new();
        table.insert(record(WorkloadState::Running)).unwrap();
        match table.observe(&id(), Observed::Gone).unwrap() {
            Observation::Vanished { update: Some(u) } => {
                assert_eq!(u.new_state, WorkloadState::Terminated);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(table.is_tombstone(&id()));
        assert!(matches!(table.workload(&id()), Err(CloudError::NotFound(_))));
        assert!(table.workloads().is_empty());
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let table: WorkloadTable<Vec<String>> = WorkloadTable::new();
        assert!(matches!(
            table.observe(&id(), Observed::Transitional),
            Err(CloudError::NotFound(_))
        ));
    }
}

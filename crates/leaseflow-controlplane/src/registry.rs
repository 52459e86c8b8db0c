//! Lease registry: lease id to (backend, workload id)
//!
//! The only mutable state the dispatcher shares. Every method takes the
//! lock for a lookup, insert or remove and releases it before returning.

use crate::error::{DispatchError, Result};
use leaseflow_cloud::{BackendKind, WorkloadId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LeasePhase {
    /// Deploy in flight; not yet a lease as far as callers are concerned
    Deploying,
    Live,
    /// Terminated or lost on the backend. Kept so late reports still route.
    Retired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseEntry {
    pub lease_id: String,
    pub backend: BackendKind,
    pub workload_id: WorkloadId,
    pub phase: LeasePhase,
}

#[derive(Debug, Default)]
struct Maps {
    leases: HashMap<String, LeaseEntry>,
    by_workload: HashMap<WorkloadId, String>,
}

#[derive(Debug, Default)]
pub struct LeaseRegistry {
    maps: Mutex<Maps>,
}

impl LeaseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a lease id for a deploy about to start
    pub fn reserve(&self, lease_id: &str, backend: BackendKind, workload_id: WorkloadId) -> Result<()> {
        let mut maps = self.lock();
        if maps.leases.contains_key(lease_id) {
            return Err(DispatchError::LeaseExists(lease_id.to_string()));
        }
        if let Some(owner) = maps.by_workload.get(&workload_id) {
            return Err(DispatchError::WorkloadExists {
                workload_id,
                lease_id: owner.clone(),
            });
        }
        maps.by_workload
            .insert(workload_id.clone(), lease_id.to_string());
        maps.leases.insert(
            lease_id.to_string(),
            LeaseEntry {
                lease_id: lease_id.to_string(),
                backend,
                workload_id,
                phase: LeasePhase::Deploying,
            },
        );
        Ok(())
    }

    /// The deploy succeeded
    pub fn commit(&self, lease_id: &str) {
        if let Some(entry) = self.lock().leases.get_mut(lease_id) {
            entry.phase = LeasePhase::Live;
        }
    }

    /// The deploy failed; forget the reservation
    pub fn release(&self, lease_id: &str) {
        let mut maps = self.lock();
        let Some(entry) = maps.leases.remove(lease_id) else {
            return;
        };
        // Only drop the mapping this lease owns
        if maps.by_workload.get(&entry.workload_id).map(String::as_str) == Some(lease_id) {
            maps.by_workload.remove(&entry.workload_id);
        }
    }

    pub fn retire(&self, lease_id: &str) {
        if let Some(entry) = self.lock().leases.get_mut(lease_id) {
            entry.phase = LeasePhase::Retired;
        }
    }

    /// Entry for a deployed lease
    pub fn get(&self, lease_id: &str) -> Option<LeaseEntry> {
        self.lock()
            .leases
            .get(lease_id)
            .filter(|e| e.phase != LeasePhase::Deploying)
            .cloned()
    }

    /// Entry for a lease, in-flight deploys included
    pub fn resolve(&self, lease_id: &str) -> Option<LeaseEntry> {
        self.lock().leases.get(lease_id).cloned()
    }

    /// Lease a workload id belongs to, including in-flight deploys
    pub fn lease_for(&self, workload_id: &str) -> Option<String> {
        self.lock()
            .by_workload
            .get(&WorkloadId::from(workload_id))
            .cloned()
    }

    /// Live leases, ordered by lease id
    pub fn live(&self) -> Vec<LeaseEntry> {
        let mut entries: Vec<_> = self
            .lock()
            .leases
            .values()
            .filter(|e| e.phase == LeasePhase::Live)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.lease_id.cmp(&b.lease_id));
        entries
    }

    fn lock(&self) -> MutexGuard<'_, Maps> {
        self.maps.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(dep: &str) -> WorkloadId {
        WorkloadId::for_deployment(BackendKind::Aws, dep)
    }

    #[test]
    fn test_reservation_lifecycle() {
        let registry = LeaseRegistry::new();
        registry.reserve("l-1", BackendKind::Aws, id("d-1")).unwrap();

        // Routable for reports, invisible to callers
        assert_eq!(registry.lease_for("aws-d-1").as_deref(), Some("l-1"));
        assert!(registry.get("l-1").is_none());
        assert!(registry.live().is_empty());

        registry.commit("l-1");
        assert_eq!(registry.get("l-1").unwrap().phase, LeasePhase::Live);
        assert_eq!(registry.live().len(), 1);

        registry.retire("l-1");
        assert!(registry.live().is_empty());
        assert_eq!(registry.lease_for("aws-d-1").as_deref(), Some("l-1"));
    }

    #[test]
    fn test_duplicate_lease_is_rejected() {
        let registry = LeaseRegistry::new();
        registry.reserve("l-1", BackendKind::Aws, id("d-1")).unwrap();
        assert!(matches!(
            registry.reserve("l-1", BackendKind::Aws, id("d-2")),
            Err(DispatchError::LeaseExists(_))
        ));
    }

    #[test]
    fn test_release_forgets_everything() {
        let registry = LeaseRegistry::new();
        registry.reserve("l-1", BackendKind::Aws, id("d-1")).unwrap();
        registry.release("l-1");
        assert!(registry.lease_for("aws-d-1").is_none());
        registry.reserve("l-1", BackendKind::Aws, id("d-1")).unwrap();
    }

    #[test]
    fn test_workload_stays_with_its_first_lease() {
        let registry = LeaseRegistry::new();
        registry.reserve("l-1", BackendKind::Aws, id("d-1")).unwrap();
        registry.commit("l-1");

        let err = registry
            .reserve("l-2", BackendKind::Aws, id("d-1"))
            .unwrap_err();
        assert!(matches!(err, DispatchError::WorkloadExists { ref lease_id, .. } if lease_id == "l-1"));
        assert!(registry.resolve("l-2").is_none());

        // Releasing the rejected lease must not unmap the live one
        registry.release("l-2");
        assert_eq!(registry.lease_for("aws-d-1").as_deref(), Some("l-1"));
    }

    #[test]
    fn test_resolve_sees_in_flight_deploys() {
        let registry = LeaseRegistry::new();
        registry.reserve("l-1", BackendKind::Aws, id("d-1")).unwrap();
        assert!(registry.get("l-1").is_none());
        assert_eq!(registry.resolve("l-1").unwrap().phase, LeasePhase::Deploying);
    }
}

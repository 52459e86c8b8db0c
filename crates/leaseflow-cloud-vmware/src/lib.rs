//! leaseflow vSphere adapter
//!
//! Runs vm services as clones of named templates. Each clone is tagged
//! with its deployment and recorded by name before its clone task is
//! submitted, so a clone that completes after its wait was abandoned is
//! still found and destroyed.

pub mod adapter;
pub mod client;
pub mod error;
pub mod plan;
pub mod resources;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use adapter::{VsphereAdapter, translate};
pub use client::{
    DiskSpec, HardwareSpec, InventoryClient, Placement, PlacementSpec, TaskClient, TaskHandle,
    TaskState, VmClient, VmPowerState, VsphereClients,
};
pub use plan::VspherePlan;
pub use resources::VsphereResources;

//! leaseflow Azure adapter
//!
//! Runs vm services as Azure VMs. A deployment owns a resource group
//! `lf-<deployment>` unless a default group is configured, in which case
//! its resources are created in and removed from that group one by one.

pub mod adapter;
pub mod client;
pub mod error;
pub mod plan;
pub mod resources;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use adapter::{AzureAdapter, translate};
pub use client::{
    AzureClients, ComputeClient, ImageReference, InstanceView, NetworkClient, PowerState,
    ProvisioningState, ResourceGroupClient, StorageClient,
};
pub use plan::AzurePlan;
pub use resources::AzureResources;

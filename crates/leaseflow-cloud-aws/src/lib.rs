//! leaseflow AWS adapter
//!
//! Runs vm services on EC2. Each deployment gets its own VPC (unless one
//! is configured), a security group, EBS volumes and optionally Elastic
//! IPs, all tagged with the deployment and lease ids.

pub mod adapter;
pub mod client;
pub mod error;
pub mod plan;
pub mod resources;
#[cfg(feature = "sdk")]
pub mod sdk;
#[cfg(any(test, feature = "test-utils"))]
pub mod testing;

pub use adapter::{AwsAdapter, translate};
pub use client::{
    ComputeClient, Ec2Clients, InstanceInfo, InstanceState, NetworkClient, StorageClient,
};
pub use plan::AwsPlan;
pub use resources::AwsResources;
#[cfg(feature = "sdk")]
pub use sdk::Ec2Sdk;

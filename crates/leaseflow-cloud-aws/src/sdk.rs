//! EC2 client backed by aws-sdk-ec2

use crate::client::{
    Address, ComputeClient, IngressRule, InstanceInfo, InstanceRequest, InstanceState,
    NetworkClient, StorageClient, Tags, VolumeState,
};
use crate::error::from_code;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::Client;
use aws_sdk_ec2::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_ec2::types::{
    DomainType, Filter, InstanceType, IpPermission, IpRange, ResourceType, Tag,
    TagSpecification, VolumeType,
};
use leaseflow_cloud::{BackendError, BackendErrorKind, BackendResult};

/// EC2 API client for one region
#[derive(Debug, Clone)]
pub struct Ec2Sdk {
    client: Client,
}

impl Ec2Sdk {
    /// Credentials come from the default provider chain
    pub async fn from_env(region: &str) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .load()
            .await;
        Self {
            client: Client::new(&config),
        }
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

fn sdk_error<E, R>(err: SdkError<E, R>) -> BackendError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            BackendError::transient(err.to_string())
        }
        _ => match err.code() {
            Some(code) => from_code(code, err.message().unwrap_or_default()),
            None => BackendError::new(BackendErrorKind::Other, err.to_string()),
        },
    }
}

fn missing(what: &str) -> BackendError {
    BackendError::new(BackendErrorKind::Other, format!("response had no {}", what))
}

fn tag_spec(resource: ResourceType, tags: &Tags) -> TagSpecification {
    TagSpecification::builder()
        .resource_type(resource)
        .set_tags(Some(
            tags.iter()
                .map(|(k, v)| Tag::builder().key(k).value(v).build())
                .collect(),
        ))
        .build()
}

#[async_trait]
impl NetworkClient for Ec2Sdk {
    async fn create_vpc(&self, cidr: &str, tags: &Tags) -> BackendResult<String> {
        let out = self
            .client
            .create_vpc()
            .cidr_block(cidr)
            .tag_specifications(tag_spec(ResourceType::Vpc, tags))
            .send()
            .await
            .map_err(sdk_error)?;
        out.vpc()
            .and_then(|v| v.vpc_id())
            .map(str::to_string)
            .ok_or_else(|| missing("vpc id"))
    }

    async fn delete_vpc(&self, vpc_id: &str) -> BackendResult<()> {
        self.client
            .delete_vpc()
            .vpc_id(vpc_id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn create_subnet(
        &self,
        vpc_id: &str,
        cidr: &str,
        availability_zone: &str,
        tags: &Tags,
    ) -> BackendResult<String> {
        let out = self
            .client
            .create_subnet()
            .vpc_id(vpc_id)
            .cidr_block(cidr)
            .availability_zone(availability_zone)
            .tag_specifications(tag_spec(ResourceType::Subnet, tags))
            .send()
            .await
            .map_err(sdk_error)?;
        out.subnet()
            .and_then(|s| s.subnet_id())
            .map(str::to_string)
            .ok_or_else(|| missing("subnet id"))
    }

    async fn delete_subnet(&self, subnet_id: &str) -> BackendResult<()> {
        self.client
            .delete_subnet()
            .subnet_id(subnet_id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn create_security_group(
        &self,
        vpc_id: &str,
        name: &str,
        tags: &Tags,
    ) -> BackendResult<String> {
        let out = self
            .client
            .create_security_group()
            .group_name(name)
            .description("leaseflow deployment")
            .vpc_id(vpc_id)
            .tag_specifications(tag_spec(ResourceType::SecurityGroup, tags))
            .send()
            .await
            .map_err(sdk_error)?;
        out.group_id()
            .map(str::to_string)
            .ok_or_else(|| missing("group id"))
    }

    async fn authorize_ingress(&self, group_id: &str, rules: &[IngressRule]) -> BackendResult<()> {
        let permissions = rules
            .iter()
            .map(|rule| {
                IpPermission::builder()
                    .ip_protocol(&rule.protocol)
                    .from_port(i32::from(rule.port))
                    .to_port(i32::from(rule.port))
                    .ip_ranges(IpRange::builder().cidr_ip(&rule.cidr).build())
                    .build()
            })
            .collect();
        self.client
            .authorize_security_group_ingress()
            .group_id(group_id)
            .set_ip_permissions(Some(permissions))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn delete_security_group(&self, group_id: &str) -> BackendResult<()> {
        self.client
            .delete_security_group()
            .group_id(group_id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn allocate_address(&self, tags: &Tags) -> BackendResult<Address> {
        let out = self
            .client
            .allocate_address()
            .domain(DomainType::Vpc)
            .tag_specifications(tag_spec(ResourceType::ElasticIp, tags))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(Address {
            allocation_id: out
                .allocation_id()
                .ok_or_else(|| missing("allocation id"))?
                .to_string(),
            public_ip: out
                .public_ip()
                .ok_or_else(|| missing("public ip"))?
                .to_string(),
        })
    }

    async fn associate_address(
        &self,
        allocation_id: &str,
        instance_id: &str,
    ) -> BackendResult<String> {
        let out = self
            .client
            .associate_address()
            .allocation_id(allocation_id)
            .instance_id(instance_id)
            .send()
            .await
            .map_err(sdk_error)?;
        out.association_id()
            .map(str::to_string)
            .ok_or_else(|| missing("association id"))
    }

    async fn disassociate_address(&self, association_id: &str) -> BackendResult<()> {
        self.client
            .disassociate_address()
            .association_id(association_id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn release_address(&self, allocation_id: &str) -> BackendResult<()> {
        self.client
            .release_address()
            .allocation_id(allocation_id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }
}

#[async_trait]
impl StorageClient for Ec2Sdk {
    async fn create_volume(
        &self,
        size_gib: u32,
        availability_zone: &str,
        tags: &Tags,
    ) -> BackendResult<String> {
        let out = self
            .client
            .create_volume()
            .size(i32::try_from(size_gib).unwrap_or(i32::MAX))
            .availability_zone(availability_zone)
            .volume_type(VolumeType::Gp3)
            .tag_specifications(tag_spec(ResourceType::Volume, tags))
            .send()
            .await
            .map_err(sdk_error)?;
        out.volume_id()
            .map(str::to_string)
            .ok_or_else(|| missing("volume id"))
    }

    async fn volume_state(&self, volume_id: &str) -> BackendResult<VolumeState> {
        let out = self
            .client
            .describe_volumes()
            .volume_ids(volume_id)
            .send()
            .await
            .map_err(sdk_error)?;
        let volume = out
            .volumes()
            .first()
            .ok_or_else(|| from_code("InvalidVolume.NotFound", volume_id))?;
        volume
            .state()
            .and_then(|s| VolumeState::parse(s.as_str()))
            .ok_or_else(|| missing("volume state"))
    }

    async fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> BackendResult<()> {
        self.client
            .attach_volume()
            .volume_id(volume_id)
            .instance_id(instance_id)
            .device(device)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn detach_volume(&self, volume_id: &str) -> BackendResult<()> {
        self.client
            .detach_volume()
            .volume_id(volume_id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn delete_volume(&self, volume_id: &str) -> BackendResult<()> {
        self.client
            .delete_volume()
            .volume_id(volume_id)
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }
}

#[async_trait]
impl ComputeClient for Ec2Sdk {
    async fn run_instance(&self, request: &InstanceRequest) -> BackendResult<String> {
        let out = self
            .client
            .run_instances()
            .image_id(&request.image_id)
            .instance_type(InstanceType::from(request.instance_type.as_str()))
            .min_count(1)
            .max_count(1)
            .subnet_id(&request.subnet_id)
            .set_security_group_ids(Some(request.security_group_ids.clone()))
            .set_key_name(request.key_name.clone())
            .tag_specifications(tag_spec(ResourceType::Instance, &request.tags))
            .send()
            .await
            .map_err(sdk_error)?;
        out.instances()
            .first()
            .and_then(|i| i.instance_id())
            .map(str::to_string)
            .ok_or_else(|| missing("instance id"))
    }

    async fn describe_instance(&self, instance_id: &str) -> BackendResult<InstanceInfo> {
        let out = self
            .client
            .describe_instances()
            .instance_ids(instance_id)
            .send()
            .await
            .map_err(sdk_error)?;
        let instance = out
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .next()
            .ok_or_else(|| from_code("InvalidInstanceID.NotFound", instance_id))?;
        let state = instance
            .state()
            .and_then(|s| s.name())
            .and_then(|n| InstanceState::parse(n.as_str()))
            .ok_or_else(|| missing("instance state"))?;
        Ok(InstanceInfo {
            instance_id: instance_id.to_string(),
            state,
            private_ip: instance.private_ip_address().map(str::to_string),
            public_ip: instance.public_ip_address().map(str::to_string),
        })
    }

    async fn find_instance(&self, name: &str) -> BackendResult<Option<String>> {
        let live = ["pending", "running", "stopping", "stopped"];
        let out = self
            .client
            .describe_instances()
            .filters(Filter::builder().name("tag:Name").values(name).build())
            .filters(
                Filter::builder()
                    .name("instance-state-name")
                    .set_values(Some(live.iter().map(|s| s.to_string()).collect()))
                    .build(),
            )
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(out
            .reservations()
            .iter()
            .flat_map(|r| r.instances())
            .find_map(|i| i.instance_id().map(str::to_string)))
    }

    async fn start_instances(&self, instance_ids: &[String]) -> BackendResult<()> {
        self.client
            .start_instances()
            .set_instance_ids(Some(instance_ids.to_vec()))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn stop_instances(&self, instance_ids: &[String]) -> BackendResult<()> {
        self.client
            .stop_instances()
            .set_instance_ids(Some(instance_ids.to_vec()))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> BackendResult<()> {
        self.client
            .terminate_instances()
            .set_instance_ids(Some(instance_ids.to_vec()))
            .send()
            .await
            .map_err(sdk_error)?;
        Ok(())
    }
}

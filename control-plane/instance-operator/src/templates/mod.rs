//! Child resource naming, labels and manifests.
//!
//! Every name produced here is a pure function of the instance name and the
//! channel type; external tooling depends on the exact templates.

pub mod channel;
pub mod memory;

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

use crate::crd::instance::ChannelType;

pub use channel::*;
pub use memory::*;

pub const LABEL_COMPONENT: &str = "component";
pub const LABEL_CHANNEL: &str = "channel";
pub const LABEL_INSTANCE: &str = "instance";

pub const COMPONENT_CHANNEL: &str = "channel";
pub const COMPONENT_MEMORY: &str = "memory";

pub fn channel_workload_name(instance: &str, channel: ChannelType) -> String {
    format!("{}-channel-{}", instance, channel.as_str())
}

pub fn credential_store_name(instance: &str, channel: ChannelType) -> String {
    format!("{}-data", channel_workload_name(instance, channel))
}

pub fn memory_store_name(instance: &str) -> String {
    format!("{}-memory", instance)
}

pub fn channel_labels(
    instance: &str,
    channel: ChannelType,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_COMPONENT.to_string(), COMPONENT_CHANNEL.to_string()),
        (LABEL_CHANNEL.to_string(), channel.as_str().to_string()),
        (LABEL_INSTANCE.to_string(), instance.to_string()),
    ])
}

pub fn memory_labels(instance: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_COMPONENT.to_string(), COMPONENT_MEMORY.to_string()),
        (LABEL_INSTANCE.to_string(), instance.to_string()),
    ])
}

/// Label selector matching every child of `instance` with the given role.
pub fn component_selector(instance: &str, component: &str) -> String {
    format!(
        "{}={},{}={}",
        LABEL_COMPONENT, component, LABEL_INSTANCE, instance
    )
}

pub fn instance_selector(instance: &str) -> String {
    format!("{}={}", LABEL_INSTANCE, instance)
}

/// Identity of the owning Instance, stamped on every child at creation.
#[derive(Clone, Debug)]
pub struct Owner<'a> {
    pub name: &'a str,
    pub namespace: &'a str,
    pub uid: &'a str,
}

impl Owner<'_> {
    pub fn owner_references(&self) -> Option<Vec<OwnerReference>> {
        Some(vec![OwnerReference {
            api_version: crate::crd::API_VERSION.to_string(),
            kind: "Instance".to_string(),
            name: self.name.to_string(),
            uid: self.uid.to_string(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }])
    }
}

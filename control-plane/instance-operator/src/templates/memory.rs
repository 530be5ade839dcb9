use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::{Owner, memory_labels, memory_store_name};

pub const MEMORY_KEY: &str = "MEMORY.md";
pub const MEMORY_SEED: &str = "# Memory\n\nLong-term notes for this instance.\n";

/// Seed memory store. Only ever created; the content belongs to the agent after that.
pub fn render_memory_store(owner: &Owner<'_>) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(memory_store_name(owner.name)),
            namespace: Some(owner.namespace.to_string()),
            labels: Some(memory_labels(owner.name)),
            owner_references: owner.owner_references(),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            MEMORY_KEY.to_string(),
            MEMORY_SEED.to_string(),
        )])),
        ..Default::default()
    }
}

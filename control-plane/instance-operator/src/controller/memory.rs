use kube::Resource;
use kube::runtime::events::EventType;
use tracing::{debug, info, warn};

use super::events::{EventPublisher, REASON_MEMORY_CREATED};
use crate::crd::instance::Instance;
use crate::store::{ResourceStore, StoreError};
use crate::templates::{Owner, memory_store_name, render_memory_store};

/// Create the memory store once when enabled. An existing store is never
/// touched, and every failure is logged and swallowed.
pub async fn converge_memory(
    store: &dyn ResourceStore,
    events: &dyn EventPublisher,
    instance: &Instance,
    owner: &Owner<'_>,
) {
    if !instance.memory_enabled() {
        return;
    }
    match ensure_memory_store(store, owner).await {
        Ok(true) => {
            events
                .publish(
                    &instance.object_ref(&()),
                    EventType::Normal,
                    REASON_MEMORY_CREATED,
                    "Create",
                    Some(format!("Created {}", memory_store_name(owner.name))),
                )
                .await;
        }
        Ok(false) => {}
        Err(e) => {
            warn!(ns = %owner.namespace, name = %owner.name, error = %e, "memory store convergence failed; continuing");
        }
    }
}

async fn ensure_memory_store(
    store: &dyn ResourceStore,
    owner: &Owner<'_>,
) -> Result<bool, StoreError> {
    let cm_name = memory_store_name(owner.name);
    if store.get_config_map(owner.namespace, &cm_name).await?.is_some() {
        debug!(store = %cm_name, "memory store present; leaving content untouched");
        return Ok(false);
    }
    match store
        .create_config_map(owner.namespace, &render_memory_store(owner))
        .await
    {
        Ok(_) => {
            info!(store = %cm_name, "created memory store");
            Ok(true)
        }
        Err(StoreError::AlreadyExists(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

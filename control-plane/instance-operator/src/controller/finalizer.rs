//! Deletion guard for Instances.
//!
//! The marker is added before any child is created and removed only after
//! every channel workload labeled for the instance is gone. Persistent stores
//! (memory, credentials) are deleted best-effort and never hold teardown back.

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::ReconcileErr;
use super::events::{EventPublisher, REASON_CLEANUP_COMPLETE};
use crate::config::RequeueConfig;
use crate::crd::instance::Instance;
use crate::store::{IgnoreNotFound, ResourceStore};
use crate::templates::{COMPONENT_CHANNEL, component_selector, memory_store_name};

pub const FINALIZER: &str = "agents.dev/instance-cleanup";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerState {
    NoFinalizer,
    Present,
    Cleaning,
    Removed,
}

impl FinalizerState {
    pub fn observe(instance: &Instance) -> Self {
        match (instance.is_deleting(), instance.has_finalizer(FINALIZER)) {
            (false, false) => FinalizerState::NoFinalizer,
            (false, true) => FinalizerState::Present,
            (true, true) => FinalizerState::Cleaning,
            (true, false) => FinalizerState::Removed,
        }
    }
}

/// Add the marker with a resourceVersion-guarded merge patch.
#[instrument(skip_all, fields(name = %instance.name_any()))]
pub async fn add_finalizer(
    store: &dyn ResourceStore,
    ns: &str,
    instance: &Instance,
) -> Result<(), ReconcileErr> {
    let mut finals = instance.finalizers().to_vec();
    finals.push(FINALIZER.to_string());
    info!("adding finalizer");
    store
        .patch_instance_finalizers(
            ns,
            &instance.name_any(),
            instance.meta().resource_version.as_deref(),
            finals,
        )
        .await?;
    Ok(())
}

/// Teardown path for an Instance carrying a deletion timestamp.
#[instrument(skip_all, fields(name = %instance.name_any()))]
pub async fn cleanup(
    store: &dyn ResourceStore,
    events: &dyn EventPublisher,
    requeue: &RequeueConfig,
    ns: &str,
    instance: &Instance,
    cancel: &CancellationToken,
) -> Result<Action, ReconcileErr> {
    let name = instance.name_any();
    let selector = component_selector(&name, COMPONENT_CHANNEL);

    let workloads = store.list_deployments(ns, &selector).await?;
    info!(count = workloads.len(), "cleanup: deleting channel workloads");
    for dep in &workloads {
        if cancel.is_cancelled() {
            return Err(ReconcileErr::Cancelled);
        }
        let dep_name = dep.name_any();
        store
            .delete_deployment(ns, &dep_name)
            .await
            .ignore_not_found()?;
        debug!(workload = %dep_name, "cleanup: workload deleted");
    }

    let remaining = store.list_deployments(ns, &selector).await?;
    if !remaining.is_empty() {
        info!(
            count = remaining.len(),
            "cleanup: workloads still present; keeping finalizer"
        );
        return Ok(Action::requeue(requeue.on_error()));
    }

    delete_credential_stores(store, ns, &selector).await;

    if let Err(e) = store
        .delete_config_map(ns, &memory_store_name(&name))
        .await
        .ignore_not_found()
    {
        warn!(error = %e, "cleanup: memory store deletion failed; continuing");
    }

    if !instance.has_finalizer(FINALIZER) {
        debug!("cleanup: finalizer already absent");
        return Ok(Action::await_change());
    }
    if cancel.is_cancelled() {
        return Err(ReconcileErr::Cancelled);
    }

    events
        .publish(
            &instance.object_ref(&()),
            EventType::Normal,
            REASON_CLEANUP_COMPLETE,
            "Delete",
            Some(format!("Deleted {} channel workload(s)", workloads.len())),
        )
        .await;

    let finals: Vec<String> = instance
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect();
    info!("cleanup: removing finalizer");
    store
        .patch_instance_finalizers(
            ns,
            &name,
            instance.meta().resource_version.as_deref(),
            finals,
        )
        .await
        .ignore_not_found()?;
    Ok(Action::await_change())
}

async fn delete_credential_stores(
    store: &dyn ResourceStore,
    ns: &str,
    selector: &str,
) {
    let pvcs = match store.list_pvcs(ns, selector).await {
        Ok(list) => list,
        Err(e) => {
            warn!(error = %e, "cleanup: listing credential stores failed; continuing");
            return;
        }
    };
    for pvc in pvcs {
        let pvc_name = pvc.name_any();
        if let Err(e) = store.delete_pvc(ns, &pvc_name).await.ignore_not_found() {
            warn!(store = %pvc_name, error = %e, "cleanup: credential store deletion failed; continuing");
        }
    }
}

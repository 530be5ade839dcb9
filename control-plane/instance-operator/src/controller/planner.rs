use kube::Resource;
use kube::runtime::events::EventType;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use super::ReconcileErr;
use super::events::{
    EventPublisher, REASON_CHANNEL_CREATED, REASON_CREDENTIALS_CREATED,
};
use crate::config::ChannelConfig;
use crate::crd::instance::{
    ChannelConnectivity, ChannelSpec, ChannelStatus, Instance,
};
use crate::store::{ResourceStore, StoreError};
use crate::templates::{
    Owner, channel_workload_name, credential_store_name, ready_replicas,
    render_channel_deployment, render_credential_store,
};

/// Converges each declared channel in order and reports its connectivity.
///
/// The first failing channel aborts the pass. Channels converged before it
/// are found again on the next pass and skipped, so retries complete the set.
#[instrument(skip_all, fields(ns = %owner.namespace, name = %owner.name))]
pub async fn plan_channels(
    store: &dyn ResourceStore,
    events: &dyn EventPublisher,
    cfg: &ChannelConfig,
    instance: &Instance,
    owner: &Owner<'_>,
    cancel: &CancellationToken,
) -> Result<Vec<ChannelStatus>, ReconcileErr> {
    let mut statuses = Vec::with_capacity(instance.spec.channels.len());
    for channel in &instance.spec.channels {
        if cancel.is_cancelled() {
            return Err(ReconcileErr::Cancelled);
        }
        let status = converge_channel(store, events, cfg, instance, owner, channel)
            .await
            .map_err(|source| ReconcileErr::Channel {
                channel: channel.type_,
                source,
            })?;
        statuses.push(ChannelStatus::new(channel.type_, status));
    }
    Ok(statuses)
}

async fn converge_channel(
    store: &dyn ResourceStore,
    events: &dyn EventPublisher,
    cfg: &ChannelConfig,
    instance: &Instance,
    owner: &Owner<'_>,
    channel: &ChannelSpec,
) -> Result<ChannelConnectivity, StoreError> {
    let ns = owner.namespace;
    let workload = channel_workload_name(owner.name, channel.type_);

    if channel.type_.requires_credential_store() {
        let pvc_name = credential_store_name(owner.name, channel.type_);
        if store.get_pvc(ns, &pvc_name).await?.is_none() {
            let pvc = render_credential_store(owner, channel, cfg);
            match store.create_pvc(ns, &pvc).await {
                Ok(_) => {
                    info!(store = %pvc_name, "created credential store");
                    events
                        .publish(
                            &instance.object_ref(&()),
                            EventType::Normal,
                            REASON_CREDENTIALS_CREATED,
                            "Create",
                            Some(format!("Created credential store {pvc_name}")),
                        )
                        .await;
                }
                Err(StoreError::AlreadyExists(_)) => {
                    debug!(store = %pvc_name, "credential store appeared concurrently");
                }
                Err(e) => return Err(e),
            }
        }
    }

    match store.get_deployment(ns, &workload).await? {
        Some(dep) => {
            let ready = ready_replicas(&dep);
            debug!(%workload, ready, "channel workload observed");
            Ok(if ready >= 1 {
                ChannelConnectivity::Connected
            } else {
                ChannelConnectivity::Disconnected
            })
        }
        None => {
            let dep = render_channel_deployment(owner, channel, cfg);
            match store.create_deployment(ns, &dep).await {
                Ok(_) => {
                    info!(%workload, channel = %channel.type_, "created channel workload");
                    events
                        .publish(
                            &instance.object_ref(&()),
                            EventType::Normal,
                            REASON_CHANNEL_CREATED,
                            "Create",
                            Some(format!("Created workload {workload}")),
                        )
                        .await;
                }
                Err(StoreError::AlreadyExists(_)) => {
                    debug!(%workload, "channel workload appeared concurrently");
                }
                Err(e) => return Err(e),
            }
            Ok(ChannelConnectivity::Pending)
        }
    }
}

pub mod events;
pub mod finalizer;
pub mod memory;
pub mod planner;
pub mod reconcile;
pub mod status;

use std::sync::Arc;

use futures_util::{FutureExt, StreamExt};
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    Client, ResourceExt,
    api::Api,
    runtime::{
        Controller, controller::Action, reflector::ObjectRef, watcher::Config,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::OperatorConfig;
use crate::crd::instance::{ChannelType, Instance};
use crate::crd::run::Run;
use crate::store::{KubeStore, StoreError};
use crate::templates::{COMPONENT_CHANNEL, LABEL_COMPONENT, LABEL_INSTANCE};

pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
pub use finalizer::{FINALIZER, FinalizerState};
pub use reconcile::InstanceReconciler;

#[derive(thiserror::Error, Debug)]
pub enum ReconcileErr {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("channel {channel} failed to converge: {source}")]
    Channel {
        channel: ChannelType,
        #[source]
        source: StoreError,
    },
    #[error("reconcile cancelled")]
    Cancelled,
    /// A broken assumption rather than a cluster condition; retrying will not help.
    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl ReconcileErr {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ReconcileErr::Invariant(_))
    }
}

#[derive(Clone)]
pub struct ControllerContext {
    pub reconciler: Arc<InstanceReconciler>,
    pub shutdown: CancellationToken,
}

fn apis<K>(client: &Client, ns: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    K::DynamicType: Default,
{
    match ns {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

pub async fn run_controller(
    client: Client,
    cfg: OperatorConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let ns = cfg.watch_namespace().map(str::to_string);
    let instances: Api<Instance> = apis(&client, ns.as_deref());
    let deployments: Api<Deployment> = apis(&client, ns.as_deref());
    let runs: Api<Run> = apis(&client, ns.as_deref());

    let store = Arc::new(KubeStore::new(client.clone(), &cfg.field_manager));
    let events =
        Arc::new(KubeEventPublisher::new(client.clone(), &cfg.field_manager));
    // In-flight passes see the same token through their child tokens and
    // stop at the next mutating step while the controller drains.
    let trigger = shutdown.clone().cancelled_owned().shared();
    let ctx = Arc::new(ControllerContext {
        reconciler: Arc::new(InstanceReconciler::new(store, events, cfg)),
        shutdown,
    });

    info!(namespace = ?ns, "starting instance controller");
    Controller::new(instances, Config::default())
        .owns(
            deployments,
            Config::default()
                .labels(&format!("{}={}", LABEL_COMPONENT, COMPONENT_CHANNEL)),
        )
        .watches(runs, Config::default(), |run: Run| {
            let ns = run.namespace()?;
            run.labels()
                .get(LABEL_INSTANCE)
                .map(|inst| ObjectRef::<Instance>::new(inst).within(&ns))
        })
        .graceful_shutdown_on(trigger)
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj_ref, action)) => {
                    debug!(%obj_ref, ?action, "reconciled")
                }
                Err(e) => warn!(error = %e, "reconcile error"),
            }
        })
        .await;

    info!("instance controller stopped");
    Ok(())
}

async fn reconcile(
    obj: Arc<Instance>,
    ctx: Arc<ControllerContext>,
) -> Result<Action, ReconcileErr> {
    let ns = obj.namespace().ok_or_else(|| {
        ReconcileErr::Invariant(format!(
            "Instance {} has no namespace",
            obj.name_any()
        ))
    })?;
    let cancel = ctx.shutdown.child_token();
    ctx.reconciler.reconcile(&ns, &obj.name_any(), &cancel).await
}

fn error_policy(
    obj: Arc<Instance>,
    err: &ReconcileErr,
    ctx: Arc<ControllerContext>,
) -> Action {
    if err.is_retryable() {
        warn!(name = %obj.name_any(), error = %err, "reconcile failed; retrying");
    } else {
        error!(name = %obj.name_any(), error = %err, fault = true, "invariant violated; not requeueing");
    }
    ctx.reconciler.error_action(err)
}

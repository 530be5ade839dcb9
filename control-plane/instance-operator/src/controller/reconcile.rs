use std::sync::Arc;

use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::ReconcileErr;
use super::events::{EventPublisher, REASON_CONVERGE_FAILED};
use super::finalizer::{self, FinalizerState};
use super::memory::converge_memory;
use super::planner::plan_channels;
use super::status::{count_active_runs, status_patch};
use crate::config::OperatorConfig;
use crate::crd::instance::{Instance, InstancePhase, InstanceStatus};
use crate::store::ResourceStore;
use crate::templates::Owner;

/// Drives one Instance toward its declared state.
///
/// Holds no per-instance state: every decision is derived from what the
/// store returns during the pass. The caller guarantees at most one
/// concurrent pass per key.
pub struct InstanceReconciler {
    store: Arc<dyn ResourceStore>,
    events: Arc<dyn EventPublisher>,
    cfg: OperatorConfig,
}

impl InstanceReconciler {
    pub fn new(
        store: Arc<dyn ResourceStore>,
        events: Arc<dyn EventPublisher>,
        cfg: OperatorConfig,
    ) -> Self {
        Self { store, events, cfg }
    }

    #[instrument(skip(self, cancel))]
    pub async fn reconcile(
        &self,
        ns: &str,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Action, ReconcileErr> {
        let store = self.store.as_ref();
        let Some(mut instance) = store.get_instance(ns, name).await? else {
            debug!("instance not found; nothing to do");
            return Ok(Action::await_change());
        };

        match FinalizerState::observe(&instance) {
            FinalizerState::Cleaning | FinalizerState::Removed => {
                info!("deletion requested; running cleanup");
                return self.cleanup(ns, &instance, cancel).await;
            }
            FinalizerState::NoFinalizer => {
                if cancel.is_cancelled() {
                    return Err(ReconcileErr::Cancelled);
                }
                finalizer::add_finalizer(store, ns, &instance).await?;
                instance = match store.get_instance(ns, name).await? {
                    Some(fresh) => fresh,
                    None => return Ok(Action::await_change()),
                };
                if instance.is_deleting() {
                    return self.cleanup(ns, &instance, cancel).await;
                }
            }
            FinalizerState::Present => {}
        }

        self.converge(ns, &instance, cancel).await
    }

    async fn cleanup(
        &self,
        ns: &str,
        instance: &Instance,
        cancel: &CancellationToken,
    ) -> Result<Action, ReconcileErr> {
        finalizer::cleanup(
            self.store.as_ref(),
            self.events.as_ref(),
            &self.cfg.requeue,
            ns,
            instance,
            cancel,
        )
        .await
    }

    async fn converge(
        &self,
        ns: &str,
        snapshot: &Instance,
        cancel: &CancellationToken,
    ) -> Result<Action, ReconcileErr> {
        let store = self.store.as_ref();
        let name = snapshot.name_any();
        let uid = snapshot.meta().uid.as_deref().ok_or_else(|| {
            ReconcileErr::Invariant(format!("Instance {ns}/{name} has no uid"))
        })?;
        let owner = Owner {
            name: &name,
            namespace: ns,
            uid,
        };

        let channels = match plan_channels(
            store,
            self.events.as_ref(),
            &self.cfg.channels,
            snapshot,
            &owner,
            cancel,
        )
        .await
        {
            Ok(channels) => channels,
            Err(ReconcileErr::Cancelled) => return Err(ReconcileErr::Cancelled),
            Err(e) => {
                warn!(error = %e, "channel convergence failed");
                self.mark_error(ns, snapshot, &e).await;
                return Err(e);
            }
        };

        if cancel.is_cancelled() {
            return Err(ReconcileErr::Cancelled);
        }
        converge_memory(store, self.events.as_ref(), snapshot, &owner).await;

        let active_runs = count_active_runs(store, ns, &name).await?;
        let desired = InstanceStatus {
            phase: InstancePhase::Running,
            channels,
            active_runs,
        };
        if cancel.is_cancelled() {
            return Err(ReconcileErr::Cancelled);
        }
        match status_patch(snapshot.status.as_ref(), &desired)? {
            Some(patch) => {
                debug!(%patch, "status changed; patching");
                store
                    .patch_instance_status(
                        ns,
                        &name,
                        snapshot.meta().resource_version.as_deref(),
                        &patch,
                    )
                    .await?;
            }
            None => debug!("status unchanged; skipping patch"),
        }

        Ok(Action::requeue(self.cfg.requeue.steady()))
    }

    /// Flip phase to Error against the pre-convergence snapshot. A failed
    /// write is logged; the convergence error is what the caller sees.
    async fn mark_error(&self, ns: &str, snapshot: &Instance, cause: &ReconcileErr) {
        let mut working = snapshot.status.clone().unwrap_or_default();
        working.phase = InstancePhase::Error;
        let patch = match status_patch(snapshot.status.as_ref(), &working) {
            Ok(Some(patch)) => patch,
            Ok(None) => return,
            Err(e) => {
                error!(error = %e, "could not build error status");
                return;
            }
        };
        if let Err(e) = self
            .store
            .patch_instance_status(
                ns,
                &snapshot.name_any(),
                snapshot.meta().resource_version.as_deref(),
                &patch,
            )
            .await
        {
            warn!(error = %e, "failed to record Error phase");
        }
        self.events
            .publish(
                &snapshot.object_ref(&()),
                EventType::Warning,
                REASON_CONVERGE_FAILED,
                "Reconcile",
                Some(cause.to_string()),
            )
            .await;
    }

    /// Requeue directive for a failed pass.
    pub fn error_action(&self, err: &ReconcileErr) -> Action {
        if err.is_retryable() {
            Action::requeue(self.cfg.requeue.on_error())
        } else {
            Action::await_change()
        }
    }
}

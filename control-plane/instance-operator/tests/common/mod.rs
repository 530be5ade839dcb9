#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use instance_operator::config::OperatorConfig;
use instance_operator::controller::{
    InstanceReconciler, NoopEventPublisher, ReconcileErr,
};
use instance_operator::crd::instance::{
    ChannelSpec, ChannelType, Instance, InstanceSpec, InstanceStatus,
    MemoryConfig,
};
use instance_operator::crd::run::{Run, RunPhase, RunSpec};
use instance_operator::store::{MemoryStore, StoreOp, Verb};
use instance_operator::templates::{
    COMPONENT_CHANNEL, LABEL_COMPONENT, LABEL_INSTANCE,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::controller::Action;
use tokio_util::sync::CancellationToken;

pub const NS: &str = "tenant-a";

/// Reconciler wired to an in-process store.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub reconciler: InstanceReconciler,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let reconciler = InstanceReconciler::new(
            store.clone(),
            Arc::new(NoopEventPublisher),
            OperatorConfig::default(),
        );
        Self { store, reconciler }
    }

    pub fn create(&self, name: &str, spec: InstanceSpec) -> Instance {
        let mut inst = Instance::new(name, spec);
        inst.metadata.namespace = Some(NS.to_string());
        self.store.insert_instance(inst)
    }

    pub async fn reconcile(&self, name: &str) -> Result<Action, ReconcileErr> {
        self.reconcile_with(name, &CancellationToken::new()).await
    }

    pub async fn reconcile_with(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Action, ReconcileErr> {
        self.reconciler.reconcile(NS, name, cancel).await
    }

    pub async fn reconcile_n(&self, name: &str, n: usize) {
        for i in 0..n {
            if let Err(e) = self.reconcile(name).await {
                panic!("pass {i} failed: {e}");
            }
        }
    }

    pub fn status(&self, name: &str) -> InstanceStatus {
        self.store
            .instance(NS, name)
            .and_then(|i| i.status)
            .unwrap_or_else(|| panic!("instance {name} has no status"))
    }

    /// Journal entries for one verb and kind.
    pub fn ops(&self, verb: Verb, kind: &str) -> Vec<StoreOp> {
        self.store
            .journal()
            .into_iter()
            .filter(|op| op.verb == verb && op.kind == kind)
            .collect()
    }

    /// Position of the first journal entry matching verb, kind and name.
    pub fn position(&self, verb: Verb, kind: &str, name: &str) -> Option<usize> {
        self.store
            .journal()
            .iter()
            .position(|op| op.verb == verb && op.kind == kind && op.name == name)
    }
}

pub fn spec(channels: &[ChannelType], memory: bool) -> InstanceSpec {
    InstanceSpec {
        channels: channels
            .iter()
            .map(|c| ChannelSpec {
                type_: *c,
                config_secret_ref: None,
            })
            .collect(),
        memory: memory.then(|| MemoryConfig { enabled: true }),
        ..Default::default()
    }
}

pub fn run(name: &str, instance: &str, phase: RunPhase) -> Run {
    let mut run = Run::new(
        name,
        RunSpec {
            instance: instance.to_string(),
            prompt: None,
        },
    );
    run.metadata.labels = Some(BTreeMap::from([(
        LABEL_INSTANCE.to_string(),
        instance.to_string(),
    )]));
    run.status = Some(instance_operator::crd::run::RunStatus {
        phase: Some(phase),
    });
    run
}

/// A channel workload created outside the current spec, e.g. left behind
/// after a channel was removed.
pub fn stray_workload(name: &str, instance: &str) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([
                (LABEL_COMPONENT.to_string(), COMPONENT_CHANNEL.to_string()),
                (LABEL_INSTANCE.to_string(), instance.to_string()),
            ])),
            ..Default::default()
        },
        ..Default::default()
    }
}

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tracing::trace;

use super::{
    KIND_CONFIG_MAP, KIND_DEPLOYMENT, KIND_INSTANCE, KIND_PVC, KIND_RUN,
    ResourceStore, StoreError, parse_selector,
};
use crate::crd::instance::{Instance, InstanceStatus};
use crate::crd::run::{Run, RunPhase, RunStatus};

type Key = (String, String);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Get,
    List,
    Create,
    Delete,
    Patch,
}

/// A successful mutation, in the order it was applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreOp {
    pub verb: Verb,
    pub kind: &'static str,
    pub name: String,
}

#[derive(Clone, Debug)]
struct Fault {
    verb: Verb,
    kind: &'static str,
    error: StoreError,
    remaining: Option<usize>,
}

#[derive(Default)]
struct State {
    next_version: u64,
    instances: BTreeMap<Key, Instance>,
    deployments: BTreeMap<Key, Deployment>,
    pvcs: BTreeMap<Key, PersistentVolumeClaim>,
    config_maps: BTreeMap<Key, ConfigMap>,
    runs: BTreeMap<Key, Run>,
    faults: Vec<Fault>,
    journal: Vec<StoreOp>,
}

/// In-process [`ResourceStore`] with API-server-like semantics: resource
/// versions, uids, finalizer-gated deletion and label selection. Faults can
/// be injected per verb and kind.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

fn key(ns: &str, name: &str) -> Key {
    (ns.to_string(), name.to_string())
}

fn labels_match<K: Resource>(obj: &K, selector: &[(String, String)]) -> bool {
    let labels = obj.labels();
    selector
        .iter()
        .all(|(k, v)| labels.get(k).map(|x| x == v).unwrap_or(false))
}

/// RFC 7386 JSON merge patch.
fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(p) => {
            if !target.is_object() {
                *target = Value::Object(Default::default());
            }
            if let Value::Object(t) = target {
                for (k, v) in p {
                    if v.is_null() {
                        t.remove(k);
                    } else {
                        merge_patch(
                            t.entry(k.clone()).or_insert(Value::Null),
                            v,
                        );
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

impl State {
    fn check(&mut self, verb: Verb, kind: &'static str) -> Result<(), StoreError> {
        let Some(idx) = self
            .faults
            .iter()
            .position(|f| f.verb == verb && f.kind == kind)
        else {
            return Ok(());
        };
        let fault = &mut self.faults[idx];
        let err = fault.error.clone();
        if let Some(n) = fault.remaining.as_mut() {
            *n -= 1;
            if *n == 0 {
                self.faults.remove(idx);
            }
        }
        Err(err)
    }

    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    fn record(&mut self, verb: Verb, kind: &'static str, name: &str) {
        self.journal.push(StoreOp {
            verb,
            kind,
            name: name.to_string(),
        });
    }

    fn stamp<K: Resource>(&mut self, obj: &mut K, ns: &str) {
        let rv = self.bump();
        let meta = obj.meta_mut();
        meta.namespace = Some(ns.to_string());
        meta.resource_version = Some(rv.clone());
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", rv));
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(Time(Utc::now()));
        }
    }

    fn check_version(
        current: &Instance,
        resource_version: Option<&str>,
    ) -> Result<(), StoreError> {
        match resource_version {
            Some(rv) if current.meta().resource_version.as_deref() != Some(rv) => {
                Err(StoreError::Conflict(format!(
                    "Instance {} was modified (have {:?}, want {})",
                    current.name_any(),
                    current.meta().resource_version,
                    rv
                )))
            }
            _ => Ok(()),
        }
    }
}

macro_rules! create_in {
    ($state:expr, $map:ident, $kind:expr, $ns:expr, $obj:expr) => {{
        let name = $obj.name_any();
        if name.is_empty() {
            return Err(StoreError::Invalid(format!("{} without a name", $kind)));
        }
        let k = key($ns, &name);
        if $state.$map.contains_key(&k) {
            return Err(StoreError::AlreadyExists(format!("{} {}", $kind, name)));
        }
        let mut obj = $obj.clone();
        $state.stamp(&mut obj, $ns);
        $state.$map.insert(k, obj.clone());
        $state.record(Verb::Create, $kind, &name);
        Ok(obj)
    }};
}

macro_rules! delete_in {
    ($state:expr, $map:ident, $kind:expr, $ns:expr, $name:expr) => {{
        match $state.$map.remove(&key($ns, $name)) {
            Some(_) => {
                $state.record(Verb::Delete, $kind, $name);
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("{} {}", $kind, $name))),
        }
    }};
}

macro_rules! list_in {
    ($state:expr, $map:ident, $ns:expr, $selector:expr) => {{
        let sel = parse_selector($selector);
        Ok($state
            .$map
            .iter()
            .filter(|((obj_ns, _), obj)| obj_ns == $ns && labels_match(*obj, &sel))
            .map(|(_, obj)| obj.clone())
            .collect())
    }};
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Inject `error` for every call matching `verb` and `kind`.
    pub fn fail(&self, verb: Verb, kind: &'static str, error: StoreError) {
        self.lock().faults.push(Fault {
            verb,
            kind,
            error,
            remaining: None,
        });
    }

    /// Inject `error` for the next `times` calls matching `verb` and `kind`.
    pub fn fail_times(
        &self,
        verb: Verb,
        kind: &'static str,
        times: usize,
        error: StoreError,
    ) {
        if times == 0 {
            return;
        }
        self.lock().faults.push(Fault {
            verb,
            kind,
            error,
            remaining: Some(times),
        });
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    pub fn journal(&self) -> Vec<StoreOp> {
        self.lock().journal.clone()
    }

    pub fn insert_instance(&self, instance: Instance) -> Instance {
        let mut st = self.lock();
        let ns = instance.namespace().unwrap_or_else(|| "default".into());
        let mut obj = instance;
        st.stamp(&mut obj, &ns);
        if obj.meta().generation.is_none() {
            obj.meta_mut().generation = Some(1);
        }
        st.instances.insert(key(&ns, &obj.name_any()), obj.clone());
        obj
    }

    pub fn instance(&self, ns: &str, name: &str) -> Option<Instance> {
        self.lock().instances.get(&key(ns, name)).cloned()
    }

    /// Simulate an external writer touching the object (bumps its version).
    pub fn touch_instance(&self, ns: &str, name: &str) {
        let mut st = self.lock();
        let rv = st.bump();
        if let Some(obj) = st.instances.get_mut(&key(ns, name)) {
            obj.meta_mut().resource_version = Some(rv);
        }
    }

    /// Mark the Instance for deletion. Objects without finalizers vanish at once.
    pub fn request_deletion(&self, ns: &str, name: &str) {
        let mut st = self.lock();
        let k = key(ns, name);
        let has_finalizers = st
            .instances
            .get(&k)
            .and_then(|o| o.meta().finalizers.as_ref())
            .map(|f| !f.is_empty())
            .unwrap_or(false);
        if !has_finalizers {
            st.instances.remove(&k);
            return;
        }
        let rv = st.bump();
        if let Some(obj) = st.instances.get_mut(&k) {
            let meta = obj.meta_mut();
            meta.deletion_timestamp = Some(Time(Utc::now()));
            meta.resource_version = Some(rv);
        }
    }

    pub fn insert_deployment(&self, ns: &str, dep: Deployment) -> Deployment {
        let mut st = self.lock();
        let mut obj = dep;
        st.stamp(&mut obj, ns);
        st.deployments.insert(key(ns, &obj.name_any()), obj.clone());
        obj
    }

    pub fn deployment(&self, ns: &str, name: &str) -> Option<Deployment> {
        self.lock().deployments.get(&key(ns, name)).cloned()
    }

    pub fn deployment_names(&self, ns: &str) -> Vec<String> {
        self.lock()
            .deployments
            .keys()
            .filter(|(n, _)| n == ns)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn set_ready_replicas(&self, ns: &str, name: &str, ready: i32) {
        let mut st = self.lock();
        if let Some(dep) = st.deployments.get_mut(&key(ns, name)) {
            let status = dep.status.get_or_insert_with(DeploymentStatus::default);
            status.ready_replicas = Some(ready);
        }
    }

    pub fn pvc(&self, ns: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.lock().pvcs.get(&key(ns, name)).cloned()
    }

    pub fn pvc_names(&self, ns: &str) -> Vec<String> {
        self.lock()
            .pvcs
            .keys()
            .filter(|(n, _)| n == ns)
            .map(|(_, name)| name.clone())
            .collect()
    }

    pub fn config_map(&self, ns: &str, name: &str) -> Option<ConfigMap> {
        self.lock().config_maps.get(&key(ns, name)).cloned()
    }

    pub fn set_config_map_data(
        &self,
        ns: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) {
        let mut st = self.lock();
        let rv = st.bump();
        if let Some(cm) = st.config_maps.get_mut(&key(ns, name)) {
            cm.data = Some(data);
            cm.metadata.resource_version = Some(rv);
        }
    }

    pub fn insert_run(&self, ns: &str, run: Run) -> Run {
        let mut st = self.lock();
        let mut obj = run;
        st.stamp(&mut obj, ns);
        st.runs.insert(key(ns, &obj.name_any()), obj.clone());
        obj
    }

    pub fn set_run_phase(&self, ns: &str, name: &str, phase: RunPhase) {
        let mut st = self.lock();
        if let Some(run) = st.runs.get_mut(&key(ns, name)) {
            run.status = Some(RunStatus { phase: Some(phase) });
        }
    }
}

#[async_trait]
impl ResourceStore for MemoryStore {
    async fn get_instance(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<Instance>, StoreError> {
        let mut st = self.lock();
        st.check(Verb::Get, KIND_INSTANCE)?;
        Ok(st.instances.get(&key(ns, name)).cloned())
    }

    async fn patch_instance_finalizers(
        &self,
        ns: &str,
        name: &str,
        resource_version: Option<&str>,
        finalizers: Vec<String>,
    ) -> Result<(), StoreError> {
        let mut st = self.lock();
        st.check(Verb::Patch, KIND_INSTANCE)?;
        let k = key(ns, name);
        let current = st
            .instances
            .get(&k)
            .ok_or_else(|| StoreError::NotFound(format!("Instance {}", name)))?;
        State::check_version(current, resource_version)?;
        let deleting = current.meta().deletion_timestamp.is_some();
        st.record(Verb::Patch, KIND_INSTANCE, name);
        if deleting && finalizers.is_empty() {
            trace!(%ns, %name, "memory store: last finalizer removed; dropping instance");
            st.instances.remove(&k);
            return Ok(());
        }
        let rv = st.bump();
        if let Some(obj) = st.instances.get_mut(&k) {
            let meta = obj.meta_mut();
            meta.finalizers = Some(finalizers);
            meta.resource_version = Some(rv);
        }
        Ok(())
    }

    async fn patch_instance_status(
        &self,
        ns: &str,
        name: &str,
        resource_version: Option<&str>,
        status_patch: &Value,
    ) -> Result<(), StoreError> {
        let mut st = self.lock();
        st.check(Verb::Patch, KIND_INSTANCE)?;
        let k = key(ns, name);
        let current = st
            .instances
            .get(&k)
            .ok_or_else(|| StoreError::NotFound(format!("Instance {}", name)))?;
        State::check_version(current, resource_version)?;
        let mut status = serde_json::to_value(&current.status)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        merge_patch(&mut status, status_patch);
        let status: InstanceStatus = serde_json::from_value(status)
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        let rv = st.bump();
        if let Some(obj) = st.instances.get_mut(&k) {
            obj.status = Some(status);
            obj.meta_mut().resource_version = Some(rv);
        }
        st.record(Verb::Patch, KIND_INSTANCE, name);
        Ok(())
    }

    async fn get_deployment(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<Deployment>, StoreError> {
        let mut st = self.lock();
        st.check(Verb::Get, KIND_DEPLOYMENT)?;
        Ok(st.deployments.get(&key(ns, name)).cloned())
    }

    async fn create_deployment(
        &self,
        ns: &str,
        dep: &Deployment,
    ) -> Result<Deployment, StoreError> {
        let mut st = self.lock();
        st.check(Verb::Create, KIND_DEPLOYMENT)?;
        create_in!(st, deployments, KIND_DEPLOYMENT, ns, dep)
    }

    async fn list_deployments(
        &self,
        ns: &str,
        selector: &str,
    ) -> Result<Vec<Deployment>, StoreError> {
        let mut st = self.lock();
        st.check(Verb::List, KIND_DEPLOYMENT)?;
        list_in!(st, deployments, ns, selector)
    }

    async fn delete_deployment(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        let mut st = self.lock();
        st.check(Verb::Delete, KIND_DEPLOYMENT)?;
        delete_in!(st, deployments, KIND_DEPLOYMENT, ns, name)
    }

    async fn get_pvc(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, StoreError> {
        let mut st = self.lock();
        st.check(Verb::Get, KIND_PVC)?;
        Ok(st.pvcs.get(&key(ns, name)).cloned())
    }

    async fn create_pvc(
        &self,
        ns: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, StoreError> {
        let mut st = self.lock();
        st.check(Verb::Create, KIND_PVC)?;
        create_in!(st, pvcs, KIND_PVC, ns, pvc)
    }

    async fn list_pvcs(
        &self,
        ns: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, StoreError> {
        let mut st = self.lock();
        st.check(Verb::List, KIND_PVC)?;
        list_in!(st, pvcs, ns, selector)
    }

    async fn delete_pvc(&self, ns: &str, name: &str) -> Result<(), StoreError> {
        let mut st = self.lock();
        st.check(Verb::Delete, KIND_PVC)?;
        delete_in!(st, pvcs, KIND_PVC, ns, name)
    }

    async fn get_config_map(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, StoreError> {
        let mut st = self.lock();
        st.check(Verb::Get, KIND_CONFIG_MAP)?;
        Ok(st.config_maps.get(&key(ns, name)).cloned())
    }

    async fn create_config_map(
        &self,
        ns: &str,
        cm: &ConfigMap,
    ) -> Result<ConfigMap, StoreError> {
        let mut st = self.lock();
        st.check(Verb::Create, KIND_CONFIG_MAP)?;
        create_in!(st, config_maps, KIND_CONFIG_MAP, ns, cm)
    }

    async fn delete_config_map(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        let mut st = self.lock();
        st.check(Verb::Delete, KIND_CONFIG_MAP)?;
        delete_in!(st, config_maps, KIND_CONFIG_MAP, ns, name)
    }

    async fn list_runs(
        &self,
        ns: &str,
        selector: &str,
    ) -> Result<Vec<Run>, StoreError> {
        let mut st = self.lock();
        st.check(Verb::List, KIND_RUN)?;
        list_in!(st, runs, ns, selector)
    }
}

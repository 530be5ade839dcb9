use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim};
use kube::Client;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use serde_json::{Value, json};
use tracing::trace;

use super::{ResourceStore, StoreError};
use crate::crd::instance::Instance;
use crate::crd::run::Run;

/// [`ResourceStore`] backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }

    fn instances(&self, ns: &str) -> Api<Instance> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn deployments(&self, ns: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn pvcs(&self, ns: &str) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), ns)
    }

    fn config_maps(&self, ns: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), ns)
    }
}

/// Wrap a patch body with a resourceVersion precondition when one is known.
fn with_precondition(mut body: Value, resource_version: Option<&str>) -> Value {
    if let Some(rv) = resource_version {
        if let Some(meta) = body
            .as_object_mut()
            .map(|o| o.entry("metadata").or_insert_with(|| json!({})))
            .and_then(|m| m.as_object_mut())
        {
            meta.insert("resourceVersion".into(), json!(rv));
        }
    }
    body
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_instance(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<Instance>, StoreError> {
        Ok(self.instances(ns).get_opt(name).await?)
    }

    async fn patch_instance_finalizers(
        &self,
        ns: &str,
        name: &str,
        resource_version: Option<&str>,
        finalizers: Vec<String>,
    ) -> Result<(), StoreError> {
        let patch = with_precondition(
            json!({"metadata": {"finalizers": finalizers}}),
            resource_version,
        );
        trace!(%ns, %name, ?resource_version, "patching finalizers");
        self.instances(ns)
            .patch(name, &self.patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_instance_status(
        &self,
        ns: &str,
        name: &str,
        resource_version: Option<&str>,
        status_patch: &Value,
    ) -> Result<(), StoreError> {
        let patch =
            with_precondition(json!({ "status": status_patch }), resource_version);
        trace!(%ns, %name, ?resource_version, "patching status");
        self.instances(ns)
            .patch_status(name, &self.patch_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn get_deployment(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<Deployment>, StoreError> {
        Ok(self.deployments(ns).get_opt(name).await?)
    }

    async fn create_deployment(
        &self,
        ns: &str,
        dep: &Deployment,
    ) -> Result<Deployment, StoreError> {
        Ok(self.deployments(ns).create(&self.post_params(), dep).await?)
    }

    async fn list_deployments(
        &self,
        ns: &str,
        selector: &str,
    ) -> Result<Vec<Deployment>, StoreError> {
        let lp = ListParams::default().labels(selector);
        Ok(self.deployments(ns).list(&lp).await?.items)
    }

    async fn delete_deployment(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        self.deployments(ns)
            .delete(name, &DeleteParams::background())
            .await?;
        Ok(())
    }

    async fn get_pvc(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, StoreError> {
        Ok(self.pvcs(ns).get_opt(name).await?)
    }

    async fn create_pvc(
        &self,
        ns: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, StoreError> {
        Ok(self.pvcs(ns).create(&self.post_params(), pvc).await?)
    }

    async fn list_pvcs(
        &self,
        ns: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, StoreError> {
        let lp = ListParams::default().labels(selector);
        Ok(self.pvcs(ns).list(&lp).await?.items)
    }

    async fn delete_pvc(&self, ns: &str, name: &str) -> Result<(), StoreError> {
        self.pvcs(ns).delete(name, &DeleteParams::background()).await?;
        Ok(())
    }

    async fn get_config_map(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, StoreError> {
        Ok(self.config_maps(ns).get_opt(name).await?)
    }

    async fn create_config_map(
        &self,
        ns: &str,
        cm: &ConfigMap,
    ) -> Result<ConfigMap, StoreError> {
        Ok(self.config_maps(ns).create(&self.post_params(), cm).await?)
    }

    async fn delete_config_map(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        self.config_maps(ns)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn list_runs(
        &self,
        ns: &str,
        selector: &str,
    ) -> Result<Vec<Run>, StoreError> {
        let api: Api<Run> = Api::namespaced(self.client.clone(), ns);
        let lp = ListParams::default().labels(selector);
        Ok(api.list(&lp).await?.items)
    }
}

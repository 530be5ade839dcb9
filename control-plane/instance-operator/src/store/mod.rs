//! Resource store seam.
//!
//! The reconciler never talks to `kube::Api` directly; everything goes through
//! [`ResourceStore`] so the control loop can run against the real API server
//! ([`KubeStore`]) or an in-process store ([`MemoryStore`]).

mod kube_store;
mod memory;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim};
use serde_json::Value;

use crate::crd::instance::Instance;
use crate::crd::run::Run;

pub use kube_store::KubeStore;
pub use memory::{MemoryStore, StoreOp, Verb};

pub const KIND_INSTANCE: &str = "Instance";
pub const KIND_DEPLOYMENT: &str = "Deployment";
pub const KIND_PVC: &str = "PersistentVolumeClaim";
pub const KIND_CONFIG_MAP: &str = "ConfigMap";
pub const KIND_RUN: &str = "Run";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("store unavailable: {0}")]
    Transient(String),
    #[error("invalid request: {0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) => match ae.code {
                404 => StoreError::NotFound(ae.message),
                409 if ae.reason == "AlreadyExists" => {
                    StoreError::AlreadyExists(ae.message)
                }
                409 => StoreError::Conflict(ae.message),
                429 | 500..=599 => StoreError::Transient(ae.message),
                _ => StoreError::Invalid(ae.message),
            },
            kube::Error::SerdeError(e) => StoreError::Invalid(e.to_string()),
            other => StoreError::Transient(other.to_string()),
        }
    }
}

/// Idempotent-delete helper: a missing target counts as deleted.
pub trait IgnoreNotFound {
    fn ignore_not_found(self) -> Result<(), StoreError>;
}

impl IgnoreNotFound for Result<(), StoreError> {
    fn ignore_not_found(self) -> Result<(), StoreError> {
        match self {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }
}

/// Typed access to the cluster resources the operator reads and writes.
///
/// Every call goes to the backing store; implementations must not cache
/// across calls. Patches that take a `resource_version` fail with
/// [`StoreError::Conflict`] when the object changed since that version.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get_instance(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<Instance>, StoreError>;

    /// Replace `metadata.finalizers` with a merge patch.
    async fn patch_instance_finalizers(
        &self,
        ns: &str,
        name: &str,
        resource_version: Option<&str>,
        finalizers: Vec<String>,
    ) -> Result<(), StoreError>;

    /// Merge-patch the status subresource with `status_patch`.
    async fn patch_instance_status(
        &self,
        ns: &str,
        name: &str,
        resource_version: Option<&str>,
        status_patch: &Value,
    ) -> Result<(), StoreError>;

    async fn get_deployment(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<Deployment>, StoreError>;
    async fn create_deployment(
        &self,
        ns: &str,
        dep: &Deployment,
    ) -> Result<Deployment, StoreError>;
    async fn list_deployments(
        &self,
        ns: &str,
        selector: &str,
    ) -> Result<Vec<Deployment>, StoreError>;
    async fn delete_deployment(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<(), StoreError>;

    async fn get_pvc(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, StoreError>;
    async fn create_pvc(
        &self,
        ns: &str,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, StoreError>;
    async fn list_pvcs(
        &self,
        ns: &str,
        selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, StoreError>;
    async fn delete_pvc(&self, ns: &str, name: &str) -> Result<(), StoreError>;

    async fn get_config_map(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, StoreError>;
    async fn create_config_map(
        &self,
        ns: &str,
        cm: &ConfigMap,
    ) -> Result<ConfigMap, StoreError>;
    async fn delete_config_map(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<(), StoreError>;

    async fn list_runs(
        &self,
        ns: &str,
        selector: &str,
    ) -> Result<Vec<Run>, StoreError>;
}

/// Parse an equality-only label selector (`k=v,k2=v2`).
pub(crate) fn parse_selector(selector: &str) -> Vec<(String, String)> {
    selector
        .split(',')
        .filter_map(|kv| {
            let (k, v) = kv.split_once('=')?;
            Some((k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}

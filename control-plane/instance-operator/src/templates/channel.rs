use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy,
};
use k8s_openapi::api::core::v1::{
    Container, EnvFromSource, EnvVar, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSpec,
    PodTemplateSpec, SecretEnvSource, Volume, VolumeMount,
    VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{
    LabelSelector, ObjectMeta,
};

use super::{
    Owner, channel_labels, channel_workload_name, credential_store_name,
};
use crate::config::ChannelConfig;
use crate::crd::instance::ChannelSpec;

pub const ENV_INSTANCE_NAME: &str = "INSTANCE_NAME";
pub const ENV_EVENT_BUS_URL: &str = "EVENT_BUS_URL";

const CREDENTIAL_VOLUME: &str = "session-data";
const CREDENTIAL_MOUNT_PATH: &str = "/data";

/// Desired adapter workload for one channel. Single replica; credential-bearing
/// channels use `Recreate` so two adapters never share the session at once.
pub fn render_channel_deployment(
    owner: &Owner<'_>,
    channel: &ChannelSpec,
    cfg: &ChannelConfig,
) -> Deployment {
    let name = channel_workload_name(owner.name, channel.type_);
    let labels = channel_labels(owner.name, channel.type_);

    let env = vec![
        EnvVar {
            name: ENV_INSTANCE_NAME.to_string(),
            value: Some(owner.name.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: ENV_EVENT_BUS_URL.to_string(),
            value: Some(cfg.event_bus_url.clone()),
            ..Default::default()
        },
    ];
    let env_from = channel.config_secret_ref.as_ref().map(|secret| {
        vec![EnvFromSource {
            secret_ref: Some(SecretEnvSource {
                name: secret.clone(),
                optional: Some(false),
            }),
            ..Default::default()
        }]
    });

    let mut container = Container {
        name: "adapter".to_string(),
        image: Some(cfg.image_for(channel.type_.as_str())),
        env: Some(env),
        env_from,
        ..Default::default()
    };
    let mut volumes = None;
    let mut strategy = None;

    if channel.type_.requires_credential_store() {
        container.volume_mounts = Some(vec![VolumeMount {
            name: CREDENTIAL_VOLUME.to_string(),
            mount_path: CREDENTIAL_MOUNT_PATH.to_string(),
            ..Default::default()
        }]);
        volumes = Some(vec![Volume {
            name: CREDENTIAL_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: credential_store_name(owner.name, channel.type_),
                read_only: Some(false),
            }),
            ..Default::default()
        }]);
        strategy = Some(DeploymentStrategy {
            type_: Some("Recreate".to_string()),
            rolling_update: None,
        });
    }

    Deployment {
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(owner.namespace.to_string()),
            labels: Some(labels.clone()),
            owner_references: owner.owner_references(),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            strategy,
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Durable session storage for a credential-bearing channel.
pub fn render_credential_store(
    owner: &Owner<'_>,
    channel: &ChannelSpec,
    cfg: &ChannelConfig,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(credential_store_name(owner.name, channel.type_)),
            namespace: Some(owner.namespace.to_string()),
            labels: Some(channel_labels(owner.name, channel.type_)),
            owner_references: owner.owner_references(),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            storage_class_name: cfg.credential_storage_class.clone(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(cfg.credential_storage_size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Ready replicas observed on an existing workload.
pub fn ready_replicas(dep: &Deployment) -> i32 {
    dep.status
        .as_ref()
        .and_then(|s| s.ready_replicas)
        .unwrap_or(0)
}

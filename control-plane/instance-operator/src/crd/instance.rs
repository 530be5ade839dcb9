use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "agents.dev",
    version = "v1alpha1",
    kind = "Instance",
    plural = "instances",
    shortname = "inst",
    namespaced,
    status = "InstanceStatus",
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Runs","type":"integer","jsonPath":".status.activeRuns"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    /// Messaging integrations; each type gets its own adapter workload.
    ///
    /// Status lists one entry per declared item, in order. A type declared
    /// twice shares a single workload, so both entries report on it (the
    /// pass that creates it reports `Pending` then `Disconnected`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub channels: Vec<ChannelSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryConfig>,
    /// Provider credential references, consumed by the API layer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_ref: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSpec {
    #[serde(rename = "type")]
    pub type_: ChannelType,
    /// Secret whose keys are injected as environment into the adapter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_secret_ref: Option<String>,
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Telegram,
    Whatsapp,
    Discord,
    Slack,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Telegram => "telegram",
            ChannelType::Whatsapp => "whatsapp",
            ChannelType::Discord => "discord",
            ChannelType::Slack => "slack",
        }
    }

    /// Whether the adapter keeps a linked session on disk that must survive restarts.
    pub fn requires_credential_store(&self) -> bool {
        matches!(self, ChannelType::Whatsapp)
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct MemoryConfig {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secret_refs: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    #[serde(default)]
    pub phase: InstancePhase,
    #[serde(default)]
    pub channels: Vec<ChannelStatus>,
    #[serde(default)]
    pub active_runs: i64,
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema,
)]
pub enum InstancePhase {
    #[default]
    Pending,
    Running,
    Error,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct ChannelStatus {
    #[serde(rename = "type")]
    pub type_: ChannelType,
    pub status: ChannelConnectivity,
}

#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema,
)]
pub enum ChannelConnectivity {
    Pending,
    Connected,
    Disconnected,
}

impl ChannelStatus {
    pub fn new(type_: ChannelType, status: ChannelConnectivity) -> Self {
        Self { type_, status }
    }
}

impl Instance {
    pub fn memory_enabled(&self) -> bool {
        self.spec.memory.as_ref().map(|m| m.enabled).unwrap_or(false)
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .map(|f| f.iter().any(|x| x == finalizer))
            .unwrap_or(false)
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}

use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct OperatorConfig {
    #[envconfig(from = "HTTP_PORT", default = "8088")]
    pub http_port: u16,

    /// Namespace to watch. Empty means cluster-wide.
    /// Env: OPERATOR_WATCH_NAMESPACE
    #[envconfig(from = "OPERATOR_WATCH_NAMESPACE", default = "")]
    pub watch_namespace: String,

    /// Server-side field manager used for every write issued by the operator.
    #[envconfig(from = "OPERATOR_FIELD_MANAGER", default = "instance-operator")]
    pub field_manager: String,

    #[envconfig(nested)]
    pub channels: ChannelConfig,

    #[envconfig(nested)]
    pub requeue: RequeueConfig,
}

#[derive(Envconfig, Clone, Debug)]
pub struct ChannelConfig {
    /// Cluster-internal address of the message bus, injected as EVENT_BUS_URL.
    /// Env: OPERATOR_EVENT_BUS_URL
    #[envconfig(
        from = "OPERATOR_EVENT_BUS_URL",
        default = "nats://event-bus.default.svc.cluster.local:4222"
    )]
    pub event_bus_url: String,

    /// Registry prefix for channel adapter images (`<registry>/channel-<type>:<tag>`).
    #[envconfig(
        from = "OPERATOR_CHANNEL_IMAGE_REGISTRY",
        default = "ghcr.io/agents-dev"
    )]
    pub image_registry: String,

    #[envconfig(from = "OPERATOR_CHANNEL_IMAGE_TAG", default = "latest")]
    pub image_tag: String,

    /// Requested size of each credential store volume.
    #[envconfig(from = "OPERATOR_CREDENTIAL_STORAGE_SIZE", default = "1Gi")]
    pub credential_storage_size: String,

    /// Storage class for credential stores; cluster default when unset.
    #[envconfig(from = "OPERATOR_CREDENTIAL_STORAGE_CLASS")]
    pub credential_storage_class: Option<String>,
}

#[derive(Envconfig, Clone, Debug)]
pub struct RequeueConfig {
    /// Retry interval after a failed pass.
    /// Env: OPERATOR_REQUEUE_ERROR_SECS
    #[envconfig(from = "OPERATOR_REQUEUE_ERROR_SECS", default = "30")]
    pub error_secs: u64,

    /// Drift-detection interval after a successful pass.
    /// Env: OPERATOR_REQUEUE_STEADY_SECS
    #[envconfig(from = "OPERATOR_REQUEUE_STEADY_SECS", default = "60")]
    pub steady_secs: u64,
}

impl RequeueConfig {
    pub fn on_error(&self) -> Duration {
        Duration::from_secs(self.error_secs)
    }

    pub fn steady(&self) -> Duration {
        Duration::from_secs(self.steady_secs)
    }
}

impl ChannelConfig {
    pub fn image_for(&self, channel: &str) -> String {
        format!(
            "{}/channel-{}:{}",
            self.image_registry.trim_end_matches('/'),
            channel,
            self.image_tag
        )
    }
}

impl OperatorConfig {
    pub fn watch_namespace(&self) -> Option<&str> {
        let ns = self.watch_namespace.trim();
        if ns.is_empty() { None } else { Some(ns) }
    }
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            http_port: 8088,
            watch_namespace: String::new(),
            field_manager: "instance-operator".into(),
            channels: ChannelConfig {
                event_bus_url: "nats://event-bus.default.svc.cluster.local:4222"
                    .into(),
                image_registry: "ghcr.io/agents-dev".into(),
                image_tag: "latest".into(),
                credential_storage_size: "1Gi".into(),
                credential_storage_class: None,
            },
            requeue: RequeueConfig {
                error_secs: 30,
                steady_secs: 60,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn defaults_match_env_defaults() {
        let from_env =
            OperatorConfig::init_from_hashmap(&HashMap::new()).unwrap();
        let def = OperatorConfig::default();
        assert_eq!(from_env.http_port, def.http_port);
        assert_eq!(from_env.field_manager, def.field_manager);
        assert_eq!(from_env.channels.event_bus_url, def.channels.event_bus_url);
        assert_eq!(from_env.channels.image_tag, def.channels.image_tag);
        assert_eq!(from_env.requeue.error_secs, 30);
        assert_eq!(from_env.requeue.steady_secs, 60);
        assert!(from_env.watch_namespace().is_none());
    }

    #[test]
    fn env_overrides_are_honored() {
        let env = HashMap::from([
            ("OPERATOR_WATCH_NAMESPACE".to_string(), " tenants ".to_string()),
            ("OPERATOR_REQUEUE_ERROR_SECS".to_string(), "5".to_string()),
            (
                "OPERATOR_CREDENTIAL_STORAGE_CLASS".to_string(),
                "fast".to_string(),
            ),
        ]);
        let cfg = OperatorConfig::init_from_hashmap(&env).unwrap();
        assert_eq!(cfg.watch_namespace(), Some("tenants"));
        assert_eq!(cfg.requeue.on_error(), Duration::from_secs(5));
        assert_eq!(cfg.requeue.steady(), Duration::from_secs(60));
        assert_eq!(
            cfg.channels.credential_storage_class.as_deref(),
            Some("fast")
        );
    }

    #[test]
    fn image_for_strips_trailing_slash() {
        let mut cfg = OperatorConfig::default();
        cfg.channels.image_registry = "registry.local/bots/".into();
        cfg.channels.image_tag = "v2".into();
        assert_eq!(
            cfg.channels.image_for("slack"),
            "registry.local/bots/channel-slack:v2"
        );
    }
}

use std::collections::BTreeMap;
use std::time::Duration;

use instance_operator::controller::{FINALIZER, ReconcileErr};
use instance_operator::crd::instance::{
    ChannelConnectivity, ChannelStatus, ChannelType, InstancePhase,
    InstanceStatus,
};
use instance_operator::crd::run::RunPhase;
use instance_operator::store::{
    KIND_CONFIG_MAP, KIND_DEPLOYMENT, KIND_INSTANCE, KIND_PVC, StoreError, Verb,
};
use instance_operator::templates::{
    ENV_EVENT_BUS_URL, ENV_INSTANCE_NAME, MEMORY_KEY, MEMORY_SEED,
};
use kube::ResourceExt;
use kube::runtime::controller::Action;
use tokio_util::sync::CancellationToken;

mod common;
use common::{Harness, NS, run, spec};

use ChannelType::{Discord, Telegram, Whatsapp};

#[test_log::test(tokio::test)]
async fn new_instance_gets_workload_and_pending_status() {
    let h = Harness::new();
    h.create("bot", spec(&[Telegram], false));

    let action = h.reconcile("bot").await.unwrap();

    assert_eq!(action, Action::requeue(Duration::from_secs(60)));
    assert_eq!(h.store.deployment_names(NS), vec!["bot-channel-telegram"]);
    assert_eq!(
        h.status("bot"),
        InstanceStatus {
            phase: InstancePhase::Running,
            channels: vec![ChannelStatus::new(
                Telegram,
                ChannelConnectivity::Pending
            )],
            active_runs: 0,
        }
    );

    let dep = h.store.deployment(NS, "bot-channel-telegram").unwrap();
    let env = dep.spec.unwrap().template.spec.unwrap().containers[0]
        .env
        .clone()
        .unwrap();
    let names: Vec<_> = env.iter().map(|e| e.name.as_str()).collect();
    assert!(names.contains(&ENV_INSTANCE_NAME));
    assert!(names.contains(&ENV_EVENT_BUS_URL));
    assert!(dep.metadata.owner_references.is_some());
}

#[test_log::test(tokio::test)]
async fn connectivity_follows_ready_replicas_on_later_pass() {
    let h = Harness::new();
    h.create("bot", spec(&[Telegram], false));
    h.reconcile("bot").await.unwrap();

    // Created in the previous pass but not ready yet.
    h.reconcile("bot").await.unwrap();
    assert_eq!(
        h.status("bot").channels[0].status,
        ChannelConnectivity::Disconnected
    );

    h.store.set_ready_replicas(NS, "bot-channel-telegram", 1);
    h.reconcile("bot").await.unwrap();
    assert_eq!(
        h.status("bot").channels,
        vec![ChannelStatus::new(Telegram, ChannelConnectivity::Connected)]
    );

    h.store.set_ready_replicas(NS, "bot-channel-telegram", 0);
    h.reconcile("bot").await.unwrap();
    assert_eq!(
        h.status("bot").channels[0].status,
        ChannelConnectivity::Disconnected
    );
}

#[test_log::test(tokio::test)]
async fn memory_store_is_seeded_once_and_never_overwritten() {
    let h = Harness::new();
    h.create("bot", spec(&[Telegram], true));
    h.reconcile("bot").await.unwrap();

    let cm = h.store.config_map(NS, "bot-memory").unwrap();
    assert_eq!(
        cm.data.unwrap().get(MEMORY_KEY).map(String::as_str),
        Some(MEMORY_SEED)
    );

    let edited =
        BTreeMap::from([(MEMORY_KEY.to_string(), "# Memory\n- likes tea\n".to_string())]);
    h.store.set_config_map_data(NS, "bot-memory", edited.clone());

    h.reconcile_n("bot", 10).await;

    assert_eq!(h.store.config_map(NS, "bot-memory").unwrap().data, Some(edited));
    assert_eq!(h.ops(Verb::Create, KIND_CONFIG_MAP).len(), 1);
}

#[test_log::test(tokio::test)]
async fn credential_store_precedes_workload_and_is_created_once() {
    let h = Harness::new();
    h.create("bot", spec(&[Whatsapp], false));
    h.reconcile_n("bot", 2).await;

    let pvc_at = h
        .position(Verb::Create, KIND_PVC, "bot-channel-whatsapp-data")
        .expect("credential store created");
    let dep_at = h
        .position(Verb::Create, KIND_DEPLOYMENT, "bot-channel-whatsapp")
        .expect("workload created");
    assert!(pvc_at < dep_at);
    assert_eq!(h.store.pvc_names(NS), vec!["bot-channel-whatsapp-data"]);
    assert_eq!(h.ops(Verb::Create, KIND_PVC).len(), 1);

    let dep = h.store.deployment(NS, "bot-channel-whatsapp").unwrap();
    let strategy = dep.spec.unwrap().strategy.unwrap();
    assert_eq!(strategy.type_.as_deref(), Some("Recreate"));
}

#[test_log::test(tokio::test)]
async fn repeated_passes_converge_to_a_fixed_child_set() {
    let h = Harness::new();
    h.create("bot", spec(&[Telegram, Whatsapp, Discord], true));
    h.reconcile_n("bot", 4).await;
    let settled = h.store.journal().len();

    h.reconcile("bot").await.unwrap();

    assert_eq!(h.store.journal().len(), settled, "steady pass must not write");
    assert_eq!(
        h.store.deployment_names(NS),
        vec![
            "bot-channel-discord",
            "bot-channel-telegram",
            "bot-channel-whatsapp"
        ]
    );
    assert_eq!(h.ops(Verb::Create, KIND_DEPLOYMENT).len(), 3);
    assert_eq!(h.ops(Verb::Create, KIND_PVC).len(), 1);
    assert_eq!(h.ops(Verb::Create, KIND_CONFIG_MAP).len(), 1);

    let order: Vec<_> =
        h.status("bot").channels.iter().map(|c| c.type_).collect();
    assert_eq!(order, vec![Telegram, Whatsapp, Discord]);
}

#[test_log::test(tokio::test)]
async fn duplicate_channel_types_share_one_workload() {
    let h = Harness::new();
    h.create("bot", spec(&[Whatsapp, Whatsapp], false));
    h.reconcile("bot").await.unwrap();

    assert_eq!(h.store.deployment_names(NS), vec!["bot-channel-whatsapp"]);
    assert_eq!(h.store.pvc_names(NS), vec!["bot-channel-whatsapp-data"]);
    assert_eq!(
        h.status("bot").channels,
        vec![
            ChannelStatus::new(Whatsapp, ChannelConnectivity::Pending),
            ChannelStatus::new(Whatsapp, ChannelConnectivity::Disconnected),
        ]
    );

    h.store.set_ready_replicas(NS, "bot-channel-whatsapp", 1);
    h.reconcile("bot").await.unwrap();
    assert!(
        h.status("bot")
            .channels
            .iter()
            .all(|c| c.status == ChannelConnectivity::Connected)
    );
    assert_eq!(h.ops(Verb::Create, KIND_DEPLOYMENT).len(), 1);
}

#[test_log::test(tokio::test)]
async fn finalizer_is_added_before_any_child() {
    let h = Harness::new();
    h.create("bot", spec(&[Telegram], true));
    h.reconcile("bot").await.unwrap();

    let journal = h.store.journal();
    assert_eq!(journal[0].verb, Verb::Patch);
    assert_eq!(journal[0].kind, KIND_INSTANCE);
    assert!(journal[1..].iter().any(|op| op.verb == Verb::Create));
    assert!(h.store.instance(NS, "bot").unwrap().has_finalizer(FINALIZER));
}

#[test_log::test(tokio::test)]
async fn channel_failure_sets_error_and_retries_quickly() {
    let h = Harness::new();
    h.create("bot", spec(&[Telegram], false));
    h.store.fail(
        Verb::Create,
        KIND_DEPLOYMENT,
        StoreError::Transient("apiserver unavailable".into()),
    );

    let err = h.reconcile("bot").await.unwrap_err();
    assert!(matches!(err, ReconcileErr::Channel { channel: Telegram, .. }));
    assert!(err.is_retryable());
    assert_eq!(
        h.reconciler.error_action(&err),
        Action::requeue(Duration::from_secs(30))
    );
    assert_eq!(h.status("bot").phase, InstancePhase::Error);

    h.store.clear_faults();
    h.reconcile("bot").await.unwrap();
    assert_eq!(h.status("bot").phase, InstancePhase::Running);
}

#[test_log::test(tokio::test)]
async fn first_failing_channel_aborts_the_rest_of_the_pass() {
    let h = Harness::new();
    h.create("bot", spec(&[Telegram, Whatsapp, Discord], false));
    h.store.fail_times(
        Verb::Create,
        KIND_PVC,
        1,
        StoreError::Transient("quota check timed out".into()),
    );

    let err = h.reconcile("bot").await.unwrap_err();
    assert!(matches!(err, ReconcileErr::Channel { channel: Whatsapp, .. }));
    assert_eq!(h.store.deployment_names(NS), vec!["bot-channel-telegram"]);

    h.reconcile("bot").await.unwrap();
    assert_eq!(h.store.deployment_names(NS).len(), 3);
    assert_eq!(h.ops(Verb::Create, KIND_DEPLOYMENT).len(), 3);
    assert_eq!(h.status("bot").phase, InstancePhase::Running);
}

#[test_log::test(tokio::test)]
async fn memory_failure_never_flips_phase() {
    let h = Harness::new();
    h.create("bot", spec(&[Telegram], true));
    h.store.fail(
        Verb::Create,
        KIND_CONFIG_MAP,
        StoreError::Invalid("admission denied".into()),
    );

    let action = h.reconcile("bot").await.unwrap();

    assert_eq!(action, Action::requeue(Duration::from_secs(60)));
    assert_eq!(h.status("bot").phase, InstancePhase::Running);
    assert!(h.store.config_map(NS, "bot-memory").is_none());
}

#[test_log::test(tokio::test)]
async fn status_conflict_is_retryable_and_not_an_error_phase() {
    let h = Harness::new();
    h.create("bot", spec(&[Telegram], false));
    h.reconcile("bot").await.unwrap();

    h.store.set_ready_replicas(NS, "bot-channel-telegram", 1);
    h.store.fail_times(
        Verb::Patch,
        KIND_INSTANCE,
        1,
        StoreError::Conflict("object has been modified".into()),
    );
    let err = h.reconcile("bot").await.unwrap_err();
    assert!(matches!(err, ReconcileErr::Store(StoreError::Conflict(_))));
    assert_eq!(
        h.reconciler.error_action(&err),
        Action::requeue(Duration::from_secs(30))
    );
    assert_eq!(h.status("bot").phase, InstancePhase::Running);

    h.reconcile("bot").await.unwrap();
    assert_eq!(
        h.status("bot").channels[0].status,
        ChannelConnectivity::Connected
    );
}

#[test_log::test(tokio::test)]
async fn active_runs_are_recounted_every_pass() {
    let h = Harness::new();
    h.create("bot", spec(&[Telegram], false));
    h.store.insert_run(NS, run("r1", "bot", RunPhase::Running));
    h.store.insert_run(NS, run("r2", "bot", RunPhase::Running));
    h.store.insert_run(NS, run("r3", "bot", RunPhase::Succeeded));
    h.store.insert_run(NS, run("r4", "other", RunPhase::Running));

    h.reconcile("bot").await.unwrap();
    assert_eq!(h.status("bot").active_runs, 2);

    h.store.set_run_phase(NS, "r1", RunPhase::Failed);
    h.reconcile("bot").await.unwrap();
    assert_eq!(h.status("bot").active_runs, 1);

    h.store.set_run_phase(NS, "r3", RunPhase::Running);
    h.store.set_run_phase(NS, "r2", RunPhase::Succeeded);
    h.reconcile("bot").await.unwrap();
    assert_eq!(h.status("bot").active_runs, 1);
}

#[test_log::test(tokio::test)]
async fn absent_instance_is_a_no_op() {
    let h = Harness::new();
    let action = h.reconcile("ghost").await.unwrap();
    assert_eq!(action, Action::await_change());
    assert!(h.store.journal().is_empty());
}

#[test_log::test(tokio::test)]
async fn cancelled_pass_writes_nothing() {
    let h = Harness::new();
    h.create("bot", spec(&[Telegram], true));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = h.reconcile_with("bot", &cancel).await.unwrap_err();

    assert!(matches!(err, ReconcileErr::Cancelled));
    assert!(h.store.journal().is_empty());
    assert!(h.store.instance(NS, "bot").unwrap().finalizers().is_empty());
}

use super::*;
use crate::config::Config;
use crate::error::PluginError;
use crate::host::BootResult;
use crate::plugins::GenericPlugin;
use crate::test_utils::{
    device_plugin_pod, node_state, observed_interface, test_config, FakeHost, ScriptedPlugin, NAMESPACE, NODE,
};
use cluster_client::MockClusterClient;
use crds::drain::DEVICE_PLUGIN_WAIT_CONFIG_ANNOTATION;
use crds::BridgeStatus;
use std::collections::HashMap;

const PCI: &str = "0000:3b:00.0";

struct Harness {
    mock: MockClusterClient,
    host: Arc<FakeHost>,
    reconciler: NodeReconciler,
}

impl Harness {
    async fn pass(&self) -> Result<Outcome, ControllerError> {
        let state = self.mock.node_state(NODE).unwrap();
        self.reconciler.reconcile(&state).await
    }

    fn annotation(&self, key: &str) -> Option<String> {
        self.mock.node_state(NODE).unwrap().annotation(key).map(str::to_string)
    }

    fn sync_status(&self) -> Option<SyncStatus> {
        self.mock.node_state(NODE).unwrap().sync_status()
    }

    fn set_drain(&self, desired: &str, current: &str) {
        self.mock.annotate_node_state(NODE, DESIRED_DRAIN_ANNOTATION, desired);
        self.mock.annotate_node_state(NODE, CURRENT_DRAIN_ANNOTATION, current);
    }
}

fn generic(host: &Arc<FakeHost>) -> PluginSet {
    PluginSet {
        main: Some(Box::new(GenericPlugin::bare_metal(host.clone(), None))),
        additional: Vec::new(),
    }
}

fn scripted(main: ScriptedPlugin, additional: Vec<ScriptedPlugin>) -> PluginSet {
    PluginSet {
        main: Some(Box::new(main)),
        additional: additional
            .into_iter()
            .map(|p| Box::new(p) as Box<dyn crate::plugins::VendorPlugin>)
            .collect(),
    }
}

fn harness(config: Config, features: &[(&str, bool)], plugins: impl FnOnce(&Arc<FakeHost>) -> PluginSet) -> Harness {
    let mock = MockClusterClient::new();
    mock.add_node(NODE);
    let host = Arc::new(FakeHost::with_interfaces(vec![observed_interface(PCI, 0)]));

    let overrides: HashMap<String, bool> = features.iter().map(|(k, v)| ((*k).to_string(), *v)).collect();
    let client: Arc<dyn ClusterClientTrait> = Arc::new(mock.clone());
    let reconciler = NodeReconciler::new(
        &config,
        Arc::clone(&client),
        host.clone(),
        plugins(&host),
        Arc::new(FeatureGate::with_overrides(&overrides)),
        CancellationToken::new(),
    )
    .with_reboot_wait(Duration::from_secs(1))
    .with_device_plugin(
        DevicePlugin::new(client, NAMESPACE, NODE).with_timing(Duration::from_secs(1), Duration::from_secs(5)),
    );

    Harness { mock, host, reconciler }
}

/// Node asking for two VFs at generation 2, drain protocol idle
fn gen2_harness(config: Config) -> Harness {
    let h = harness(config, &[], generic);
    h.mock.put_node_state(node_state(NODE, 2, vec![(PCI, 2)]));
    h.set_drain("Idle", "Idle");
    h.mock.add_pod(device_plugin_pod("device-plugin-abc", NODE, false));
    h.mock
        .respawn_deleted_pods("app", "network-device-plugin", &[(DEVICE_PLUGIN_WAIT_CONFIG_ANNOTATION, "true")]);
    h
}

#[tokio::test(start_paused = true)]
async fn test_new_interface_drains_then_applies() {
    let h = gen2_harness(test_config());

    assert_eq!(h.pass().await.unwrap(), Outcome::AwaitingDrain);
    assert_eq!(h.annotation(DESIRED_DRAIN_ANNOTATION).as_deref(), Some("DrainRequired"));
    assert_eq!(h.sync_status(), Some(SyncStatus::InProgress));
    assert!(h.host.configured().is_empty());

    // Executor has not reported yet: no second request
    let writes = h.mock.calls().node_state_annotations.len();
    assert_eq!(h.pass().await.unwrap(), Outcome::AwaitingDrain);
    assert_eq!(h.mock.calls().node_state_annotations.len(), writes);

    h.mock.annotate_node_state(NODE, CURRENT_DRAIN_ANNOTATION, "DrainComplete");
    assert_eq!(h.pass().await.unwrap(), Outcome::Applied);

    assert_eq!(h.host.num_vfs(PCI), Some(2));
    assert_eq!(h.annotation(DESIRED_DRAIN_ANNOTATION).as_deref(), Some("Idle"));
    assert_eq!(h.sync_status(), Some(SyncStatus::Succeeded));
    assert_eq!(h.reconciler.last_applied_generation(), 2);
    assert_eq!(h.mock.calls().deleted, vec!["network-operator/device-plugin-abc".to_string()]);

    let replacement = h.mock.pod(NAMESPACE, "device-plugin-abc-gen1").unwrap();
    assert!(!replacement
        .metadata
        .annotations
        .unwrap_or_default()
        .contains_key(DEVICE_PLUGIN_WAIT_CONFIG_ANNOTATION));

    let status = h.mock.node_state(NODE).unwrap().status.unwrap();
    assert_eq!(status.interfaces[0].num_vfs, 2);
}

#[tokio::test(start_paused = true)]
async fn test_steady_state_is_quiet() {
    let h = gen2_harness(test_config());
    h.pass().await.unwrap();
    h.mock.annotate_node_state(NODE, CURRENT_DRAIN_ANNOTATION, "DrainComplete");
    h.pass().await.unwrap();
    h.mock.annotate_node_state(NODE, CURRENT_DRAIN_ANNOTATION, "Idle");

    let before = h.mock.calls();
    let configured = h.host.configured().len();
    for _ in 0..3 {
        assert_eq!(h.pass().await.unwrap(), Outcome::Converged);
    }
    let after = h.mock.calls();

    assert_eq!(after.node_state_annotations, before.node_state_annotations);
    assert_eq!(after.status_updates.len(), before.status_updates.len());
    assert_eq!(after.deleted, before.deleted);
    assert_eq!(h.host.configured().len(), configured);
}

#[tokio::test(start_paused = true)]
async fn test_drift_triggers_new_drain_request() {
    let h = gen2_harness(test_config());
    h.pass().await.unwrap();
    h.mock.annotate_node_state(NODE, CURRENT_DRAIN_ANNOTATION, "DrainComplete");
    h.pass().await.unwrap();
    h.mock.annotate_node_state(NODE, CURRENT_DRAIN_ANNOTATION, "Idle");
    assert_eq!(h.pass().await.unwrap(), Outcome::Converged);

    h.host.set_num_vfs(PCI, 0);
    assert_eq!(h.pass().await.unwrap(), Outcome::AwaitingDrain);
    assert_eq!(h.annotation(DESIRED_DRAIN_ANNOTATION).as_deref(), Some("DrainRequired"));
}

#[tokio::test]
async fn test_missing_drain_keys_is_a_no_op() {
    let h = harness(test_config(), &[], generic);
    h.mock.put_node_state(node_state(NODE, 2, vec![(PCI, 2)]));

    assert_eq!(h.pass().await.unwrap(), Outcome::MissingDrainAnnotations);
    let calls = h.mock.calls();
    assert!(calls.status_updates.is_empty());
    assert!(calls.node_state_annotations.is_empty());

    // Only one of the two keys is still not enough
    h.mock.annotate_node_state(NODE, DESIRED_DRAIN_ANNOTATION, "Idle");
    assert_eq!(h.pass().await.unwrap(), Outcome::MissingDrainAnnotations);
}

#[tokio::test]
async fn test_external_drainer_annotation_follows_config() {
    let config = Config {
        use_external_drainer: true,
        ..test_config()
    };
    let h = harness(config, &[], generic);
    h.mock.put_node_state(node_state(NODE, 1, vec![]));

    assert_eq!(h.pass().await.unwrap(), Outcome::AuthorityUpdated);
    assert_eq!(h.annotation(EXTERNAL_DRAINER_ANNOTATION).as_deref(), Some("true"));

    // Already in line: next pass continues normally
    assert_eq!(h.pass().await.unwrap(), Outcome::MissingDrainAnnotations);
}

#[tokio::test]
async fn test_external_drainer_annotation_removed_when_idle() {
    let h = harness(test_config(), &[], generic);
    h.mock.put_node_state(node_state(NODE, 1, vec![]));
    h.set_drain("Idle", "Idle");
    h.mock.annotate_node_state(NODE, EXTERNAL_DRAINER_ANNOTATION, "true");

    assert_eq!(h.pass().await.unwrap(), Outcome::AuthorityUpdated);
    assert_eq!(h.annotation(EXTERNAL_DRAINER_ANNOTATION), None);
}

#[tokio::test]
async fn test_external_drainer_not_toggled_mid_drain() {
    let config = Config {
        use_external_drainer: true,
        ..test_config()
    };
    let h = harness(config, &[], generic);
    h.mock.put_node_state(node_state(NODE, 2, vec![(PCI, 2)]));
    h.set_drain("DrainRequired", "Draining");

    assert_eq!(h.pass().await.unwrap(), Outcome::AwaitingDrain);
    assert_eq!(h.annotation(EXTERNAL_DRAINER_ANNOTATION), None);
    assert_eq!(h.annotation(DESIRED_DRAIN_ANNOTATION).as_deref(), Some("DrainRequired"));
}

#[tokio::test]
async fn test_plugin_error_leaves_drain_state_alone() {
    let h = harness(test_config(), &[], |_| scripted(ScriptedPlugin::named("broken").failing(), vec![]));
    h.mock.put_node_state(node_state(NODE, 2, vec![(PCI, 2)]));
    h.set_drain("Idle", "Idle");

    let err = h.pass().await.unwrap_err();
    assert!(matches!(err, ControllerError::Plugin(PluginError::InvalidConfig { .. })));
    assert_eq!(h.sync_status(), Some(SyncStatus::InProgress));
    assert_eq!(h.annotation(DESIRED_DRAIN_ANNOTATION).as_deref(), Some("Idle"));
    assert_eq!(h.reconciler.last_applied_generation(), 0);
}

#[tokio::test]
async fn test_in_progress_keeps_previous_error() {
    let h = harness(test_config(), &[], |_| scripted(ScriptedPlugin::named("broken").failing(), vec![]));
    let mut state = node_state(NODE, 2, vec![(PCI, 2)]);
    state.status = Some(crds::NetworkNodeStateStatus {
        last_sync_error: Some("previous failure".to_string()),
        ..Default::default()
    });
    h.mock.put_node_state(state);
    h.set_drain("Idle", "Idle");

    h.pass().await.unwrap_err();
    let status = h.mock.node_state(NODE).unwrap().status.unwrap();
    assert_eq!(status.sync_status, Some(SyncStatus::InProgress));
    assert_eq!(status.last_sync_error.as_deref(), Some("previous failure"));
}

#[tokio::test]
async fn test_failed_drain_status_survives_wait_pass() {
    let h = harness(test_config(), &[], generic);
    let mut state = node_state(NODE, 2, vec![(PCI, 2)]);
    state.status = Some(crds::NetworkNodeStateStatus {
        sync_status: Some(SyncStatus::Failed),
        last_sync_error: Some("cordon failed".to_string()),
        ..Default::default()
    });
    h.mock.put_node_state(state);
    h.set_drain("DrainRequired", "Draining");

    assert_eq!(h.pass().await.unwrap(), Outcome::AwaitingDrain);
    let status = h.mock.node_state(NODE).unwrap().status.unwrap();
    assert_eq!(status.sync_status, Some(SyncStatus::Failed));
    assert_eq!(status.last_sync_error.as_deref(), Some("cordon failed"));
}

#[tokio::test(start_paused = true)]
async fn test_failed_status_replaced_once_drain_completes() {
    let h = harness(test_config(), &[], generic);
    let mut state = node_state(NODE, 2, vec![(PCI, 2)]);
    state.status = Some(crds::NetworkNodeStateStatus {
        sync_status: Some(SyncStatus::Failed),
        last_sync_error: Some("cordon failed".to_string()),
        ..Default::default()
    });
    h.mock.put_node_state(state);
    h.set_drain("DrainRequired", "DrainComplete");

    assert_eq!(h.pass().await.unwrap(), Outcome::Applied);
    let status = h.mock.node_state(NODE).unwrap().status.unwrap();
    assert_eq!(status.sync_status, Some(SyncStatus::Succeeded));
    assert_eq!(status.last_sync_error, None);
}

#[tokio::test]
async fn test_orphan_back_at_checkpoint_is_converged() {
    let checkpoint = crate::host::Checkpoint {
        interfaces: vec![observed_interface(PCI, 1)],
        taken_at: chrono::Utc::now(),
    };
    let h = harness(test_config(), &[], move |host| PluginSet {
        main: Some(Box::new(GenericPlugin::bare_metal(host.clone(), Some(checkpoint)))),
        additional: Vec::new(),
    });
    h.host.set_num_vfs(PCI, 1);
    h.mock.put_node_state(node_state(NODE, 0, vec![]));
    h.set_drain("Idle", "Idle");

    for _ in 0..3 {
        assert_eq!(h.pass().await.unwrap(), Outcome::Converged);
    }
    assert_eq!(h.annotation(DESIRED_DRAIN_ANNOTATION).as_deref(), Some("Idle"));
    assert!(h.host.configured().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reboot_skips_main_plugin() {
    let reboot = DrainRequirement { drain: true, reboot: true };
    let main = ScriptedPlugin::named("main").requiring(reboot);
    let extra = ScriptedPlugin::named("extra").requiring(DrainRequirement { drain: true, reboot: false });
    let (main_applied, extra_applied) = (main.applied(), extra.applied());

    let h = harness(test_config(), &[], move |_| scripted(main, vec![extra]));
    h.mock.put_node_state(node_state(NODE, 2, vec![(PCI, 2)]));
    h.set_drain("Idle", "Idle");

    assert_eq!(h.pass().await.unwrap(), Outcome::AwaitingDrain);
    assert_eq!(h.annotation(DESIRED_DRAIN_ANNOTATION).as_deref(), Some("RebootRequired"));

    h.mock.annotate_node_state(NODE, CURRENT_DRAIN_ANNOTATION, "DrainComplete");
    assert_eq!(h.pass().await.unwrap(), Outcome::Rebooting);
    assert_eq!(h.host.reboots(), 1);
    assert_eq!(extra_applied.load(Ordering::SeqCst), 1);
    assert_eq!(main_applied.load(Ordering::SeqCst), 0);
    assert_eq!(h.reconciler.last_applied_generation(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_leftover_reboot_request_does_not_reboot_again() {
    let h = harness(test_config(), &[], |_| scripted(ScriptedPlugin::named("main"), vec![]));
    h.mock.put_node_state(node_state(NODE, 2, vec![(PCI, 2)]));
    h.set_drain("RebootRequired", "DrainComplete");

    assert_eq!(h.pass().await.unwrap(), Outcome::Applied);
    assert_eq!(h.host.reboots(), 0);
    assert_eq!(h.annotation(DESIRED_DRAIN_ANNOTATION).as_deref(), Some("Idle"));
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_reboot_wait_is_an_error() {
    let main = ScriptedPlugin::named("main").requiring(DrainRequirement { drain: false, reboot: true });
    let mock = MockClusterClient::new();
    mock.put_node_state(node_state(NODE, 2, vec![(PCI, 2)]));
    mock.annotate_node_state(NODE, DESIRED_DRAIN_ANNOTATION, "RebootRequired");
    mock.annotate_node_state(NODE, CURRENT_DRAIN_ANNOTATION, "DrainComplete");
    let host = Arc::new(FakeHost::with_interfaces(vec![observed_interface(PCI, 0)]));
    let cancel = CancellationToken::new();
    let reconciler = NodeReconciler::new(
        &test_config(),
        Arc::new(mock.clone()),
        host.clone(),
        scripted(main, vec![]),
        Arc::new(FeatureGate::new()),
        cancel.clone(),
    );

    cancel.cancel();
    let err = reconciler.reconcile(&mock.node_state(NODE).unwrap()).await.unwrap_err();
    assert!(matches!(err, ControllerError::Host(HostError::Cancelled)));
    assert_eq!(host.reboots(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_upgrade_to_reboot_once_draining() {
    let main = ScriptedPlugin::named("main").requiring(DrainRequirement { drain: true, reboot: true });
    let h = harness(test_config(), &[], move |_| scripted(main, vec![]));
    h.mock.put_node_state(node_state(NODE, 2, vec![(PCI, 2)]));
    h.set_drain("DrainRequired", "Draining");

    assert_eq!(h.pass().await.unwrap(), Outcome::AwaitingDrain);
    assert_eq!(h.annotation(DESIRED_DRAIN_ANNOTATION).as_deref(), Some("DrainRequired"));
    assert!(h.mock.calls().node_state_annotations.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_empty_spec_never_unblocks_device_plugin() {
    let h = harness(test_config(), &[], generic);
    h.mock.put_node_state(node_state(NODE, 3, vec![]));
    h.set_drain("Idle", "Idle");
    h.mock.add_pod(device_plugin_pod("device-plugin-abc", NODE, true));
    h.mock
        .respawn_deleted_pods("app", "network-device-plugin", &[(DEVICE_PLUGIN_WAIT_CONFIG_ANNOTATION, "true")]);

    assert_eq!(h.pass().await.unwrap(), Outcome::Applied);
    assert_eq!(h.pass().await.unwrap(), Outcome::Converged);

    let replacement = h.mock.pod(NAMESPACE, "device-plugin-abc-gen1").unwrap();
    assert!(replacement
        .metadata
        .annotations
        .unwrap_or_default()
        .contains_key(DEVICE_PLUGIN_WAIT_CONFIG_ANNOTATION));
}

#[tokio::test(start_paused = true)]
async fn test_steady_state_reoffers_unblock() {
    let h = gen2_harness(test_config());
    h.pass().await.unwrap();
    h.mock.annotate_node_state(NODE, CURRENT_DRAIN_ANNOTATION, "DrainComplete");
    h.pass().await.unwrap();
    h.mock.annotate_node_state(NODE, CURRENT_DRAIN_ANNOTATION, "Idle");

    // Device plugin restarted on its own and is waiting again
    h.mock.add_pod(device_plugin_pod("device-plugin-xyz", NODE, true));
    assert_eq!(h.pass().await.unwrap(), Outcome::Converged);

    let pod = h.mock.pod(NAMESPACE, "device-plugin-xyz").unwrap();
    assert!(!pod
        .metadata
        .annotations
        .unwrap_or_default()
        .contains_key(DEVICE_PLUGIN_WAIT_CONFIG_ANNOTATION));
}

#[tokio::test(start_paused = true)]
async fn test_device_plugin_timeout_fails_pass() {
    let h = harness(test_config(), &[], generic);
    h.mock.put_node_state(node_state(NODE, 2, vec![(PCI, 2)]));
    h.set_drain("DrainRequired", "DrainComplete");
    h.mock.add_pod(device_plugin_pod("device-plugin-abc", NODE, false));

    let err = h.pass().await.unwrap_err();
    assert!(matches!(err, ControllerError::DevicePlugin(_)));
    assert_eq!(h.reconciler.last_applied_generation(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disabled_drain_applies_without_request() {
    let config = Config {
        disable_drain: true,
        ..test_config()
    };
    let h = harness(config, &[(crate::featuregate::BLOCK_DEVICE_PLUGIN_UNTIL_CONFIGURED, false)], generic);
    h.mock.put_node_state(node_state(NODE, 2, vec![(PCI, 2)]));
    h.set_drain("Idle", "Idle");

    assert_eq!(h.pass().await.unwrap(), Outcome::Applied);
    assert_eq!(h.host.num_vfs(PCI), Some(2));
    assert!(h.mock.calls().node_state_annotations.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_systemd_mode_reports_boot_result() {
    let main = ScriptedPlugin::named("main");
    let applied = main.applied();
    let config = Config {
        configuration_mode: ConfigurationMode::Systemd,
        ..test_config()
    };
    let h = harness(config, &[], move |_| scripted(main, vec![]));
    h.mock.put_node_state(node_state(NODE, 4, vec![(PCI, 2)]));
    h.set_drain("Idle", "Idle");
    h.host.set_boot_result(BootResult {
        sync_status: SyncStatus::Failed,
        last_sync_error: Some("vf creation failed".to_string()),
    });

    assert_eq!(h.pass().await.unwrap(), Outcome::Applied);
    assert_eq!(applied.load(Ordering::SeqCst), 0);
    let status = h.mock.node_state(NODE).unwrap().status.unwrap();
    assert_eq!(status.sync_status, Some(SyncStatus::Failed));
    assert_eq!(status.last_sync_error.as_deref(), Some("vf creation failed"));
}

#[tokio::test(start_paused = true)]
async fn test_bridges_published_only_when_managed() {
    let bridge = BridgeStatus {
        name: "br-ex".to_string(),
        uplinks: vec!["ens1f0".to_string()],
    };

    let unmanaged = harness(test_config(), &[], generic);
    unmanaged.host.set_bridges(vec![bridge.clone()]);
    unmanaged.mock.put_node_state(node_state(NODE, 1, vec![]));
    unmanaged.set_drain("Idle", "Idle");
    unmanaged.pass().await.unwrap();
    assert!(unmanaged.mock.node_state(NODE).unwrap().status.unwrap().bridges.is_empty());

    let managed = harness(test_config(), &[(crate::featuregate::MANAGE_SOFTWARE_BRIDGES, true)], generic);
    managed.host.set_bridges(vec![bridge.clone()]);
    managed.mock.put_node_state(node_state(NODE, 1, vec![]));
    managed.set_drain("Idle", "Idle");
    managed.pass().await.unwrap();
    assert_eq!(managed.mock.node_state(NODE).unwrap().status.unwrap().bridges, vec![bridge]);
}

#[test]
fn test_requeue_intervals() {
    assert_eq!(Outcome::Converged.requeue_after(), STEADY_STATE_REQUEUE);
    assert_eq!(Outcome::AwaitingDrain.requeue_after(), DRAIN_POLL_REQUEUE);
}

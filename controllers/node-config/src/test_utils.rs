//! Fixtures shared by the unit tests

use crate::config::{ClusterType, Config, ConfigurationMode, Platform};
use crate::error::{HostError, PluginError};
use crate::host::{BootResult, Checkpoint, HostOps};
use crate::plugins::{DrainRequirement, VendorPlugin};
use crds::{
    BridgeStatus, InterfaceSpec, InterfaceStatus, NetworkNodeState, NetworkNodeStateSpec, NetworkNodeStateStatus,
};
use k8s_openapi::api::core::v1::{Container, Pod, PodSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const NODE: &str = "worker-0";
pub const NAMESPACE: &str = "network-operator";
pub const RESOURCE_PREFIX: &str = "dcops.microscaler.io";

pub fn test_config() -> Config {
    Config {
        node_name: NODE.to_string(),
        namespace: NAMESPACE.to_string(),
        cluster_type: ClusterType::Kubernetes,
        platform: Platform::BareMetal,
        use_external_drainer: false,
        disable_drain: false,
        configuration_mode: ConfigurationMode::Daemon,
        resource_prefix: RESOURCE_PREFIX.to_string(),
        feature_gates: HashMap::new(),
        host_root: PathBuf::from("/host"),
        probe_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
    }
}

/// A physical function as the host would report it
pub fn observed_interface(pci_address: &str, num_vfs: u32) -> InterfaceStatus {
    InterfaceStatus {
        pci_address: pci_address.to_string(),
        name: "ens1f0".to_string(),
        vendor: "8086".to_string(),
        device_id: "158b".to_string(),
        driver: "i40e".to_string(),
        mtu: Some(1500),
        link_type: Some("eth".to_string()),
        link_up: true,
        num_vfs,
        total_vfs: 8,
        ..Default::default()
    }
}

/// NetworkNodeState asking for `(pci_address, num_vfs)` pairs, without status
pub fn node_state(name: &str, generation: i64, interfaces: Vec<(&str, u32)>) -> NetworkNodeState {
    let spec = NetworkNodeStateSpec {
        interfaces: interfaces
            .into_iter()
            .map(|(pci_address, num_vfs)| InterfaceSpec {
                pci_address: pci_address.to_string(),
                num_vfs,
                ..Default::default()
            })
            .collect(),
    };
    let mut state = NetworkNodeState::new(name, spec);
    state.metadata.namespace = Some(NAMESPACE.to_string());
    state.metadata.generation = Some(generation);
    state
}

#[derive(Debug, Default)]
struct FakeHostState {
    interfaces: Vec<InterfaceStatus>,
    bridges: Vec<BridgeStatus>,
    checkpoint: Option<Checkpoint>,
    boot_result: Option<BootResult>,
    configured: Vec<String>,
    reboots: usize,
    discover_failures: u32,
}

/// In-memory host
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<FakeHostState>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_interfaces(interfaces: Vec<InterfaceStatus>) -> Self {
        let host = Self::new();
        host.state.lock().unwrap().interfaces = interfaces;
        host
    }

    /// What the daemon would publish for this host
    pub fn status(&self) -> NetworkNodeStateStatus {
        let state = self.state.lock().unwrap();
        NetworkNodeStateStatus {
            interfaces: state.interfaces.clone(),
            bridges: state.bridges.clone(),
            ..Default::default()
        }
    }

    pub fn num_vfs(&self, pci_address: &str) -> Option<u32> {
        self.state
            .lock()
            .unwrap()
            .interfaces
            .iter()
            .find(|i| i.pci_address == pci_address)
            .map(|i| i.num_vfs)
    }

    /// Changes the VF count behind the daemon's back
    pub fn set_num_vfs(&self, pci_address: &str, num_vfs: u32) {
        let mut state = self.state.lock().unwrap();
        if let Some(iface) = state.interfaces.iter_mut().find(|i| i.pci_address == pci_address) {
            iface.num_vfs = num_vfs;
        }
    }

    pub fn set_bridges(&self, bridges: Vec<BridgeStatus>) {
        self.state.lock().unwrap().bridges = bridges;
    }

    pub fn set_boot_result(&self, result: BootResult) {
        self.state.lock().unwrap().boot_result = Some(result);
    }

    pub fn fail_discovery(&self, n: u32) {
        self.state.lock().unwrap().discover_failures = n;
    }

    /// PCI addresses passed to `configure_interface`, in order
    pub fn configured(&self) -> Vec<String> {
        self.state.lock().unwrap().configured.clone()
    }

    pub fn reboots(&self) -> usize {
        self.state.lock().unwrap().reboots
    }

    pub fn checkpoint(&self) -> Option<Checkpoint> {
        self.state.lock().unwrap().checkpoint.clone()
    }
}

#[async_trait::async_trait]
impl HostOps for FakeHost {
    async fn discover_interfaces(&self) -> Result<Vec<InterfaceStatus>, HostError> {
        let mut state = self.state.lock().unwrap();
        if state.discover_failures > 0 {
            state.discover_failures -= 1;
            return Err(HostError::Command {
                command: "discover".to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(state.interfaces.clone())
    }

    async fn discover_bridges(&self) -> Result<Vec<BridgeStatus>, HostError> {
        Ok(self.state.lock().unwrap().bridges.clone())
    }

    async fn configure_interface(&self, desired: &InterfaceSpec) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap();
        let iface = state
            .interfaces
            .iter_mut()
            .find(|i| i.pci_address == desired.pci_address)
            .ok_or_else(|| HostError::InterfaceNotFound(desired.pci_address.clone()))?;
        if desired.num_vfs > iface.total_vfs {
            return Err(HostError::TooManyVfs {
                pci_address: desired.pci_address.clone(),
                requested: desired.num_vfs,
                total: iface.total_vfs,
            });
        }
        iface.num_vfs = desired.num_vfs;
        if let Some(mtu) = desired.mtu {
            iface.mtu = Some(mtu);
        }
        state.configured.push(desired.pci_address.clone());
        Ok(())
    }

    async fn reboot(&self) -> Result<(), HostError> {
        self.state.lock().unwrap().reboots += 1;
        Ok(())
    }

    async fn read_boot_result(&self) -> Result<Option<BootResult>, HostError> {
        Ok(self.state.lock().unwrap().boot_result.clone())
    }

    async fn read_checkpoint(&self) -> Result<Option<Checkpoint>, HostError> {
        Ok(self.state.lock().unwrap().checkpoint.clone())
    }

    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), HostError> {
        self.state.lock().unwrap().checkpoint = Some(checkpoint.clone());
        Ok(())
    }
}

/// Plugin returning a fixed answer and counting applies
#[derive(Debug, Clone)]
pub struct ScriptedPlugin {
    name: String,
    requirement: DrainRequirement,
    fail: bool,
    drift: Arc<AtomicBool>,
    applied: Arc<AtomicUsize>,
}

impl ScriptedPlugin {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            requirement: DrainRequirement::NONE,
            fail: false,
            drift: Arc::new(AtomicBool::new(false)),
            applied: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn requiring(mut self, requirement: DrainRequirement) -> Self {
        self.requirement = requirement;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Handle flipping what `check_status_changes` reports
    pub fn drift(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.drift)
    }

    /// Handle counting `apply` calls
    pub fn applied(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.applied)
    }
}

#[async_trait::async_trait]
impl VendorPlugin for ScriptedPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_node_state_change(&mut self, _desired: &NetworkNodeState) -> Result<DrainRequirement, PluginError> {
        if self.fail {
            return Err(PluginError::InvalidConfig {
                plugin: self.name.clone(),
                pci_address: "0000:00:00.0".to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        Ok(self.requirement)
    }

    async fn apply(&mut self) -> Result<(), PluginError> {
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn check_status_changes(&self, _desired: &NetworkNodeState) -> Result<bool, PluginError> {
        Ok(self.drift.load(Ordering::SeqCst))
    }
}

fn pod(namespace: &str, name: &str, node: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{name}")),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            containers: vec![Container {
                name: "main".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    }
}

fn managed_resources() -> ResourceRequirements {
    let quantities = BTreeMap::from([(format!("{RESOURCE_PREFIX}/intel_sriov_netdevice"), Quantity("1".to_string()))]);
    ResourceRequirements {
        limits: Some(quantities),
        ..Default::default()
    }
}

fn owned_by_daemonset(pod: &mut Pod, owner: &str) {
    pod.metadata.owner_references = Some(vec![OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: "DaemonSet".to_string(),
        name: owner.to_string(),
        uid: format!("uid-{owner}"),
        controller: Some(true),
        ..Default::default()
    }]);
}

/// Ordinary workload pod without device resources
pub fn workload_pod(namespace: &str, name: &str, node: &str) -> Pod {
    pod(namespace, name, node)
}

/// Pod whose init container holds a managed VF
pub fn managed_pod(namespace: &str, name: &str, node: &str) -> Pod {
    let mut pod = pod(namespace, name, node);
    if let Some(spec) = pod.spec.as_mut() {
        spec.init_containers = Some(vec![Container {
            name: "init".to_string(),
            resources: Some(managed_resources()),
            ..Default::default()
        }]);
    }
    pod
}

pub fn daemonset_pod(namespace: &str, name: &str, node: &str, managed: bool) -> Pod {
    let mut pod = if managed {
        managed_pod(namespace, name, node)
    } else {
        pod(namespace, name, node)
    };
    owned_by_daemonset(&mut pod, name);
    pod
}

pub fn mirror_pod(namespace: &str, name: &str, node: &str) -> Pod {
    let mut pod = pod(namespace, name, node);
    pod.metadata.annotations = Some(BTreeMap::from([(
        "kubernetes.io/config.mirror".to_string(),
        "mirror".to_string(),
    )]));
    pod
}

/// Device plugin pod in [`NAMESPACE`], optionally still blocked on configuration
pub fn device_plugin_pod(name: &str, node: &str, waiting: bool) -> Pod {
    let mut pod = pod(NAMESPACE, name, node);
    owned_by_daemonset(&mut pod, "network-device-plugin");
    pod.metadata.labels = Some(BTreeMap::from([("app".to_string(), "network-device-plugin".to_string())]));
    if waiting {
        pod.metadata.annotations = Some(BTreeMap::from([(
            crds::drain::DEVICE_PLUGIN_WAIT_CONFIG_ANNOTATION.to_string(),
            "true".to_string(),
        )]));
    }
    pod
}

//! Mock ClusterClient for unit testing
//!
//! Keeps nodes, pods, NetworkNodeStates and MachineConfigPools in memory and
//! records every mutating call so tests can assert on what the daemon did.
//! Failures (cordon errors, PDB-blocked evictions, forbidden evictions) can
//! be injected per test.

use crate::client::apply_annotation;
use crate::cluster_trait::ClusterClientTrait;
use crate::error::ClusterError;
use crate::models::{MachineConfigPoolState, PodSelector};
use crds::{NetworkNodeState, NetworkNodeStateStatus};
use k8s_openapi::api::core::v1::{Node, NodeSpec, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

type PodKey = (String, String);

/// Calls recorded by the mock
#[derive(Debug, Default, Clone)]
pub struct RecordedCalls {
    /// Cordon attempts, including failed ones
    pub cordon_attempts: usize,
    pub uncordon_calls: usize,
    /// `namespace/name` of every successful eviction
    pub evicted: Vec<String>,
    /// `namespace/name` of every delete
    pub deleted: Vec<String>,
    /// Every status written, oldest first
    pub status_updates: Vec<NetworkNodeStateStatus>,
    /// Every NetworkNodeState annotation change that altered the object
    pub node_state_annotations: Vec<(String, Option<String>)>,
    /// (pool, paused)
    pub pool_pause_calls: Vec<(String, bool)>,
}

#[derive(Debug, Default)]
struct Failures {
    cordon: u32,
    uncordon: u32,
    eviction_blocked: HashMap<PodKey, u32>,
    eviction_forbidden: HashSet<PodKey>,
    evicted_pods_linger: bool,
    list_pods: u32,
    node_state_annotation: u32,
}

#[derive(Debug, Clone)]
struct Respawn {
    label_key: String,
    label_value: String,
    annotations: BTreeMap<String, String>,
}

/// Mock ClusterClient for testing
#[derive(Clone, Default)]
pub struct MockClusterClient {
    pub(crate) node_states: Arc<Mutex<HashMap<String, NetworkNodeState>>>,
    pub(crate) nodes: Arc<Mutex<BTreeMap<String, Node>>>,
    pub(crate) pods: Arc<Mutex<BTreeMap<PodKey, Pod>>>,
    pub(crate) pools: Arc<Mutex<HashMap<String, MachineConfigPoolState>>>,
    pub(crate) node_pools: Arc<Mutex<HashMap<String, String>>>,
    failures: Arc<Mutex<Failures>>,
    calls: Arc<Mutex<RecordedCalls>>,
    respawn: Arc<Mutex<Option<Respawn>>>,
    generation_counter: Arc<Mutex<u64>>,
}

impl std::fmt::Debug for MockClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockClusterClient").finish_non_exhaustive()
    }
}

fn pod_key(pod: &Pod) -> PodKey {
    (
        pod.metadata.namespace.clone().unwrap_or_else(|| "default".to_string()),
        pod.metadata.name.clone().unwrap_or_default(),
    )
}

impl MockClusterClient {
    /// Create an empty mock cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a schedulable node (for test setup)
    pub fn add_node(&self, name: &str) {
        let node = Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(NodeSpec::default()),
            status: None,
        };
        self.nodes.lock().unwrap().insert(name.to_string(), node);
    }

    /// Add or replace a node object (for test setup)
    pub fn put_node(&self, node: Node) {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.nodes.lock().unwrap().insert(name, node);
    }

    /// Add or replace a NetworkNodeState (for test setup)
    pub fn put_node_state(&self, state: NetworkNodeState) {
        let name = state.metadata.name.clone().unwrap_or_default();
        self.node_states.lock().unwrap().insert(name, state);
    }

    /// Add a pod (for test setup)
    pub fn add_pod(&self, pod: Pod) {
        self.pods.lock().unwrap().insert(pod_key(&pod), pod);
    }

    /// Add a MachineConfigPool and assign nodes to it (for test setup)
    pub fn add_pool(&self, pool: MachineConfigPoolState, nodes: &[&str]) {
        let mut node_pools = self.node_pools.lock().unwrap();
        for node in nodes {
            node_pools.insert((*node).to_string(), pool.name.clone());
        }
        self.pools.lock().unwrap().insert(pool.name.clone(), pool);
    }

    /// Overwrite a pool's rollout conditions (for test setup)
    pub fn set_pool_conditions(&self, name: &str, updating: bool, degraded: bool) {
        if let Some(pool) = self.pools.lock().unwrap().get_mut(name) {
            pool.updating = updating;
            pool.degraded = degraded;
        }
    }

    /// Make the next `n` cordon calls fail with a server error
    pub fn fail_cordon(&self, n: u32) {
        self.failures.lock().unwrap().cordon = n;
    }

    /// Make the next `n` uncordon calls fail with a server error
    pub fn fail_uncordon(&self, n: u32) {
        self.failures.lock().unwrap().uncordon = n;
    }

    /// Answer 429 to the next `n` evictions of this pod
    pub fn block_eviction(&self, namespace: &str, name: &str, n: u32) {
        self.failures
            .lock()
            .unwrap()
            .eviction_blocked
            .insert((namespace.to_string(), name.to_string()), n);
    }

    /// Answer 403 to every eviction of this pod
    pub fn forbid_eviction(&self, namespace: &str, name: &str) {
        self.failures
            .lock()
            .unwrap()
            .eviction_forbidden
            .insert((namespace.to_string(), name.to_string()));
    }

    /// Keep evicted pods around (as if stuck terminating) until deleted
    pub fn linger_evicted_pods(&self, linger: bool) {
        self.failures.lock().unwrap().evicted_pods_linger = linger;
    }

    /// Make the next `n` pod list calls fail
    pub fn fail_list_pods(&self, n: u32) {
        self.failures.lock().unwrap().list_pods = n;
    }

    /// Make the next `n` NetworkNodeState annotation writes fail with a conflict
    pub fn fail_node_state_annotation(&self, n: u32) {
        self.failures.lock().unwrap().node_state_annotation = n;
    }

    /// Recreate deleted pods carrying `label_key=label_value`, like a
    /// DaemonSet would, with the given annotations on the replacement.
    pub fn respawn_deleted_pods(&self, label_key: &str, label_value: &str, annotations: &[(&str, &str)]) {
        *self.respawn.lock().unwrap() = Some(Respawn {
            label_key: label_key.to_string(),
            label_value: label_value.to_string(),
            annotations: annotations
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
        });
    }

    /// Snapshot of the recorded calls
    pub fn calls(&self) -> RecordedCalls {
        self.calls.lock().unwrap().clone()
    }

    /// Current copy of a NetworkNodeState
    pub fn node_state(&self, name: &str) -> Option<NetworkNodeState> {
        self.node_states.lock().unwrap().get(name).cloned()
    }

    /// Current copy of a node
    pub fn node(&self, name: &str) -> Option<Node> {
        self.nodes.lock().unwrap().get(name).cloned()
    }

    /// Whether the node is cordoned
    pub fn is_cordoned(&self, name: &str) -> bool {
        self.node(name)
            .and_then(|n| n.spec)
            .and_then(|s| s.unschedulable)
            .unwrap_or(false)
    }

    /// Current copy of a pod
    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.pods
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Names of all pods currently in the mock
    pub fn pod_names(&self) -> Vec<String> {
        self.pods.lock().unwrap().keys().map(|(_, name)| name.clone()).collect()
    }

    /// Current copy of a pool
    pub fn pool(&self, name: &str) -> Option<MachineConfigPoolState> {
        self.pools.lock().unwrap().get(name).cloned()
    }

    /// Sets an annotation directly, bypassing recording (for test setup)
    pub fn annotate_node_state(&self, name: &str, key: &str, value: &str) {
        if let Some(state) = self.node_states.lock().unwrap().get_mut(name) {
            apply_annotation(&mut state.metadata, key, Some(value));
        }
    }

    fn remove_pod(&self, key: &PodKey) {
        let removed = self.pods.lock().unwrap().remove(key);
        let Some(removed) = removed else {
            return;
        };

        let respawn = self.respawn.lock().unwrap().clone();
        let Some(respawn) = respawn else {
            return;
        };
        let matches = removed
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(&respawn.label_key))
            .is_some_and(|v| *v == respawn.label_value);
        if !matches {
            return;
        }

        let generation = {
            let mut counter = self.generation_counter.lock().unwrap();
            *counter += 1;
            *counter
        };
        let mut replacement = removed.clone();
        let base = key.1.rsplit_once("-gen").map_or(key.1.as_str(), |(b, _)| b);
        let name = format!("{base}-gen{generation}");
        replacement.metadata.name = Some(name.clone());
        replacement.metadata.uid = Some(format!("uid-{name}"));
        replacement.metadata.annotations = Some(respawn.annotations.clone());
        self.pods
            .lock()
            .unwrap()
            .insert((key.0.clone(), name), replacement);
    }
}

#[async_trait::async_trait]
impl ClusterClientTrait for MockClusterClient {
    async fn get_node_state(&self, name: &str) -> Result<NetworkNodeState, ClusterError> {
        self.node_state(name)
            .ok_or_else(|| ClusterError::NotFound(format!("NetworkNodeState {name}")))
    }

    async fn update_node_state_status(
        &self,
        name: &str,
        status: &NetworkNodeStateStatus,
    ) -> Result<NetworkNodeState, ClusterError> {
        let mut states = self.node_states.lock().unwrap();
        let state = states
            .get_mut(name)
            .ok_or_else(|| ClusterError::NotFound(format!("NetworkNodeState {name}")))?;
        state.status = Some(status.clone());
        self.calls.lock().unwrap().status_updates.push(status.clone());
        Ok(state.clone())
    }

    async fn set_node_state_annotation(
        &self,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<NetworkNodeState, ClusterError> {
        {
            let mut failures = self.failures.lock().unwrap();
            if failures.node_state_annotation > 0 {
                failures.node_state_annotation -= 1;
                return Err(ClusterError::Conflict(format!("annotation {key} on {name}")));
            }
        }

        let mut states = self.node_states.lock().unwrap();
        let state = states
            .get_mut(name)
            .ok_or_else(|| ClusterError::NotFound(format!("NetworkNodeState {name}")))?;
        if apply_annotation(&mut state.metadata, key, value) {
            self.calls
                .lock()
                .unwrap()
                .node_state_annotations
                .push((key.to_string(), value.map(str::to_string)));
        }
        Ok(state.clone())
    }

    async fn get_node(&self, name: &str) -> Result<Node, ClusterError> {
        self.node(name)
            .ok_or_else(|| ClusterError::NotFound(format!("Node {name}")))
    }

    async fn set_node_annotation(&self, name: &str, key: &str, value: Option<&str>) -> Result<(), ClusterError> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get_mut(name)
            .ok_or_else(|| ClusterError::NotFound(format!("Node {name}")))?;
        apply_annotation(&mut node.metadata, key, value);
        Ok(())
    }

    async fn set_node_unschedulable(&self, name: &str, unschedulable: bool) -> Result<(), ClusterError> {
        {
            let mut failures = self.failures.lock().unwrap();
            let mut calls = self.calls.lock().unwrap();
            if unschedulable {
                calls.cordon_attempts += 1;
                if failures.cordon > 0 {
                    failures.cordon -= 1;
                    return Err(ClusterError::Api {
                        code: 500,
                        message: format!("injected cordon failure for {name}"),
                    });
                }
            } else {
                calls.uncordon_calls += 1;
                if failures.uncordon > 0 {
                    failures.uncordon -= 1;
                    return Err(ClusterError::Api {
                        code: 500,
                        message: format!("injected uncordon failure for {name}"),
                    });
                }
            }
        }

        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get_mut(name)
            .ok_or_else(|| ClusterError::NotFound(format!("Node {name}")))?;
        node.spec.get_or_insert_with(Default::default).unschedulable = Some(unschedulable);
        Ok(())
    }

    async fn count_nodes(&self) -> Result<usize, ClusterError> {
        Ok(self.nodes.lock().unwrap().len())
    }

    async fn list_pods(&self, selector: &PodSelector) -> Result<Vec<Pod>, ClusterError> {
        {
            let mut failures = self.failures.lock().unwrap();
            if failures.list_pods > 0 {
                failures.list_pods -= 1;
                return Err(ClusterError::Api {
                    code: 503,
                    message: "injected list failure".to_string(),
                });
            }
        }

        Ok(self
            .pods
            .lock()
            .unwrap()
            .values()
            .filter(|p| selector.matches(p))
            .cloned()
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError> {
        Ok(self.pod(namespace, name))
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let key = (namespace.to_string(), name.to_string());
        let linger = {
            let mut failures = self.failures.lock().unwrap();
            if failures.eviction_forbidden.contains(&key) {
                return Err(ClusterError::Api {
                    code: 403,
                    message: format!("eviction of {namespace}/{name} forbidden"),
                });
            }
            if let Some(remaining) = failures.eviction_blocked.get_mut(&key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(ClusterError::TooManyRequests(format!(
                        "Cannot evict pod {namespace}/{name} as it would violate the pod's disruption budget"
                    )));
                }
            }
            failures.evicted_pods_linger
        };

        if !self.pods.lock().unwrap().contains_key(&key) {
            return Err(ClusterError::NotFound(format!("Pod {namespace}/{name}")));
        }

        self.calls.lock().unwrap().evicted.push(format!("{namespace}/{name}"));
        if !linger {
            self.remove_pod(&key);
        }
        Ok(())
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        _grace_period_seconds: Option<u32>,
    ) -> Result<(), ClusterError> {
        let key = (namespace.to_string(), name.to_string());
        self.calls.lock().unwrap().deleted.push(format!("{namespace}/{name}"));
        self.remove_pod(&key);
        Ok(())
    }

    async fn set_pod_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), ClusterError> {
        let mut pods = self.pods.lock().unwrap();
        let pod = pods
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| ClusterError::NotFound(format!("Pod {namespace}/{name}")))?;
        apply_annotation(&mut pod.metadata, key, value);
        Ok(())
    }

    async fn machine_config_pool_for_node(&self, node: &Node) -> Result<String, ClusterError> {
        let name = node.metadata.name.clone().unwrap_or_default();
        self.node_pools
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .ok_or_else(|| ClusterError::InvalidObject(format!("node {name} has no MachineConfigPool")))
    }

    async fn get_machine_config_pool(&self, name: &str) -> Result<MachineConfigPoolState, ClusterError> {
        self.pool(name)
            .ok_or_else(|| ClusterError::NotFound(format!("MachineConfigPool {name}")))
    }

    async fn set_machine_config_pool_paused(&self, name: &str, paused: bool) -> Result<(), ClusterError> {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools
            .get_mut(name)
            .ok_or_else(|| ClusterError::NotFound(format!("MachineConfigPool {name}")))?;
        pool.paused = paused;
        self.calls
            .lock()
            .unwrap()
            .pool_pause_calls
            .push((name.to_string(), paused));
        Ok(())
    }
}

//! ClusterClient trait for mocking
//!
//! This trait abstracts the Kubernetes API so the reconciler and drainer can
//! be unit tested against an in-memory mock. The concrete
//! [`KubeClusterClient`](crate::KubeClusterClient) implements it with kube-rs.

use crate::error::ClusterError;
use crate::models::{MachineConfigPoolState, PodSelector};
use crds::{NetworkNodeState, NetworkNodeStateStatus};
use k8s_openapi::api::core::v1::{Node, Pod};

/// Trait for cluster API operations
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
/// `NetworkNodeState` objects live in the namespace the client was built for.
#[async_trait::async_trait]
pub trait ClusterClientTrait: Send + Sync {
    // NetworkNodeState
    async fn get_node_state(&self, name: &str) -> Result<NetworkNodeState, ClusterError>;
    /// Replaces the whole status subresource
    async fn update_node_state_status(
        &self,
        name: &str,
        status: &NetworkNodeStateStatus,
    ) -> Result<NetworkNodeState, ClusterError>;
    /// Sets (`Some`) or removes (`None`) one annotation, retrying on conflict.
    /// Returns the object as stored after the write.
    async fn set_node_state_annotation(
        &self,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<NetworkNodeState, ClusterError>;

    // Nodes
    async fn get_node(&self, name: &str) -> Result<Node, ClusterError>;
    async fn set_node_annotation(&self, name: &str, key: &str, value: Option<&str>) -> Result<(), ClusterError>;
    /// Cordon (`true`) or uncordon (`false`)
    async fn set_node_unschedulable(&self, name: &str, unschedulable: bool) -> Result<(), ClusterError>;
    async fn count_nodes(&self) -> Result<usize, ClusterError>;

    // Pods
    async fn list_pods(&self, selector: &PodSelector) -> Result<Vec<Pod>, ClusterError>;
    /// `Ok(None)` when the pod doesn't exist
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, ClusterError>;
    /// Creates an Eviction, honouring PodDisruptionBudgets
    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;
    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        grace_period_seconds: Option<u32>,
    ) -> Result<(), ClusterError>;
    async fn set_pod_annotation(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
        value: Option<&str>,
    ) -> Result<(), ClusterError>;

    // OpenShift MachineConfigPools
    /// Name of the pool that renders the node's current config
    async fn machine_config_pool_for_node(&self, node: &Node) -> Result<String, ClusterError>;
    async fn get_machine_config_pool(&self, name: &str) -> Result<MachineConfigPoolState, ClusterError>;
    async fn set_machine_config_pool_paused(&self, name: &str, paused: bool) -> Result<(), ClusterError>;
}

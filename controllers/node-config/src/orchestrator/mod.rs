//! Platform hooks run around a drain.
//!
//! Plain Kubernetes needs nothing. OpenShift's machine-config operator
//! would otherwise roll its own config out (and reboot) while we drain, so
//! its pool is paused for the duration.

mod kubernetes;
mod openshift;

pub use kubernetes::KubernetesOrchestrator;
pub use openshift::OpenShiftOrchestrator;

use crate::config::ClusterType;
use crate::error::DrainError;
use cluster_client::ClusterClientTrait;
use k8s_openapi::api::core::v1::Node;
use std::sync::Arc;

/// Before/after hooks around a node drain
///
/// Returning `Ok(false)` means "not yet": the platform isn't ready and the
/// caller should come back later. It is not an error.
#[async_trait::async_trait]
pub trait DrainOrchestrator: Send + Sync {
    /// Cluster flavour, for logs
    fn cluster_type(&self) -> ClusterType;

    /// Called before the node is cordoned
    async fn before_drain_node(&self, node: &Node) -> Result<bool, DrainError>;

    /// Called after the node is uncordoned
    async fn after_complete_drain_node(&self, node: &Node) -> Result<bool, DrainError>;
}

/// Builds the orchestrator for the configured cluster type
pub fn for_cluster_type(
    cluster_type: ClusterType,
    client: Arc<dyn ClusterClientTrait>,
) -> Arc<dyn DrainOrchestrator> {
    match cluster_type {
        ClusterType::Kubernetes => Arc::new(KubernetesOrchestrator),
        ClusterType::OpenShift => Arc::new(OpenShiftOrchestrator::new(client)),
    }
}

pub(crate) fn node_name(node: &Node) -> &str {
    node.metadata.name.as_deref().unwrap_or("<unknown>")
}

use super::DrainOrchestrator;
use crate::config::ClusterType;
use crate::error::DrainError;
use k8s_openapi::api::core::v1::Node;

/// Vanilla Kubernetes: nothing to coordinate with
#[derive(Debug, Clone, Copy, Default)]
pub struct KubernetesOrchestrator;

#[async_trait::async_trait]
impl DrainOrchestrator for KubernetesOrchestrator {
    fn cluster_type(&self) -> ClusterType {
        ClusterType::Kubernetes
    }

    async fn before_drain_node(&self, _node: &Node) -> Result<bool, DrainError> {
        Ok(true)
    }

    async fn after_complete_drain_node(&self, _node: &Node) -> Result<bool, DrainError> {
        Ok(true)
    }
}

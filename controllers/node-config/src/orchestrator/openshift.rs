use super::{node_name, DrainOrchestrator};
use crate::config::ClusterType;
use crate::error::DrainError;
use cluster_client::ClusterClientTrait;
use k8s_openapi::api::core::v1::Node;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct PoolTracking {
    /// pool -> nodes currently draining in it
    draining: HashMap<String, HashSet<String>>,
    /// pools this process paused, and is therefore allowed to unpause
    paused_by_us: HashSet<String>,
}

/// OpenShift: hold the node's MachineConfigPool paused while it drains
pub struct OpenShiftOrchestrator {
    client: Arc<dyn ClusterClientTrait>,
    tracking: Mutex<PoolTracking>,
}

impl std::fmt::Debug for OpenShiftOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenShiftOrchestrator").finish_non_exhaustive()
    }
}

impl OpenShiftOrchestrator {
    pub fn new(client: Arc<dyn ClusterClientTrait>) -> Self {
        Self {
            client,
            tracking: Mutex::new(PoolTracking::default()),
        }
    }

    fn tracking(&self) -> std::sync::MutexGuard<'_, PoolTracking> {
        self.tracking.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Nodes this process has marked draining in `pool`
    pub fn draining_in_pool(&self, pool: &str) -> usize {
        self.tracking().draining.get(pool).map_or(0, HashSet::len)
    }
}

#[async_trait::async_trait]
impl DrainOrchestrator for OpenShiftOrchestrator {
    fn cluster_type(&self) -> ClusterType {
        ClusterType::OpenShift
    }

    async fn before_drain_node(&self, node: &Node) -> Result<bool, DrainError> {
        let name = node_name(node);
        let pool_name = self.client.machine_config_pool_for_node(node).await?;
        let pool = self.client.get_machine_config_pool(&pool_name).await?;

        if !pool.paused {
            if !pool.is_settled() {
                info!(
                    "MachineConfigPool {} is updating or degraded, waiting before draining {}",
                    pool_name, name
                );
                return Ok(false);
            }

            info!("Pausing MachineConfigPool {} to drain {}", pool_name, name);
            self.client.set_machine_config_pool_paused(&pool_name, true).await?;
            self.tracking().paused_by_us.insert(pool_name.clone());
        } else {
            debug!("MachineConfigPool {} already paused", pool_name);
        }

        self.tracking()
            .draining
            .entry(pool_name)
            .or_default()
            .insert(name.to_string());
        Ok(true)
    }

    async fn after_complete_drain_node(&self, node: &Node) -> Result<bool, DrainError> {
        let name = node_name(node);
        let pool_name = self.client.machine_config_pool_for_node(node).await?;

        let unpause = {
            let mut tracking = self.tracking();
            let remaining = tracking.draining.get_mut(&pool_name).map_or(0, |nodes| {
                nodes.remove(name);
                nodes.len()
            });
            if remaining == 0 {
                tracking.draining.remove(&pool_name);
                tracking.paused_by_us.remove(&pool_name)
            } else {
                debug!(
                    "{} other node(s) still draining in MachineConfigPool {}",
                    remaining, pool_name
                );
                false
            }
        };

        if unpause {
            info!("Unpausing MachineConfigPool {} after draining {}", pool_name, name);
            if let Err(e) = self.client.set_machine_config_pool_paused(&pool_name, false).await {
                // Keep ownership so the next completion retries the unpause
                self.tracking().paused_by_us.insert(pool_name);
                return Err(e.into());
            }
        }

        Ok(true)
    }
}

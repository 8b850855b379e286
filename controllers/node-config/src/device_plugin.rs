//! Device plugin pod handling
//!
//! The device plugin advertises VFs to the scheduler. After VFs change it
//! has to be restarted to rediscover them. When started it annotates its
//! own pod with [`DEVICE_PLUGIN_WAIT_CONFIG_ANNOTATION`] and holds off
//! advertising until the daemon removes it.

use crate::error::ControllerError;
use cluster_client::{ClusterClientTrait, PodSelector};
use crds::drain::DEVICE_PLUGIN_WAIT_CONFIG_ANNOTATION;
use k8s_openapi::api::core::v1::Pod;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Label selecting the device plugin DaemonSet's pods
pub const DEVICE_PLUGIN_SELECTOR: &str = "app=network-device-plugin";

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// The device plugin pod(s) running on this node
pub struct DevicePlugin {
    client: Arc<dyn ClusterClientTrait>,
    namespace: String,
    node_name: String,
    poll_interval: Duration,
    timeout: Duration,
}

impl std::fmt::Debug for DevicePlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevicePlugin")
            .field("namespace", &self.namespace)
            .field("node_name", &self.node_name)
            .finish_non_exhaustive()
    }
}

fn is_waiting(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(DEVICE_PLUGIN_WAIT_CONFIG_ANNOTATION))
}

fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

impl DevicePlugin {
    pub fn new(client: Arc<dyn ClusterClientTrait>, namespace: &str, node_name: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            node_name: node_name.to_string(),
            poll_interval: POLL_INTERVAL,
            timeout: WAIT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timing(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.timeout = timeout;
        self
    }

    async fn pods(&self) -> Result<Vec<Pod>, ControllerError> {
        let selector = PodSelector::on_node(&self.node_name)
            .in_namespace(&self.namespace)
            .with_labels(DEVICE_PLUGIN_SELECTOR);
        Ok(self.client.list_pods(&selector).await?)
    }

    /// Deletes the device plugin pods on this node so the DaemonSet
    /// recreates them. Returns the UIDs of the deleted pods.
    pub async fn restart(&self) -> Result<Vec<String>, ControllerError> {
        let pods = self.pods().await?;
        if pods.is_empty() {
            info!("No device plugin pod on {}, nothing to restart", self.node_name);
            return Ok(Vec::new());
        }

        let mut uids = Vec::with_capacity(pods.len());
        for pod in &pods {
            let name = pod_name(pod);
            info!("Restarting device plugin pod {}/{}", self.namespace, name);
            self.client.delete_pod(&self.namespace, name, None).await?;
            uids.extend(pod.metadata.uid.clone());
        }
        Ok(uids)
    }

    /// Polls until a pod that is not one of `old_uids` shows up blocked on
    /// configuration. `Ok(None)` when no pod was restarted.
    pub async fn wait_for_blocked_replacement(&self, old_uids: &[String]) -> Result<Option<Pod>, ControllerError> {
        if old_uids.is_empty() {
            return Ok(None);
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            match self.pods().await {
                Ok(pods) => {
                    let replacement = pods.into_iter().find(|p| {
                        is_waiting(p) && !p.metadata.uid.as_ref().is_some_and(|uid| old_uids.contains(uid))
                    });
                    if let Some(pod) = replacement {
                        debug!("Device plugin pod {} is waiting for configuration", pod_name(&pod));
                        return Ok(Some(pod));
                    }
                }
                Err(e) => warn!("Listing device plugin pods failed: {}", e),
            }

            if Instant::now() >= deadline {
                return Err(ControllerError::DevicePlugin(format!(
                    "device plugin on {} did not re-register within {:?}",
                    self.node_name, self.timeout
                )));
            }
            sleep(self.poll_interval).await;
        }
    }

    /// Lets one blocked pod start advertising
    pub async fn unblock(&self, pod: &Pod) -> Result<(), ControllerError> {
        let name = pod_name(pod);
        self.client
            .set_pod_annotation(&self.namespace, name, DEVICE_PLUGIN_WAIT_CONFIG_ANNOTATION, None)
            .await?;
        info!("Unblocked device plugin pod {}/{}", self.namespace, name);
        Ok(())
    }

    /// Unblocks every device plugin pod on this node still waiting.
    /// Returns how many were unblocked.
    pub async fn unblock_waiting(&self) -> Result<usize, ControllerError> {
        let mut unblocked = 0;
        for pod in self.pods().await?.iter().filter(|p| is_waiting(p)) {
            self.unblock(pod).await?;
            unblocked += 1;
        }
        Ok(unblocked)
    }
}

//! Node drain, similar to `kubectl drain`.
//!
//! Cordons the node, then evicts pods through the Eviction API so
//! PodDisruptionBudgets are honoured. A partial drain only touches pods that
//! request one of the managed device resources; a full drain (before a
//! reboot) evicts everything evictable.
//!
//! DaemonSet pods are normally left alone since the DaemonSet controller
//! ignores cordons. The exception is a DaemonSet pod holding a managed
//! device: it would keep the device busy during reconfiguration, so it is
//! evicted like any other.

use crate::backoff::ExponentialBackoff;
use crate::error::DrainError;
use crate::orchestrator::{node_name, DrainOrchestrator};
use cluster_client::{ClusterClientTrait, PodSelector};
use futures::{stream, StreamExt};
use k8s_openapi::api::core::v1::{Node, Pod};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

// Evictions in flight at once, including the wait for the pod to go away
const CONCURRENT_EVICTIONS: usize = 5;

// Pause between eviction attempts blocked by a disruption budget, as kubectl does
const EVICTION_RETRY_INTERVAL: Duration = Duration::from_secs(5);

const DELETION_CHECK_INTERVAL: Duration = Duration::from_secs(2);

/// Wall-clock budget for the whole eviction phase of one drain
pub const DEFAULT_EVICTION_TIMEOUT: Duration = Duration::from_secs(90);

const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

/// One failed eviction attempt, reported as it happens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionFailure {
    pub namespace: String,
    pub pod: String,
    /// 1-based attempt number for this pod
    pub attempt: u32,
    pub reason: String,
    /// Whether the drainer will try this pod again
    pub will_retry: bool,
}

/// Callback receiving eviction failures
pub type EvictionErrorHandler<'a> = dyn Fn(&EvictionFailure) + Send + Sync + 'a;

/// Cordons, drains and uncordons one node
pub struct Drainer {
    client: Arc<dyn ClusterClientTrait>,
    orchestrator: Arc<dyn DrainOrchestrator>,
    resource_prefix: String,
    cancel: CancellationToken,
    eviction_timeout: Duration,
    cordon_backoff: ExponentialBackoff,
}

impl std::fmt::Debug for Drainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Drainer")
            .field("cluster_type", &self.orchestrator.cluster_type())
            .field("resource_prefix", &self.resource_prefix)
            .field("eviction_timeout", &self.eviction_timeout)
            .finish_non_exhaustive()
    }
}

impl Drainer {
    pub fn new(
        client: Arc<dyn ClusterClientTrait>,
        orchestrator: Arc<dyn DrainOrchestrator>,
        resource_prefix: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            orchestrator,
            resource_prefix: resource_prefix.into(),
            cancel,
            eviction_timeout: DEFAULT_EVICTION_TIMEOUT,
            cordon_backoff: ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(10), 3),
        }
    }

    #[must_use]
    pub fn with_eviction_timeout(mut self, timeout: Duration) -> Self {
        self.eviction_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_cordon_backoff(mut self, backoff: ExponentialBackoff) -> Self {
        self.cordon_backoff = backoff;
        self
    }

    /// Cordons `node` and evicts the targeted pods.
    ///
    /// Returns `Ok(false)` when the platform isn't ready for a drain yet.
    /// A single-node cluster is never fully drained: there is nowhere for
    /// the pods to go. The cordon is left in place on error.
    #[instrument(skip_all, fields(node = %node_name(node), full_drain = full_drain, single_node = single_node))]
    pub async fn drain_node(
        &self,
        node: &Node,
        full_drain: bool,
        single_node: bool,
        on_error: &EvictionErrorHandler<'_>,
    ) -> Result<bool, DrainError> {
        let name = node_name(node).to_string();

        if single_node && full_drain {
            info!("Single node cluster, skipping full drain of {}", name);
            return Ok(true);
        }

        if !self.orchestrator.before_drain_node(node).await? {
            info!(
                "{} orchestrator not ready to drain {}, will retry",
                self.orchestrator.cluster_type(),
                name
            );
            return Ok(false);
        }

        self.cordon(&name).await?;

        let pods = self
            .client
            .list_pods(&PodSelector::on_node(&name))
            .await
            .map_err(|source| DrainError::ListPods {
                node: name.clone(),
                source,
            })?;
        let targets = select_pods(pods, full_drain, &self.resource_prefix);
        if targets.is_empty() {
            info!("No pods to evict from {}", name);
            return Ok(true);
        }
        info!("Evicting {} pod(s) from {}", targets.len(), name);

        let deadline = Instant::now() + self.eviction_timeout;
        let results: Vec<Result<(), DrainError>> = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(DrainError::Cancelled(name)),
            results = stream::iter(targets)
                .map(|pod| self.evict_and_wait(pod, deadline, on_error))
                .buffer_unordered(CONCURRENT_EVICTIONS)
                .collect::<Vec<_>>() => results,
        };

        if let Some(err) = results.into_iter().find_map(Result::err) {
            return Err(err);
        }
        info!("Drained {}", name);
        Ok(true)
    }

    /// Uncordons `node` and runs the platform's post-drain hook, whose
    /// answer is passed through
    #[instrument(skip_all, fields(node = %node_name(node)))]
    pub async fn complete_drain_node(&self, node: &Node) -> Result<bool, DrainError> {
        let name = node_name(node);
        self.client
            .set_node_unschedulable(name, false)
            .await
            .map_err(|source| DrainError::Uncordon {
                node: name.to_string(),
                source,
            })?;
        info!("Uncordoned {}", name);

        self.orchestrator.after_complete_drain_node(node).await
    }

    async fn cordon(&self, node: &str) -> Result<(), DrainError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.client.set_node_unschedulable(node, true).await {
                Ok(()) => {
                    info!("Cordoned {}", node);
                    return Ok(());
                }
                Err(err) => err,
            };

            let Some(delay) = self.cordon_backoff.delay_after(attempt) else {
                return Err(DrainError::Cordon {
                    node: node.to_string(),
                    attempts: attempt,
                    source: err,
                });
            };
            warn!(
                "Cordon of {} failed (attempt {}/{}): {}. Retrying in {:?}",
                node,
                attempt,
                self.cordon_backoff.max_attempts(),
                err,
                delay
            );
            tokio::select! {
                () = self.cancel.cancelled() => return Err(DrainError::Cancelled(node.to_string())),
                () = sleep(delay) => {}
            }
        }
    }

    async fn evict_and_wait(&self, pod: Pod, deadline: Instant, on_error: &EvictionErrorHandler<'_>) -> Result<(), DrainError> {
        let namespace = pod.metadata.namespace.clone().unwrap_or_else(|| "default".to_string());
        let name = pod.metadata.name.clone().unwrap_or_default();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.client.evict_pod(&namespace, &name).await {
                Ok(()) => {
                    debug!("Created eviction for {}/{}", namespace, name);
                    break;
                }
                Err(err) if err.is_not_found() => return Ok(()),
                Err(err) => err,
            };

            let retriable = err.is_retriable_eviction();
            let out_of_time = Instant::now() + EVICTION_RETRY_INTERVAL >= deadline;
            on_error(&EvictionFailure {
                namespace: namespace.clone(),
                pod: name.clone(),
                attempt,
                reason: err.to_string(),
                will_retry: retriable && !out_of_time,
            });

            if !retriable {
                return Err(DrainError::Eviction {
                    pod: format!("{namespace}/{name}"),
                    source: err,
                });
            }
            if out_of_time {
                warn!("Eviction of {}/{} still blocked at timeout, deleting it", namespace, name);
                return self.force_delete(&namespace, &name).await;
            }
            sleep(EVICTION_RETRY_INTERVAL).await;
        }

        self.wait_for_deletion(&pod, &namespace, &name, deadline).await
    }

    async fn wait_for_deletion(&self, pod: &Pod, namespace: &str, name: &str, deadline: Instant) -> Result<(), DrainError> {
        loop {
            match self.client.get_pod(namespace, name).await {
                Ok(None) => return Ok(()),
                // Same name, new pod: ours is gone
                Ok(Some(current)) if current.metadata.uid != pod.metadata.uid => return Ok(()),
                Ok(Some(_)) => debug!("Pod {}/{} not yet deleted", namespace, name),
                Err(e) => warn!("Could not check whether {}/{} is deleted: {}", namespace, name, e),
            }

            if Instant::now() >= deadline {
                warn!("Pod {}/{} outlived the eviction timeout, deleting it", namespace, name);
                return self.force_delete(namespace, name).await;
            }
            sleep(DELETION_CHECK_INTERVAL).await;
        }
    }

    async fn force_delete(&self, namespace: &str, name: &str) -> Result<(), DrainError> {
        self.client
            .delete_pod(namespace, name, Some(0))
            .await
            .map_err(|source| DrainError::ForceDelete {
                pod: format!("{namespace}/{name}"),
                source,
            })
    }
}

/// Whether any container asks for a resource under `prefix`
pub fn requests_managed_resource(pod: &Pod, prefix: &str) -> bool {
    let Some(spec) = pod.spec.as_ref() else {
        return false;
    };
    spec.containers
        .iter()
        .chain(spec.init_containers.iter().flatten())
        .filter_map(|c| c.resources.as_ref())
        .any(|r| {
            r.requests
                .iter()
                .chain(r.limits.iter())
                .flat_map(|m| m.keys())
                .any(|k| k.starts_with(prefix))
        })
}

fn is_daemonset_pod(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .iter()
        .flatten()
        .any(|r| r.controller == Some(true) && r.kind == "DaemonSet")
}

fn is_mirror_pod(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(MIRROR_POD_ANNOTATION))
}

/// Pods a drain should evict
pub fn select_pods(pods: Vec<Pod>, full_drain: bool, prefix: &str) -> Vec<Pod> {
    pods.into_iter()
        .filter(|pod| {
            if is_mirror_pod(pod) {
                return false;
            }
            let managed = requests_managed_resource(pod, prefix);
            if is_daemonset_pod(pod) {
                return managed;
            }
            full_drain || managed
        })
        .collect()
}

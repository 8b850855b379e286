//! Drain executor
//!
//! The in-process drain authority, used unless an external drainer owns
//! the node. Watches the desired-drain key the reconciler writes and
//! answers through the current-drain key, which only this module writes.
//! It also seeds both keys with `Idle` on objects that lack them.

use crate::backoff::RequeueBackoff;
use crate::drain::{Drainer, EvictionFailure};
use crate::error::ControllerError;
use crate::metrics::Metrics;
use chrono::Utc;
use cluster_client::ClusterClientTrait;
use crds::drain::{
    CurrentDrainState, DesiredDrainState, CURRENT_DRAIN_ANNOTATION, DESIRED_DRAIN_ANNOTATION,
    EXTERNAL_DRAINER_ANNOTATION, NODE_DRAIN_ANNOTATION,
};
use crds::{NetworkNodeState, SyncStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

const IDLE_REQUEUE: Duration = Duration::from_secs(30);
const ACTIVE_REQUEUE: Duration = Duration::from_secs(5);

/// What an executor pass ended with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorOutcome {
    /// An external drainer owns this node
    External,
    /// Missing drain keys were seeded
    Initialized,
    /// Nothing requested
    Idle,
    /// Drain started but not finished (orchestrator not ready yet)
    Draining,
    /// Node drained, waiting for the reconciler to apply
    DrainComplete,
    /// Uncordon not finished yet
    Completing,
}

impl ExecutorOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorOutcome::External => "External",
            ExecutorOutcome::Initialized => "Initialized",
            ExecutorOutcome::Idle => "Idle",
            ExecutorOutcome::Draining => "Draining",
            ExecutorOutcome::DrainComplete => "DrainComplete",
            ExecutorOutcome::Completing => "Completing",
        }
    }

    pub fn requeue_after(&self) -> Duration {
        match self {
            ExecutorOutcome::External | ExecutorOutcome::Idle => IDLE_REQUEUE,
            _ => ACTIVE_REQUEUE,
        }
    }
}

pub struct DrainExecutor {
    client: Arc<dyn ClusterClientTrait>,
    drainer: Drainer,
    metrics: Arc<Metrics>,
    node_name: String,
    backoff: RequeueBackoff,
}

impl std::fmt::Debug for DrainExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainExecutor")
            .field("node_name", &self.node_name)
            .finish_non_exhaustive()
    }
}

impl DrainExecutor {
    pub fn new(client: Arc<dyn ClusterClientTrait>, drainer: Drainer, node_name: &str, metrics: Arc<Metrics>) -> Self {
        Self {
            client,
            drainer,
            metrics,
            node_name: node_name.to_string(),
            backoff: RequeueBackoff::new(1, 30),
        }
    }

    pub fn error_backoff(&self, name: &str) -> Duration {
        self.backoff.on_error(name)
    }

    pub fn reset_backoff(&self, name: &str) {
        self.backoff.on_success(name);
    }

    #[instrument(skip_all, fields(node = %self.node_name))]
    pub async fn reconcile(&self, state: &NetworkNodeState) -> Result<ExecutorOutcome, ControllerError> {
        if state.has_annotation(EXTERNAL_DRAINER_ANNOTATION) {
            debug!("External drainer in charge, skipping");
            return Ok(ExecutorOutcome::External);
        }

        let Some(pair) = state.drain_pair()? else {
            self.initialize(state).await?;
            return Ok(ExecutorOutcome::Initialized);
        };

        match (pair.desired, pair.current) {
            (DesiredDrainState::Idle, CurrentDrainState::Idle) => Ok(ExecutorOutcome::Idle),
            (DesiredDrainState::Idle, _) => self.complete(state).await,
            (desired, CurrentDrainState::Idle | CurrentDrainState::Draining) => {
                if pair.current == CurrentDrainState::Idle {
                    self.set_current(state, CurrentDrainState::Draining).await?;
                }
                self.drain(state, desired == DesiredDrainState::RebootRequired).await
            }
            (_, CurrentDrainState::DrainComplete) => Ok(ExecutorOutcome::DrainComplete),
        }
    }

    async fn initialize(&self, state: &NetworkNodeState) -> Result<(), ControllerError> {
        let name = name_of(state);
        for key in [DESIRED_DRAIN_ANNOTATION, CURRENT_DRAIN_ANNOTATION] {
            if !state.has_annotation(key) {
                self.client.set_node_state_annotation(name, key, Some("Idle")).await?;
            }
        }
        info!("Initialised drain annotations on {}", name);
        Ok(())
    }

    async fn set_current(&self, state: &NetworkNodeState, current: CurrentDrainState) -> Result<(), ControllerError> {
        self.client
            .set_node_state_annotation(name_of(state), CURRENT_DRAIN_ANNOTATION, Some(current.as_str()))
            .await?;
        self.client
            .set_node_annotation(&self.node_name, NODE_DRAIN_ANNOTATION, Some(current.as_str()))
            .await?;
        debug!("Current drain state is now {}", current);
        Ok(())
    }

    async fn drain(&self, state: &NetworkNodeState, full_drain: bool) -> Result<ExecutorOutcome, ControllerError> {
        self.metrics.set_draining(true);
        let node = self.client.get_node(&self.node_name).await?;
        let single_node = self.client.count_nodes().await? == 1;

        let on_error = |failure: &EvictionFailure| {
            self.metrics.record_eviction_failure();
            warn!(
                "Eviction of {}/{} failed (attempt {}, retrying: {}): {}",
                failure.namespace, failure.pod, failure.attempt, failure.will_retry, failure.reason
            );
        };

        match self.drainer.drain_node(&node, full_drain, single_node, &on_error).await {
            Ok(true) => {
                self.set_current(state, CurrentDrainState::DrainComplete).await?;
                self.metrics.set_draining(false);
                self.metrics.record_drain_completed();
                info!("Node {} drained", self.node_name);
                Ok(ExecutorOutcome::DrainComplete)
            }
            Ok(false) => {
                info!("Drain of {} not ready to proceed, will retry", self.node_name);
                Ok(ExecutorOutcome::Draining)
            }
            Err(e) => {
                error!("Drain of {} failed: {}", self.node_name, e);
                self.report_failure(state, &e.to_string()).await?;
                Err(e.into())
            }
        }
    }

    async fn complete(&self, state: &NetworkNodeState) -> Result<ExecutorOutcome, ControllerError> {
        let node = self.client.get_node(&self.node_name).await?;
        if !self.drainer.complete_drain_node(&node).await? {
            return Ok(ExecutorOutcome::Completing);
        }
        self.set_current(state, CurrentDrainState::Idle).await?;
        self.metrics.set_draining(false);
        info!("Node {} returned to service", self.node_name);
        Ok(ExecutorOutcome::Idle)
    }

    async fn report_failure(&self, state: &NetworkNodeState, message: &str) -> Result<(), ControllerError> {
        let mut status = state.status.clone().unwrap_or_default();
        status.sync_status = Some(SyncStatus::Failed);
        status.last_sync_error = Some(message.to_string());
        status.last_sync_time = Some(Utc::now());
        self.client.update_node_state_status(name_of(state), &status).await?;
        Ok(())
    }
}

fn name_of(state: &NetworkNodeState) -> &str {
    state.metadata.name.as_deref().unwrap_or_default()
}

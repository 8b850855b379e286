//! NetworkNodeState watchers.
//!
//! Both loops (node reconciler and drain executor) watch the same single
//! object, this node's NetworkNodeState, through `kube_runtime::Controller`.
//! Each runs with one worker so passes on the object never overlap, and
//! requeues on its own schedule since waiting for the other loop means
//! returning and being called again.

use crate::drain_executor::DrainExecutor;
use crate::error::ControllerError;
use crate::metrics::Metrics;
use crate::reconciler::NodeReconciler;
use crds::NetworkNodeState;
use futures::StreamExt;
use kube::{Api, ResourceExt};
use kube_runtime::{
    controller::{Action, Config as ControllerConfig},
    watcher, Controller,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

/// One loop over the node's NetworkNodeState
#[async_trait::async_trait]
pub trait NodeStateHandler: Send + Sync + 'static {
    /// Loop name used in logs and metric labels
    const NAME: &'static str;

    /// One pass. Returns the outcome label and when to run again.
    async fn handle(&self, state: &NetworkNodeState) -> Result<(&'static str, Duration), ControllerError>;

    /// Requeue delay after a failed pass
    fn on_error(&self, name: &str) -> Duration;

    fn on_success(&self, name: &str);
}

#[async_trait::async_trait]
impl NodeStateHandler for NodeReconciler {
    const NAME: &'static str = "reconciler";

    async fn handle(&self, state: &NetworkNodeState) -> Result<(&'static str, Duration), ControllerError> {
        let outcome = self.reconcile(state).await?;
        Ok((outcome.as_str(), outcome.requeue_after()))
    }

    fn on_error(&self, name: &str) -> Duration {
        self.error_backoff(name)
    }

    fn on_success(&self, name: &str) {
        self.reset_backoff(name);
    }
}

#[async_trait::async_trait]
impl NodeStateHandler for DrainExecutor {
    const NAME: &'static str = "drain-executor";

    async fn handle(&self, state: &NetworkNodeState) -> Result<(&'static str, Duration), ControllerError> {
        let outcome = self.reconcile(state).await?;
        Ok((outcome.as_str(), outcome.requeue_after()))
    }

    fn on_error(&self, name: &str) -> Duration {
        self.error_backoff(name)
    }

    fn on_success(&self, name: &str) {
        self.reset_backoff(name);
    }
}

struct Context<H> {
    handler: Arc<H>,
    metrics: Arc<Metrics>,
}

/// Runs a handler against every change of the node's NetworkNodeState.
pub async fn watch_node_state<H: NodeStateHandler>(
    api: Api<NetworkNodeState>,
    node_name: &str,
    handler: Arc<H>,
    metrics: Arc<Metrics>,
) -> Result<(), ControllerError> {
    info!("Starting {} watcher for NetworkNodeState {}", H::NAME, node_name);

    let error_policy = |obj: Arc<NetworkNodeState>, error: &ControllerError, ctx: Arc<Context<H>>| {
        let delay = ctx.handler.on_error(&obj.name_any());
        ctx.metrics.record_reconcile_error(H::NAME);
        error!("{} pass on {} failed, retrying in {:?}: {}", H::NAME, obj.name_any(), delay, error);
        Action::requeue(delay)
    };

    let reconcile = |obj: Arc<NetworkNodeState>, ctx: Arc<Context<H>>| async move {
        debug!("{} pass on {} (generation {})", H::NAME, obj.name_any(), obj.metadata.generation.unwrap_or_default());
        let (outcome, requeue) = ctx.handler.handle(&obj).await?;
        ctx.handler.on_success(&obj.name_any());
        ctx.metrics.record_reconcile(H::NAME, outcome);
        debug!("{} outcome {}, next pass in {:?}", H::NAME, outcome, requeue);
        Ok::<Action, ControllerError>(Action::requeue(requeue))
    };

    // Only this node's object, one pass at a time
    let watcher_config = watcher::Config::default().fields(&format!("metadata.name={node_name}"));
    let controller_config = ControllerConfig::default()
        .debounce(Duration::from_secs(1))
        .concurrency(1);

    let ctx = Arc::new(Context { handler, metrics });
    Controller::new(api, watcher_config)
        .with_config(controller_config)
        .run(reconcile, error_policy, ctx)
        .for_each(|res| async move {
            if let Err(e) = res {
                error!("{} controller error: {}", H::NAME, e);
            }
        })
        .await;

    Ok(())
}

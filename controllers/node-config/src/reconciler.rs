//! Node convergence reconciler
//!
//! Brings this node's network devices to the NetworkNodeState spec. Each
//! pass refreshes the observed status, asks the plugins what applying the
//! spec takes, and either applies right away or requests a drain through
//! the desired-drain annotation and waits for the drain executor to report
//! `DrainComplete`.
//!
//! The reconciler only ever writes the desired-drain key. The current-drain
//! key belongs to the drain executor.

use crate::backoff::RequeueBackoff;
use crate::config::{Config, ConfigurationMode};
use crate::device_plugin::DevicePlugin;
use crate::error::{ControllerError, HostError};
use crate::featuregate::{FeatureGate, BLOCK_DEVICE_PLUGIN_UNTIL_CONFIGURED, MANAGE_SOFTWARE_BRIDGES};
use crate::host::HostOps;
use crate::plugins::{DrainRequirement, PluginSet};
use chrono::Utc;
use cluster_client::ClusterClientTrait;
use crds::drain::{
    CurrentDrainState, DesiredDrainState, DrainPair, CURRENT_DRAIN_ANNOTATION, DESIRED_DRAIN_ANNOTATION,
    EXTERNAL_DRAINER_ANNOTATION,
};
use crds::{NetworkNodeState, SyncStatus};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Requeue interval once the node matches its spec
pub const STEADY_STATE_REQUEUE: Duration = Duration::from_secs(30);

/// Requeue interval while a drain is requested or in flight
pub const DRAIN_POLL_REQUEUE: Duration = Duration::from_secs(5);

/// How long to wait for the host to go down after asking for a reboot
const DEFAULT_REBOOT_WAIT: Duration = Duration::from_secs(300);

/// What a reconcile pass ended with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Drain annotations not initialised yet
    MissingDrainAnnotations,
    /// External-drainer annotation changed, the next event continues
    AuthorityUpdated,
    /// Nothing to do
    Converged,
    /// Waiting on the drain executor
    AwaitingDrain,
    /// Configuration applied
    Applied,
    /// Reboot requested and the host did not go down
    Rebooting,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::MissingDrainAnnotations => "MissingDrainAnnotations",
            Outcome::AuthorityUpdated => "AuthorityUpdated",
            Outcome::Converged => "Converged",
            Outcome::AwaitingDrain => "AwaitingDrain",
            Outcome::Applied => "Applied",
            Outcome::Rebooting => "Rebooting",
        }
    }

    /// When to look at the object again
    pub fn requeue_after(&self) -> Duration {
        match self {
            Outcome::MissingDrainAnnotations | Outcome::AuthorityUpdated | Outcome::AwaitingDrain => {
                DRAIN_POLL_REQUEUE
            }
            Outcome::Converged | Outcome::Applied | Outcome::Rebooting => STEADY_STATE_REQUEUE,
        }
    }
}

/// Converges this node's NetworkNodeState
pub struct NodeReconciler {
    client: Arc<dyn ClusterClientTrait>,
    host: Arc<dyn HostOps>,
    plugins: Mutex<PluginSet>,
    features: Arc<FeatureGate>,
    device_plugin: DevicePlugin,
    node_name: String,
    use_external_drainer: bool,
    disable_drain: bool,
    configuration_mode: ConfigurationMode,
    cancel: CancellationToken,
    reboot_wait: Duration,
    /// Spec generation last applied successfully, 0 before the first apply
    last_applied_generation: AtomicI64,
    backoff: RequeueBackoff,
}

impl std::fmt::Debug for NodeReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeReconciler")
            .field("node_name", &self.node_name)
            .field("last_applied_generation", &self.last_applied_generation())
            .finish_non_exhaustive()
    }
}

impl NodeReconciler {
    pub fn new(
        config: &Config,
        client: Arc<dyn ClusterClientTrait>,
        host: Arc<dyn HostOps>,
        plugins: PluginSet,
        features: Arc<FeatureGate>,
        cancel: CancellationToken,
    ) -> Self {
        let device_plugin = DevicePlugin::new(Arc::clone(&client), &config.namespace, &config.node_name);
        Self {
            client,
            host,
            plugins: Mutex::new(plugins),
            features,
            device_plugin,
            node_name: config.node_name.clone(),
            use_external_drainer: config.use_external_drainer,
            disable_drain: config.disable_drain,
            configuration_mode: config.configuration_mode,
            cancel,
            reboot_wait: DEFAULT_REBOOT_WAIT,
            last_applied_generation: AtomicI64::new(0),
            backoff: RequeueBackoff::new(1, 30),
        }
    }

    #[must_use]
    pub fn with_reboot_wait(mut self, wait: Duration) -> Self {
        self.reboot_wait = wait;
        self
    }

    #[must_use]
    pub fn with_device_plugin(mut self, device_plugin: DevicePlugin) -> Self {
        self.device_plugin = device_plugin;
        self
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn last_applied_generation(&self) -> i64 {
        self.last_applied_generation.load(Ordering::SeqCst)
    }

    /// Requeue delay after a failed pass on `name`
    pub fn error_backoff(&self, name: &str) -> Duration {
        self.backoff.on_error(name)
    }

    pub fn reset_backoff(&self, name: &str) {
        self.backoff.on_success(name);
    }

    /// One reconcile pass
    #[instrument(skip_all, fields(node = %self.node_name, generation = state.generation()))]
    pub async fn reconcile(&self, state: &NetworkNodeState) -> Result<Outcome, ControllerError> {
        // Runs ahead of the missing-keys check: it also covers objects with no drain keys yet
        if self.update_drain_authority(state).await? {
            return Ok(Outcome::AuthorityUpdated);
        }

        let Some(pair) = state.drain_pair()? else {
            debug!("Drain annotations not initialised yet, waiting for the drain executor");
            return Ok(Outcome::MissingDrainAnnotations);
        };

        let state = self.refresh_status(state).await?;
        let generation = state.generation();

        if generation == self.last_applied_generation() {
            if !self.detect_drift(&state).await? {
                self.offer_unblock(&state).await;
                return Ok(Outcome::Converged);
            }
            info!("Host drifted from generation {}, reconverging", generation);
        }

        // A new attempt starts only when we have no drain request out. While one
        // is in flight the executor may have reported Failed, which must stay visible.
        let attempt_starts = pair.desired == DesiredDrainState::Idle;
        let state = if attempt_starts {
            self.publish_sync(&state, SyncStatus::InProgress, current_error(&state)).await?
        } else {
            state
        };
        let requirement = self.plan(&state).await?;
        debug!(
            "Plugins need drain={} reboot={}, drain state {}/{}",
            requirement.drain, requirement.reboot, pair.desired, pair.current
        );

        match self.apply_decision(pair, requirement) {
            Some(reboot) => {
                let state = if attempt_starts {
                    state
                } else {
                    self.publish_sync(&state, SyncStatus::InProgress, current_error(&state)).await?
                };
                self.apply(&state, pair, reboot).await
            }
            None => {
                if requirement.any() {
                    let next = pair.next_request(requirement.reboot);
                    if next != pair.desired {
                        self.client
                            .set_node_state_annotation(name_of(&state), DESIRED_DRAIN_ANNOTATION, Some(next.as_str()))
                            .await?;
                        info!("Requested {} for generation {}", next, generation);
                    }
                }
                Ok(Outcome::AwaitingDrain)
            }
        }
    }

    /// `Some(reboot)` when the configuration can be applied now, `None` when
    /// a drain has to be requested or finished first
    fn apply_decision(&self, pair: DrainPair, requirement: DrainRequirement) -> Option<bool> {
        if !requirement.any() && pair.current == CurrentDrainState::Idle {
            return Some(false);
        }
        if self.disable_drain {
            return Some(requirement.reboot);
        }
        if pair.current == CurrentDrainState::DrainComplete && pair.desired.requires_drain() {
            // A RebootRequired left over from before a reboot must not reboot again
            return Some(requirement.reboot);
        }
        None
    }

    /// Keeps the external-drainer annotation in line with the configuration.
    /// Only touched while no drain is in flight. Returns whether it changed.
    async fn update_drain_authority(&self, state: &NetworkNodeState) -> Result<bool, ControllerError> {
        let present = state.has_annotation(EXTERNAL_DRAINER_ANNOTATION);
        if present == self.use_external_drainer {
            return Ok(false);
        }

        let settled = match state.drain_pair() {
            Ok(Some(pair)) => pair.is_idle(),
            Ok(None) => {
                !state.has_annotation(DESIRED_DRAIN_ANNOTATION) && !state.has_annotation(CURRENT_DRAIN_ANNOTATION)
            }
            Err(_) => false,
        };
        if !settled {
            debug!("Drain in flight, leaving the external drainer annotation alone");
            return Ok(false);
        }

        let value = self.use_external_drainer.then_some("true");
        self.client
            .set_node_state_annotation(name_of(state), EXTERNAL_DRAINER_ANNOTATION, value)
            .await?;
        info!("External drainer annotation set to {}", self.use_external_drainer);
        Ok(true)
    }

    /// Publishes the observed interfaces (and bridges when managed) if they
    /// changed. Returns the object as stored.
    async fn refresh_status(&self, state: &NetworkNodeState) -> Result<NetworkNodeState, ControllerError> {
        let mut interfaces = self.host.discover_interfaces().await?;
        for iface in &mut interfaces {
            iface.externally_managed = state
                .spec
                .interfaces
                .iter()
                .any(|d| d.pci_address == iface.pci_address && d.externally_managed);
        }
        let bridges = if self.features.is_enabled(MANAGE_SOFTWARE_BRIDGES) {
            self.host.discover_bridges().await?
        } else {
            Vec::new()
        };

        let mut status = state.status.clone().unwrap_or_default();
        if status.interfaces == interfaces && status.bridges == bridges {
            return Ok(state.clone());
        }
        status.interfaces = interfaces;
        status.bridges = bridges;
        debug!("Publishing refreshed interface status");
        Ok(self.client.update_node_state_status(name_of(state), &status).await?)
    }

    async fn publish_sync(
        &self,
        state: &NetworkNodeState,
        sync: SyncStatus,
        error: Option<String>,
    ) -> Result<NetworkNodeState, ControllerError> {
        let mut status = state.status.clone().unwrap_or_default();
        if status.sync_status == Some(sync) && status.last_sync_error == error {
            return Ok(state.clone());
        }
        status.sync_status = Some(sync);
        status.last_sync_error = error;
        status.last_sync_time = Some(Utc::now());
        Ok(self.client.update_node_state_status(name_of(state), &status).await?)
    }

    async fn detect_drift(&self, state: &NetworkNodeState) -> Result<bool, ControllerError> {
        let plugins = self.plugins.lock().await;
        for plugin in plugins.main.iter().chain(plugins.additional.iter()) {
            if plugin.check_status_changes(state).await? {
                info!("Plugin {} reports drift", plugin.name());
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Asks every plugin what the spec takes. Any error aborts the pass.
    async fn plan(&self, state: &NetworkNodeState) -> Result<DrainRequirement, ControllerError> {
        let mut plugins = self.plugins.lock().await;
        let mut requirement = DrainRequirement::NONE;

        if let Some(main) = plugins.main.as_mut() {
            let mut needs = main.on_node_state_change(state).await?;
            if self.configuration_mode == ConfigurationMode::Systemd && needs.any() {
                // The boot-time service applies the main plugin's part
                needs.reboot = true;
            }
            requirement = requirement.merge(needs);
        }
        for plugin in plugins.additional.iter_mut() {
            requirement = requirement.merge(plugin.on_node_state_change(state).await?);
        }
        Ok(requirement)
    }

    async fn apply(&self, state: &NetworkNodeState, pair: DrainPair, reboot: bool) -> Result<Outcome, ControllerError> {
        let block = self.features.is_enabled(BLOCK_DEVICE_PLUGIN_UNTIL_CONFIGURED);

        // With blocking on, the replacement pod sits blocked while we configure
        let restarted = if block { Some(self.device_plugin.restart().await?) } else { None };

        {
            let mut plugins = self.plugins.lock().await;
            for plugin in plugins.additional.iter_mut() {
                plugin.apply().await?;
                debug!("Plugin {} applied", plugin.name());
            }
            let skip_main = reboot || self.configuration_mode == ConfigurationMode::Systemd;
            match plugins.main.as_mut() {
                Some(main) if !skip_main => {
                    main.apply().await?;
                    debug!("Plugin {} applied", main.name());
                }
                Some(main) => debug!("Leaving {} to the boot-time service", main.name()),
                None => {}
            }
        }

        if reboot {
            return self.reboot().await;
        }

        let old_pods = match restarted {
            Some(uids) => uids,
            None => self.device_plugin.restart().await?,
        };
        if block {
            if let Some(pod) = self.device_plugin.wait_for_blocked_replacement(&old_pods).await? {
                if state.spec.interfaces.is_empty() {
                    info!("No interfaces desired, device plugin stays blocked");
                } else {
                    self.device_plugin.unblock(&pod).await?;
                }
            }
        }

        let mut state = state.clone();
        if pair.desired != DesiredDrainState::Idle {
            state = self
                .client
                .set_node_state_annotation(name_of(&state), DESIRED_DRAIN_ANNOTATION, Some(DesiredDrainState::Idle.as_str()))
                .await?;
        }

        let state = self.refresh_status(&state).await?;
        let (sync, error) = match self.configuration_mode {
            ConfigurationMode::Daemon => (SyncStatus::Succeeded, None),
            ConfigurationMode::Systemd => match self.host.read_boot_result().await? {
                Some(result) => (result.sync_status, result.last_sync_error),
                None => (SyncStatus::Succeeded, None),
            },
        };
        self.publish_sync(&state, sync, error).await?;

        let generation = state.generation();
        self.last_applied_generation.store(generation, Ordering::SeqCst);
        info!("Generation {} applied", generation);
        Ok(Outcome::Applied)
    }

    async fn reboot(&self) -> Result<Outcome, ControllerError> {
        info!("Rebooting node {}", self.node_name);
        self.host.reboot().await?;
        tokio::select! {
            () = self.cancel.cancelled() => Err(HostError::Cancelled.into()),
            () = tokio::time::sleep(self.reboot_wait) => {
                warn!("Host still up {:?} after the reboot request", self.reboot_wait);
                Ok(Outcome::Rebooting)
            }
        }
    }

    /// Re-offers the unblock in steady state, in case the device plugin
    /// restarted on its own since the last apply
    async fn offer_unblock(&self, state: &NetworkNodeState) {
        if !self.features.is_enabled(BLOCK_DEVICE_PLUGIN_UNTIL_CONFIGURED) || state.spec.interfaces.is_empty() {
            return;
        }
        match self.device_plugin.unblock_waiting().await {
            Ok(0) => {}
            Ok(n) => info!("Unblocked {} waiting device plugin pod(s)", n),
            Err(e) => warn!("Could not unblock device plugin: {}", e),
        }
    }
}

fn name_of(state: &NetworkNodeState) -> &str {
    state.metadata.name.as_deref().unwrap_or_default()
}

fn current_error(state: &NetworkNodeState) -> Option<String> {
    state.status.as_ref().and_then(|s| s.last_sync_error.clone())
}

#[cfg(test)]
#[path = "reconciler_test.rs"]
mod reconciler_test;

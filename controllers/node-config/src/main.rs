//! Node Config Daemon
//!
//! Runs on every node and converges the host's network devices (VF counts,
//! MTU, software bridges) to the node's NetworkNodeState. Changes that
//! disrupt workloads go through a drain handshake carried in annotations:
//! - the reconciler asks for a drain (or a drain plus reboot)
//! - the drain executor cordons and evicts, then reports completion
//! - an external drainer may take the executor's place
//!
//! Configuration comes from environment variables, see [`config::Config`].

mod backoff;
mod config;
mod controller;
mod device_plugin;
mod drain;
mod drain_executor;
mod error;
mod featuregate;
mod host;
mod metrics;
mod orchestrator;
mod plugins;
mod probes;
mod reconciler;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::Config;
use crate::error::ControllerError;
use crate::featuregate::FeatureGate;
use controller::Controller;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting Node Config Daemon");

    let config = Config::from_env()?;
    let features = Arc::new(FeatureGate::with_overrides(&config.feature_gates));

    info!("Configuration:");
    info!("  Node: {}", config.node_name);
    info!("  Namespace: {}", config.namespace);
    info!("  Cluster type: {}", config.cluster_type.as_str());
    info!("  Platform: {}", config.platform.as_str());
    info!("  Configuration mode: {}", config.configuration_mode.as_str());
    info!("  External drainer: {}", config.use_external_drainer);
    info!("  Drain disabled: {}", config.disable_drain);
    info!("  Feature gates: {}", features);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
                return;
            }
            info!("Received shutdown signal");
            cancel.cancel();
        });
    }

    let controller = Controller::new(config, features, cancel).await?;
    controller.run().await?;

    Ok(())
}

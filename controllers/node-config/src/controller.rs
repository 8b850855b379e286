//! Main controller implementation.
//!
//! Wires the cluster client, host access and vendor plugins into the node
//! reconciler and (unless an external drainer owns drains) the drain
//! executor, then runs both watchers next to the probe server.

use crate::config::Config;
use crate::drain::Drainer;
use crate::drain_executor::DrainExecutor;
use crate::error::ControllerError;
use crate::featuregate::FeatureGate;
use crate::host::{load_or_create_checkpoint, HostOps, SysfsHost};
use crate::metrics::Metrics;
use crate::orchestrator;
use crate::plugins::{PluginContext, PluginRegistry};
use crate::probes::{self, ProbeState};
use crate::reconciler::NodeReconciler;
use crate::watcher::watch_node_state;
use cluster_client::{ClusterClientTrait, KubeClusterClient};
use crds::NetworkNodeState;
use kube::{Api, Client};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Node config daemon: watchers plus probe server
#[derive(Debug)]
pub struct Controller {
    reconciler_watcher: JoinHandle<Result<(), ControllerError>>,
    /// `None` when an external drainer handles drains
    executor_watcher: Option<JoinHandle<Result<(), ControllerError>>>,
    probe_server: JoinHandle<Result<(), ControllerError>>,
    cancel: CancellationToken,
}

impl Controller {
    /// Creates a new controller instance and starts its tasks.
    pub async fn new(
        config: Config,
        features: Arc<FeatureGate>,
        cancel: CancellationToken,
    ) -> Result<Self, ControllerError> {
        info!("Initializing node config daemon for node {}", config.node_name);

        let kube_client = Client::try_default().await?;
        let client: Arc<dyn ClusterClientTrait> =
            Arc::new(KubeClusterClient::new(kube_client.clone(), config.namespace.clone()));
        let host: Arc<dyn HostOps> = Arc::new(SysfsHost::new(config.host_root.clone()));

        let checkpoint = match load_or_create_checkpoint(host.as_ref()).await {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                warn!("No host checkpoint available (continuing without): {}", e);
                None
            }
        };

        let vendors: Vec<String> = match &checkpoint {
            Some(checkpoint) => checkpoint.interfaces.iter().map(|i| i.vendor.clone()).collect(),
            None => host
                .discover_interfaces()
                .await?
                .into_iter()
                .map(|i| i.vendor)
                .collect(),
        };

        let plugins = PluginRegistry::with_builtin().load(
            config.platform,
            &vendors,
            &PluginContext {
                host: Arc::clone(&host),
                checkpoint,
            },
        )?;

        let metrics = Arc::new(Metrics::new()?);
        let api: Api<NetworkNodeState> = Api::namespaced(kube_client, &config.namespace);

        let reconciler = Arc::new(NodeReconciler::new(
            &config,
            Arc::clone(&client),
            host,
            plugins,
            features,
            cancel.clone(),
        ));

        let reconciler_watcher = {
            let api = api.clone();
            let node_name = config.node_name.clone();
            let metrics = Arc::clone(&metrics);
            tokio::spawn(async move { watch_node_state(api, &node_name, reconciler, metrics).await })
        };

        let executor_watcher = if config.use_external_drainer {
            info!("External drainer in use, drain executor not started");
            None
        } else {
            let orchestrator = orchestrator::for_cluster_type(config.cluster_type, Arc::clone(&client));
            let drainer = Drainer::new(
                Arc::clone(&client),
                orchestrator,
                config.resource_prefix.clone(),
                cancel.clone(),
            );
            let executor = Arc::new(DrainExecutor::new(
                client,
                drainer,
                &config.node_name,
                Arc::clone(&metrics),
            ));
            let node_name = config.node_name.clone();
            let metrics = Arc::clone(&metrics);
            Some(tokio::spawn(async move {
                watch_node_state(api, &node_name, executor, metrics).await
            }))
        };

        let ready = Arc::new(AtomicBool::new(false));
        let probe_server = {
            let state = ProbeState {
                metrics,
                ready: Arc::clone(&ready),
            };
            let addr = config.probe_addr;
            let cancel = cancel.clone();
            tokio::spawn(async move { probes::serve(addr, state, cancel).await })
        };
        ready.store(true, Ordering::SeqCst);

        Ok(Self {
            reconciler_watcher,
            executor_watcher,
            probe_server,
            cancel,
        })
    }

    /// Runs until a task exits or shutdown is requested
    pub async fn run(self) -> Result<(), ControllerError> {
        info!("Node config daemon running");

        let Self {
            mut reconciler_watcher,
            executor_watcher,
            mut probe_server,
            cancel,
        } = self;

        let executor = async move {
            match executor_watcher {
                Some(handle) => handle.await,
                None => std::future::pending().await,
            }
        };

        // Watchers run forever; any exit ends the daemon
        tokio::select! {
            result = &mut reconciler_watcher => {
                result.map_err(|e| ControllerError::Watch(format!("Reconciler watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("Reconciler watcher error: {}", e)))?;
            }
            result = executor => {
                result.map_err(|e| ControllerError::Watch(format!("Drain executor watcher panicked: {}", e)))?
                    .map_err(|e| ControllerError::Watch(format!("Drain executor watcher error: {}", e)))?;
            }
            result = &mut probe_server => {
                result.map_err(|e| ControllerError::Watch(format!("Probe server panicked: {}", e)))??;
            }
            () = cancel.cancelled() => {
                info!("Shutdown requested, stopping watchers");
                reconciler_watcher.abort();
            }
        }

        Ok(())
    }
}

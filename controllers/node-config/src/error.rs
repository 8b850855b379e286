//! Controller-specific error types.
//!
//! Each subsystem has its own error enum. `ControllerError` wraps them all
//! for the reconcile loops, which only care whether to requeue.

use cluster_client::ClusterError;
use crds::drain::ParseDrainStateError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while cordoning, evicting or uncordoning
#[derive(Debug, Error)]
pub enum DrainError {
    /// Cordon kept failing until the retry budget ran out
    #[error("failed to cordon node {node} after {attempts} attempts: {source}")]
    Cordon {
        node: String,
        attempts: u32,
        #[source]
        source: ClusterError,
    },

    /// Uncordon failed
    #[error("failed to uncordon node {node}: {source}")]
    Uncordon {
        node: String,
        #[source]
        source: ClusterError,
    },

    /// Could not list the pods on the node
    #[error("failed to list pods on node {node}: {source}")]
    ListPods {
        node: String,
        #[source]
        source: ClusterError,
    },

    /// An eviction failed in a way that retrying won't fix
    #[error("failed to evict pod {pod}: {source}")]
    Eviction {
        pod: String,
        #[source]
        source: ClusterError,
    },

    /// The pod outlived the eviction timeout and could not be force deleted
    #[error("failed to force delete pod {pod}: {source}")]
    ForceDelete {
        pod: String,
        #[source]
        source: ClusterError,
    },

    /// Platform hook failed
    #[error("drain orchestrator error: {0}")]
    Orchestrator(#[from] ClusterError),

    /// Shutdown requested while the drain was in flight
    #[error("drain of node {0} cancelled")]
    Cancelled(String),
}

/// Errors raised by vendor plugins
#[derive(Debug, Error)]
pub enum PluginError {
    /// No main plugin registered for the platform
    #[error("no main plugin registered for platform {0}")]
    NoMainPlugin(String),

    /// A desired interface cannot be realised on this host
    #[error("plugin {plugin}: invalid configuration for {pci_address}: {reason}")]
    InvalidConfig {
        plugin: String,
        pci_address: String,
        reason: String,
    },

    /// Host operation failed underneath the plugin
    #[error("plugin {plugin}: {source}")]
    Host {
        plugin: String,
        #[source]
        source: HostError,
    },
}

/// Errors raised by host operations
#[derive(Debug, Error)]
pub enum HostError {
    /// Filesystem access under the host root failed
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A sysfs attribute held something unexpected
    #[error("unexpected value {value:?} in {path}")]
    Parse { path: PathBuf, value: String },

    /// No interface with this PCI address on the host
    #[error("interface {0} not found on host")]
    InterfaceNotFound(String),

    /// Requested more VFs than the device supports
    #[error("interface {pci_address} supports {total} VFs, {requested} requested")]
    TooManyVfs {
        pci_address: String,
        requested: u32,
        total: u32,
    },

    /// External command exited unsuccessfully
    #[error("command {command} failed: {message}")]
    Command { command: String, message: String },

    /// Checkpoint or result file could not be (de)serialized
    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Shutdown requested while waiting for the reboot
    #[error("reboot wait cancelled")]
    Cancelled,
}

/// Malformed `FEATURE_GATES` value
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeatureGateError {
    #[error("feature gate {0:?} is not of the form name=bool")]
    MissingValue(String),

    #[error("feature gate {name:?} has non-boolean value {value:?}")]
    NotABool { name: String, value: String },
}

/// Errors that can occur in the node config daemon.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error from the cluster client
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Kubernetes client construction error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Drain failed
    #[error("Drain error: {0}")]
    Drain(#[from] DrainError),

    /// Vendor plugin failed
    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// Host operation failed
    #[error("Host error: {0}")]
    Host(#[from] HostError),

    /// Drain annotation holds a value outside the protocol
    #[error("Drain annotation error: {0}")]
    DrainState(#[from] ParseDrainStateError),

    /// Device plugin pod did not come back in time
    #[error("Device plugin error: {0}")]
    DevicePlugin(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metric registration or encoding failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Probe server could not bind or serve
    #[error("Probe server error: {0}")]
    Server(#[source] std::io::Error),
}

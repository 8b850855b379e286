//! Daemon configuration, read from environment variables.

use crate::error::ControllerError;
use crate::featuregate::FeatureGate;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Default namespace for NetworkNodeState objects and the device plugin
pub const DEFAULT_NAMESPACE: &str = "network-operator";

/// Default prefix of the extended resources the device plugin advertises
pub const DEFAULT_RESOURCE_PREFIX: &str = "dcops.microscaler.io";

/// Default mount point of the host filesystem inside the daemon container
pub const DEFAULT_HOST_ROOT: &str = "/host";

/// Health and metrics endpoint
pub const DEFAULT_PROBE_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 8081);

/// Kind of cluster, selects the drain orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterType {
    Kubernetes,
    OpenShift,
}

impl ClusterType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterType::Kubernetes => "kubernetes",
            ClusterType::OpenShift => "openshift",
        }
    }
}

impl fmt::Display for ClusterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine platform, selects the main vendor plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    BareMetal,
    Virtual,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::BareMetal => "baremetal",
            Platform::Virtual => "virtual",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who applies the main plugin's configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigurationMode {
    /// This daemon applies everything
    Daemon,
    /// A boot-time systemd service applies the main plugin
    Systemd,
}

impl ConfigurationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigurationMode::Daemon => "daemon",
            ConfigurationMode::Systemd => "systemd",
        }
    }
}

/// Runtime configuration of the daemon
#[derive(Debug, Clone)]
pub struct Config {
    pub node_name: String,
    pub namespace: String,
    pub cluster_type: ClusterType,
    pub platform: Platform,
    pub use_external_drainer: bool,
    pub disable_drain: bool,
    pub configuration_mode: ConfigurationMode,
    pub resource_prefix: String,
    pub feature_gates: HashMap<String, bool>,
    pub host_root: PathBuf,
    /// Listen address of the health and metrics endpoint
    pub probe_addr: SocketAddr,
}

impl Config {
    /// Reads the configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which returns the value of
    /// a variable or `None` when unset
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let node_name = lookup("NODE_NAME")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                ControllerError::InvalidConfig("NODE_NAME environment variable is required".to_string())
            })?;

        let cluster_type = match lookup("CLUSTER_TYPE").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("" | "kubernetes") => ClusterType::Kubernetes,
            Some("openshift") => ClusterType::OpenShift,
            Some(other) => {
                return Err(ControllerError::InvalidConfig(format!(
                    "CLUSTER_TYPE must be kubernetes or openshift, got {other:?}"
                )));
            }
        };

        let platform = match lookup("PLATFORM").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("" | "baremetal") => Platform::BareMetal,
            Some("virtual") => Platform::Virtual,
            Some(other) => {
                return Err(ControllerError::InvalidConfig(format!(
                    "PLATFORM must be baremetal or virtual, got {other:?}"
                )));
            }
        };

        let configuration_mode = match lookup("CONFIGURATION_MODE").as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("" | "daemon") => ConfigurationMode::Daemon,
            Some("systemd") => ConfigurationMode::Systemd,
            Some(other) => {
                return Err(ControllerError::InvalidConfig(format!(
                    "CONFIGURATION_MODE must be daemon or systemd, got {other:?}"
                )));
            }
        };

        let feature_gates = match lookup("FEATURE_GATES") {
            Some(raw) => FeatureGate::parse_overrides(&raw).map_err(|e| ControllerError::InvalidConfig(e.to_string()))?,
            None => HashMap::new(),
        };

        let probe_addr = match lookup("PROBE_ADDR").filter(|v| !v.is_empty()) {
            Some(raw) => raw.parse::<SocketAddr>().map_err(|_| {
                ControllerError::InvalidConfig(format!("PROBE_ADDR must be host:port, got {raw:?}"))
            })?,
            None => SocketAddr::from(DEFAULT_PROBE_ADDR),
        };

        Ok(Self {
            node_name,
            namespace: lookup("NAMESPACE")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
            cluster_type,
            platform,
            use_external_drainer: parse_bool("USE_EXTERNAL_DRAINER", lookup("USE_EXTERNAL_DRAINER"))?,
            disable_drain: parse_bool("DISABLE_DRAIN", lookup("DISABLE_DRAIN"))?,
            configuration_mode,
            resource_prefix: lookup("RESOURCE_PREFIX")
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| DEFAULT_RESOURCE_PREFIX.to_string()),
            feature_gates,
            host_root: PathBuf::from(
                lookup("HOST_ROOT")
                    .filter(|v| !v.is_empty())
                    .unwrap_or_else(|| DEFAULT_HOST_ROOT.to_string()),
            ),
            probe_addr,
        })
    }
}

fn parse_bool(name: &str, value: Option<String>) -> Result<bool, ControllerError> {
    match value.as_deref().map(str::trim) {
        None | Some("") => Ok(false),
        Some(v) if v.eq_ignore_ascii_case("true") || v == "1" => Ok(true),
        Some(v) if v.eq_ignore_ascii_case("false") || v == "0" => Ok(false),
        Some(v) => Err(ControllerError::InvalidConfig(format!(
            "{name} must be a boolean, got {v:?}"
        ))),
    }
}

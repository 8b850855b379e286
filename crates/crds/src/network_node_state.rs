//! NetworkNodeState CRD
//!
//! One object per node. The spec is the desired network device configuration
//! (written by the policy controller), the status is the observed hardware
//! state and the outcome of the last sync (written by the node daemon).

use crate::drain::{CurrentDrainState, DesiredDrainState, DrainPair, ParseDrainStateError};
use crate::drain::{CURRENT_DRAIN_ANNOTATION, DESIRED_DRAIN_ANNOTATION};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "dcops.microscaler.io",
    version = "v1alpha1",
    kind = "NetworkNodeState",
    namespaced,
    status = "NetworkNodeStateStatus",
    shortname = "nns",
    printcolumn = r#"{"name":"Sync Status","type":"string","jsonPath":".status.syncStatus"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NetworkNodeStateSpec {
    /// Physical functions to configure on this node
    #[serde(default)]
    pub interfaces: Vec<InterfaceSpec>,
}

/// Desired configuration of one physical function
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceSpec {
    /// PCI address of the physical function (e.g. "0000:3b:00.0")
    pub pci_address: String,

    /// Kernel interface name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Number of virtual functions to create
    #[serde(default)]
    pub num_vfs: u32,

    /// MTU for the physical function
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,

    /// Link type ("eth" or "ib")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,

    /// Virtual function grouping by resource
    #[serde(default)]
    pub vf_groups: Vec<VfGroup>,

    /// VFs are created by something other than this daemon
    #[serde(default)]
    pub externally_managed: bool,
}

/// A range of virtual functions advertised under one resource name
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VfGroup {
    /// Resource name advertised by the device plugin
    pub resource_name: String,

    /// Driver to bind the VFs to ("netdevice" or "vfio-pci")
    #[serde(default)]
    pub device_type: String,

    /// VF index range, "first-last"
    pub vf_range: String,

    /// Policy this group came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_name: Option<String>,

    /// MTU for the VFs in this group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkNodeStateStatus {
    /// Observed physical functions
    #[serde(default)]
    pub interfaces: Vec<InterfaceStatus>,

    /// Observed bridges
    #[serde(default)]
    pub bridges: Vec<BridgeStatus>,

    /// Outcome of the last sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_status: Option<SyncStatus>,

    /// Error from the last failed sync
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_error: Option<String>,

    /// Time the sync status last changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<chrono::DateTime<chrono::Utc>>,
}

/// Observed state of one physical function
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct InterfaceStatus {
    pub pci_address: String,
    pub name: String,
    #[serde(default)]
    pub vendor: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub driver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(default)]
    pub link_up: bool,
    #[serde(default)]
    pub num_vfs: u32,
    #[serde(default)]
    pub total_vfs: u32,
    #[serde(default)]
    pub externally_managed: bool,
    #[serde(default)]
    pub vfs: Vec<VirtualFunctionStatus>,
}

/// Observed state of one virtual function
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VirtualFunctionStatus {
    pub vf_id: u32,
    pub pci_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub driver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

/// Observed software bridge
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BridgeStatus {
    pub name: String,
    /// Interfaces attached as uplinks
    #[serde(default)]
    pub uplinks: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
/// Sync state
///
/// Serializes as PascalCase ("Succeeded", "InProgress", "Failed") to match the
/// CRD schema; lowercase is accepted on read.
#[serde(rename_all = "PascalCase")]
pub enum SyncStatus {
    #[serde(alias = "succeeded")]
    Succeeded,
    #[serde(alias = "inProgress", alias = "in-progress")]
    InProgress,
    #[serde(alias = "failed")]
    Failed,
}

impl SyncStatus {
    /// PascalCase name as stored in the status
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Succeeded => "Succeeded",
            SyncStatus::InProgress => "InProgress",
            SyncStatus::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl NetworkNodeState {
    /// Value of an annotation, if present
    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Whether the annotation key is present, regardless of value
    pub fn has_annotation(&self, key: &str) -> bool {
        self.annotation(key).is_some()
    }

    /// Reads the drain protocol pair.
    ///
    /// Returns `Ok(None)` when either key is missing.
    pub fn drain_pair(&self) -> Result<Option<DrainPair>, ParseDrainStateError> {
        let (Some(desired), Some(current)) = (
            self.annotation(DESIRED_DRAIN_ANNOTATION),
            self.annotation(CURRENT_DRAIN_ANNOTATION),
        ) else {
            return Ok(None);
        };

        Ok(Some(DrainPair {
            desired: desired.parse::<DesiredDrainState>()?,
            current: current.parse::<CurrentDrainState>()?,
        }))
    }

    /// Generation of the spec (0 if the API server hasn't assigned one)
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    /// Sync status currently recorded in the status
    pub fn sync_status(&self) -> Option<SyncStatus> {
        self.status.as_ref().and_then(|s| s.sync_status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn state_with(annotations: &[(&str, &str)]) -> NetworkNodeState {
        NetworkNodeState {
            metadata: ObjectMeta {
                name: Some("worker-0".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                ..Default::default()
            },
            spec: NetworkNodeStateSpec::default(),
            status: None,
        }
    }

    #[test]
    fn test_drain_pair_missing_key() {
        let state = state_with(&[(DESIRED_DRAIN_ANNOTATION, "Idle")]);
        assert_eq!(state.drain_pair().ok().flatten(), None);
    }

    #[test]
    fn test_drain_pair_parsed() {
        let state = state_with(&[
            (DESIRED_DRAIN_ANNOTATION, "RebootRequired"),
            (CURRENT_DRAIN_ANNOTATION, "Draining"),
        ]);
        let pair = state.drain_pair().ok().flatten();
        assert_eq!(
            pair,
            Some(DrainPair {
                desired: DesiredDrainState::RebootRequired,
                current: CurrentDrainState::Draining,
            })
        );
    }

    #[test]
    fn test_drain_pair_rejects_unknown_value() {
        let state = state_with(&[
            (DESIRED_DRAIN_ANNOTATION, "Idle"),
            (CURRENT_DRAIN_ANNOTATION, "Rebooting"),
        ]);
        assert!(state.drain_pair().is_err());
    }

    #[test]
    fn test_sync_status_accepts_lowercase() {
        let status: NetworkNodeStateStatus =
            serde_json::from_value(serde_json::json!({ "syncStatus": "failed", "lastSyncError": "boom" }))
                .unwrap();
        assert_eq!(status.sync_status, Some(SyncStatus::Failed));
        assert_eq!(status.last_sync_error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_spec_defaults_when_fields_missing() {
        let spec: NetworkNodeStateSpec = serde_json::from_value(serde_json::json!({
            "interfaces": [{ "pciAddress": "0000:3b:00.0", "numVfs": 2 }]
        }))
        .unwrap();
        assert_eq!(spec.interfaces.len(), 1);
        assert_eq!(spec.interfaces[0].num_vfs, 2);
        assert!(spec.interfaces[0].vf_groups.is_empty());
        assert!(!spec.interfaces[0].externally_managed);
    }
}

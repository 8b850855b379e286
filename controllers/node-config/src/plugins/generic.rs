use super::{DrainRequirement, VendorPlugin};
use crate::error::PluginError;
use crate::host::{Checkpoint, HostOps};
use crds::{InterfaceSpec, InterfaceStatus, NetworkNodeState};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Vendor-neutral plugin driving VF counts and MTU through [`HostOps`].
///
/// On bare metal, resizing a VF pool yanks the VFs out from under running
/// pods, so any VF or MTU change needs a drain. Interfaces that are no
/// longer desired are returned to their checkpointed state. On a virtual
/// machine the hypervisor owns the VFs and only MTU is touched.
pub struct GenericPlugin {
    name: &'static str,
    host: Arc<dyn HostOps>,
    checkpoint: Option<Checkpoint>,
    manage_vfs: bool,
    pending: Vec<InterfaceSpec>,
}

impl std::fmt::Debug for GenericPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericPlugin")
            .field("name", &self.name)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl GenericPlugin {
    pub fn bare_metal(host: Arc<dyn HostOps>, checkpoint: Option<Checkpoint>) -> Self {
        Self {
            name: "generic",
            host,
            checkpoint,
            manage_vfs: true,
            pending: Vec::new(),
        }
    }

    pub fn virtual_machine(host: Arc<dyn HostOps>) -> Self {
        Self {
            name: "virtual",
            host,
            checkpoint: None,
            manage_vfs: false,
            pending: Vec::new(),
        }
    }

    fn differs(&self, desired: &InterfaceSpec, observed: &InterfaceStatus) -> bool {
        let vfs_differ = self.manage_vfs && !desired.externally_managed && desired.num_vfs != observed.num_vfs;
        let mtu_differs = desired.mtu.is_some_and(|mtu| observed.mtu != Some(mtu));
        vfs_differ || mtu_differs
    }

    /// Observed interfaces no longer in the spec that are not back at their
    /// startup configuration yet
    fn orphaned<'a>(&'a self, state: &'a NetworkNodeState) -> impl Iterator<Item = &'a InterfaceStatus> + 'a {
        observed(state).iter().filter(move |iface| {
            self.manage_vfs
                && !iface.externally_managed
                && !state.spec.interfaces.iter().any(|d| d.pci_address == iface.pci_address)
                && self.differs(&self.reset_spec(iface), iface)
        })
    }

    /// Desired state of an orphaned interface: whatever it had at startup
    fn reset_spec(&self, iface: &InterfaceStatus) -> InterfaceSpec {
        let original = self.checkpoint.as_ref().and_then(|c| c.interface(&iface.pci_address));
        InterfaceSpec {
            pci_address: iface.pci_address.clone(),
            name: Some(iface.name.clone()),
            num_vfs: original.map_or(0, |o| o.num_vfs),
            mtu: original.and_then(|o| o.mtu),
            ..Default::default()
        }
    }
}

fn observed(state: &NetworkNodeState) -> &[InterfaceStatus] {
    state.status.as_ref().map_or(&[][..], |s| s.interfaces.as_slice())
}

fn find<'a>(state: &'a NetworkNodeState, pci_address: &str) -> Option<&'a InterfaceStatus> {
    observed(state).iter().find(|i| i.pci_address == pci_address)
}

#[async_trait::async_trait]
impl VendorPlugin for GenericPlugin {
    fn name(&self) -> &str {
        self.name
    }

    async fn on_node_state_change(&mut self, desired: &NetworkNodeState) -> Result<DrainRequirement, PluginError> {
        let mut pending = Vec::new();

        for iface in &desired.spec.interfaces {
            let Some(current) = find(desired, &iface.pci_address) else {
                warn!("{}: interface {} not present on host, skipping", self.name, iface.pci_address);
                continue;
            };
            if self.manage_vfs && !iface.externally_managed && iface.num_vfs > current.total_vfs {
                return Err(PluginError::InvalidConfig {
                    plugin: self.name.to_string(),
                    pci_address: iface.pci_address.clone(),
                    reason: format!("{} VFs requested, device supports {}", iface.num_vfs, current.total_vfs),
                });
            }
            if self.differs(iface, current) {
                debug!("{}: {} needs reconfiguration", self.name, iface.pci_address);
                pending.push(iface.clone());
            }
        }

        let resets: Vec<InterfaceSpec> = self.orphaned(desired).map(|iface| self.reset_spec(iface)).collect();
        pending.extend(resets);

        let requirement = DrainRequirement {
            drain: self.manage_vfs && !pending.is_empty(),
            reboot: false,
        };
        self.pending = pending;
        Ok(requirement)
    }

    async fn apply(&mut self) -> Result<(), PluginError> {
        for iface in std::mem::take(&mut self.pending) {
            self.host
                .configure_interface(&iface)
                .await
                .map_err(|source| PluginError::Host {
                    plugin: self.name.to_string(),
                    source,
                })?;
            info!("{}: configured {}", self.name, iface.pci_address);
        }
        Ok(())
    }

    async fn check_status_changes(&self, desired: &NetworkNodeState) -> Result<bool, PluginError> {
        for iface in &desired.spec.interfaces {
            if let Some(current) = find(desired, &iface.pci_address) {
                if self.differs(iface, current) {
                    info!("{}: {} drifted from its desired configuration", self.name, iface.pci_address);
                    return Ok(true);
                }
            }
        }
        Ok(self.orphaned(desired).next().is_some())
    }
}

//! Host operations
//!
//! Everything the daemon does to the machine itself goes through
//! [`HostOps`]: reading NICs out of sysfs, resizing VF pools, rebooting,
//! and the small JSON files shared with the boot-time service. The host
//! filesystem is mounted into the container, so every path is resolved
//! under a configurable root.

use crate::error::HostError;
use chrono::{DateTime, Utc};
use crds::{BridgeStatus, InterfaceSpec, InterfaceStatus, SyncStatus, VirtualFunctionStatus};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Relative location of the startup checkpoint under the host root
pub const CHECKPOINT_PATH: &str = "etc/network-node-config/checkpoint.json";

/// Relative location of the boot-time service's result under the host root
pub const BOOT_RESULT_PATH: &str = "var/lib/network-node-config/result.json";

/// Snapshot of the host's interfaces, taken before the daemon changed anything
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub interfaces: Vec<InterfaceStatus>,
    pub taken_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Original state of one interface
    pub fn interface(&self, pci_address: &str) -> Option<&InterfaceStatus> {
        self.interfaces.iter().find(|i| i.pci_address == pci_address)
    }
}

/// Outcome written by the boot-time configuration service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BootResult {
    pub sync_status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync_error: Option<String>,
}

/// Operations on the local machine
#[async_trait::async_trait]
pub trait HostOps: Send + Sync {
    /// Physical functions present on the host
    async fn discover_interfaces(&self) -> Result<Vec<InterfaceStatus>, HostError>;

    /// Software bridges present on the host
    async fn discover_bridges(&self) -> Result<Vec<BridgeStatus>, HostError>;

    /// Brings one physical function to the desired VF count and MTU
    async fn configure_interface(&self, desired: &InterfaceSpec) -> Result<(), HostError>;

    /// Asks the host to reboot. Returns once the request is accepted.
    async fn reboot(&self) -> Result<(), HostError>;

    /// Result left by the boot-time service, if any
    async fn read_boot_result(&self) -> Result<Option<BootResult>, HostError>;

    async fn read_checkpoint(&self) -> Result<Option<Checkpoint>, HostError>;

    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), HostError>;
}

/// Reads the checkpoint, taking and storing one first if none exists yet
pub async fn load_or_create_checkpoint(host: &dyn HostOps) -> Result<Checkpoint, HostError> {
    if let Some(existing) = host.read_checkpoint().await? {
        debug!("Using checkpoint from {}", existing.taken_at);
        return Ok(existing);
    }

    let checkpoint = Checkpoint {
        interfaces: host.discover_interfaces().await?,
        taken_at: Utc::now(),
    };
    host.write_checkpoint(&checkpoint).await?;
    info!(
        "Wrote initial checkpoint with {} interface(s)",
        checkpoint.interfaces.len()
    );
    Ok(checkpoint)
}

/// [`HostOps`] backed by sysfs and `systemctl`
#[derive(Debug, Clone)]
pub struct SysfsHost {
    root: PathBuf,
}

impl SysfsHost {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    fn class_net(&self) -> PathBuf {
        self.path("sys/class/net")
    }

    fn pci_device(&self, pci_address: &str) -> PathBuf {
        self.path("sys/bus/pci/devices").join(pci_address)
    }

    async fn read_interface(&self, name: &str, dir: &Path) -> Result<Option<InterfaceStatus>, HostError> {
        let device = dir.join("device");
        let Some(pci_address) = link_target_name(&device).await? else {
            // Not backed by a PCI device (loopback, veth, bridge ...)
            return Ok(None);
        };
        if tokio::fs::try_exists(device.join("physfn")).await.unwrap_or(false) {
            // Virtual function, reported under its parent
            return Ok(None);
        }

        let num_vfs = read_u32(&device.join("sriov_numvfs")).await?.unwrap_or(0);
        let total_vfs = read_u32(&device.join("sriov_totalvfs")).await?.unwrap_or(0);

        Ok(Some(InterfaceStatus {
            pci_address,
            name: name.to_string(),
            vendor: read_hex_id(&device.join("vendor")).await?,
            device_id: read_hex_id(&device.join("device")).await?,
            driver: link_target_name(&device.join("driver")).await?.unwrap_or_default(),
            mac: read_trimmed(&dir.join("address")).await?,
            mtu: read_u32(&dir.join("mtu")).await?,
            link_type: read_trimmed(&dir.join("type"))
                .await?
                .map(|t| if t == "32" { "ib".to_string() } else { "eth".to_string() }),
            link_up: read_trimmed(&dir.join("operstate")).await?.as_deref() == Some("up"),
            num_vfs,
            total_vfs,
            externally_managed: false,
            vfs: self.read_vfs(&device, num_vfs).await?,
        }))
    }

    async fn read_vfs(&self, device: &Path, num_vfs: u32) -> Result<Vec<VirtualFunctionStatus>, HostError> {
        let mut vfs = Vec::with_capacity(num_vfs as usize);
        for vf_id in 0..num_vfs {
            let link = device.join(format!("virtfn{vf_id}"));
            let Some(pci_address) = link_target_name(&link).await? else {
                continue;
            };
            let vf_device = self.pci_device(&pci_address);
            let name = first_entry(&vf_device.join("net")).await?;
            let (mac, mtu) = match &name {
                Some(n) => {
                    let dir = self.class_net().join(n);
                    (read_trimmed(&dir.join("address")).await?, read_u32(&dir.join("mtu")).await?)
                }
                None => (None, None),
            };
            vfs.push(VirtualFunctionStatus {
                vf_id,
                pci_address,
                name,
                driver: link_target_name(&vf_device.join("driver")).await?.unwrap_or_default(),
                mac,
                mtu,
            });
        }
        Ok(vfs)
    }
}

#[async_trait::async_trait]
impl HostOps for SysfsHost {
    async fn discover_interfaces(&self) -> Result<Vec<InterfaceStatus>, HostError> {
        let class_net = self.class_net();
        let mut interfaces = Vec::new();
        for name in list_dir(&class_net).await? {
            if let Some(iface) = self.read_interface(&name, &class_net.join(&name)).await? {
                interfaces.push(iface);
            }
        }
        interfaces.sort_by(|a, b| a.pci_address.cmp(&b.pci_address));
        Ok(interfaces)
    }

    async fn discover_bridges(&self) -> Result<Vec<BridgeStatus>, HostError> {
        let class_net = self.class_net();
        let mut bridges = Vec::new();
        for name in list_dir(&class_net).await? {
            let dir = class_net.join(&name);
            if !tokio::fs::try_exists(dir.join("bridge")).await.unwrap_or(false) {
                continue;
            }
            let mut uplinks = list_dir(&dir.join("brif")).await?;
            uplinks.sort();
            bridges.push(BridgeStatus { name, uplinks });
        }
        bridges.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(bridges)
    }

    async fn configure_interface(&self, desired: &InterfaceSpec) -> Result<(), HostError> {
        let device = self.pci_device(&desired.pci_address);
        if !tokio::fs::try_exists(&device).await.unwrap_or(false) {
            return Err(HostError::InterfaceNotFound(desired.pci_address.clone()));
        }

        if !desired.externally_managed {
            let current = read_u32(&device.join("sriov_numvfs")).await?.unwrap_or(0);
            if current != desired.num_vfs {
                let total = read_u32(&device.join("sriov_totalvfs")).await?.unwrap_or(0);
                if desired.num_vfs > total {
                    return Err(HostError::TooManyVfs {
                        pci_address: desired.pci_address.clone(),
                        requested: desired.num_vfs,
                        total,
                    });
                }
                let numvfs = device.join("sriov_numvfs");
                // The kernel refuses to resize a non-zero VF pool directly
                if current != 0 {
                    write_value(&numvfs, "0").await?;
                }
                write_value(&numvfs, &desired.num_vfs.to_string()).await?;
                info!(
                    "Set {} VFs on {} (was {})",
                    desired.num_vfs, desired.pci_address, current
                );
            }
        }

        if let Some(mtu) = desired.mtu {
            let Some(name) = first_entry(&device.join("net")).await? else {
                warn!("No netdev for {}, cannot set MTU", desired.pci_address);
                return Ok(());
            };
            let mtu_path = self.class_net().join(name).join("mtu");
            if read_u32(&mtu_path).await? != Some(mtu) {
                write_value(&mtu_path, &mtu.to_string()).await?;
                info!("Set MTU {} on {}", mtu, desired.pci_address);
            }
        }

        Ok(())
    }

    async fn reboot(&self) -> Result<(), HostError> {
        info!("Requesting host reboot");
        let output = tokio::process::Command::new("chroot")
            .arg(&self.root)
            .args(["systemctl", "reboot"])
            .output()
            .await
            .map_err(|source| HostError::Io {
                path: self.root.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(HostError::Command {
                command: "systemctl reboot".to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn read_boot_result(&self) -> Result<Option<BootResult>, HostError> {
        read_json(&self.path(BOOT_RESULT_PATH)).await
    }

    async fn read_checkpoint(&self) -> Result<Option<Checkpoint>, HostError> {
        read_json(&self.path(CHECKPOINT_PATH)).await
    }

    async fn write_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), HostError> {
        let path = self.path(CHECKPOINT_PATH);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| HostError::Io {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }
        let data = serde_json::to_vec_pretty(checkpoint).map_err(|source| HostError::Json {
            path: path.clone(),
            source,
        })?;
        tokio::fs::write(&path, data)
            .await
            .map_err(|source| HostError::Io { path, source })
    }
}

async fn list_dir(dir: &Path) -> Result<Vec<String>, HostError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(HostError::Io {
                path: dir.to_path_buf(),
                source,
            });
        }
    };

    let mut names = Vec::new();
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => names.push(entry.file_name().to_string_lossy().into_owned()),
            Ok(None) => break,
            Err(source) => {
                return Err(HostError::Io {
                    path: dir.to_path_buf(),
                    source,
                });
            }
        }
    }
    names.sort();
    Ok(names)
}

async fn first_entry(dir: &Path) -> Result<Option<String>, HostError> {
    Ok(list_dir(dir).await?.into_iter().next())
}

/// Final path component of a symlink's target, `None` if there is no link
async fn link_target_name(link: &Path) -> Result<Option<String>, HostError> {
    match tokio::fs::read_link(link).await {
        Ok(target) => Ok(target.file_name().map(|n| n.to_string_lossy().into_owned())),
        Err(e) if matches!(e.kind(), std::io::ErrorKind::NotFound | std::io::ErrorKind::InvalidInput) => {
            Ok(None)
        }
        Err(source) => Err(HostError::Io {
            path: link.to_path_buf(),
            source,
        }),
    }
}

async fn read_trimmed(path: &Path) -> Result<Option<String>, HostError> {
    match tokio::fs::read_to_string(path).await {
        Ok(s) => Ok(Some(s.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(HostError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

async fn read_u32(path: &Path) -> Result<Option<u32>, HostError> {
    match read_trimmed(path).await? {
        Some(value) => value.parse::<u32>().map(Some).map_err(|_| HostError::Parse {
            path: path.to_path_buf(),
            value,
        }),
        None => Ok(None),
    }
}

/// PCI ids are stored as `0x8086`; the status carries them bare
async fn read_hex_id(path: &Path) -> Result<String, HostError> {
    Ok(read_trimmed(path)
        .await?
        .map(|v| v.trim_start_matches("0x").to_string())
        .unwrap_or_default())
}

async fn write_value(path: &Path, value: &str) -> Result<(), HostError> {
    tokio::fs::write(path, value)
        .await
        .map_err(|source| HostError::Io {
            path: path.to_path_buf(),
            source,
        })
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, HostError> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(HostError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|source| HostError::Json {
            path: path.to_path_buf(),
            source,
        })
}

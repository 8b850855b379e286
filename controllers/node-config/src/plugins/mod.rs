//! Vendor plugins
//!
//! A plugin looks at the desired node state, says whether getting there
//! needs a drain or a reboot, and later applies it. One *main* plugin is
//! picked by platform; *additional* plugins are picked by the PCI vendor
//! ids found on the host. The reconciler treats them all the same way.

mod generic;

pub use generic::GenericPlugin;

use crate::config::Platform;
use crate::error::PluginError;
use crate::host::{Checkpoint, HostOps};
use crds::NetworkNodeState;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// What a plugin needs before it can apply
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainRequirement {
    pub drain: bool,
    pub reboot: bool,
}

impl DrainRequirement {
    pub const NONE: DrainRequirement = DrainRequirement {
        drain: false,
        reboot: false,
    };

    /// Either side needing it means the node needs it
    pub fn merge(self, other: DrainRequirement) -> DrainRequirement {
        DrainRequirement {
            drain: self.drain || other.drain,
            reboot: self.reboot || other.reboot,
        }
    }

    pub fn any(&self) -> bool {
        self.drain || self.reboot
    }
}

/// Device configuration plugin
#[async_trait::async_trait]
pub trait VendorPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Works out what applying `desired` takes and remembers it for [`apply`](Self::apply).
    ///
    /// `desired` carries the spec to reach and the freshly observed status.
    async fn on_node_state_change(&mut self, desired: &NetworkNodeState) -> Result<DrainRequirement, PluginError>;

    /// Applies what the last [`on_node_state_change`](Self::on_node_state_change) planned
    async fn apply(&mut self) -> Result<(), PluginError>;

    /// Whether the host drifted from `desired` without a spec change
    async fn check_status_changes(&self, desired: &NetworkNodeState) -> Result<bool, PluginError>;
}

/// What a plugin factory gets to work with
#[derive(Clone)]
pub struct PluginContext {
    pub host: Arc<dyn HostOps>,
    pub checkpoint: Option<Checkpoint>,
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("checkpoint", &self.checkpoint.as_ref().map(|c| c.taken_at))
            .finish_non_exhaustive()
    }
}

/// Builds a plugin instance
pub type PluginFactory = fn(&PluginContext) -> Box<dyn VendorPlugin>;

/// Plugins selected for this host
#[derive(Default)]
pub struct PluginSet {
    pub main: Option<Box<dyn VendorPlugin>>,
    pub additional: Vec<Box<dyn VendorPlugin>>,
}

impl fmt::Debug for PluginSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginSet")
            .field("main", &self.main.as_ref().map(|p| p.name().to_string()))
            .field(
                "additional",
                &self.additional.iter().map(|p| p.name().to_string()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl PluginSet {
    /// Names of all loaded plugins, main first
    pub fn names(&self) -> Vec<String> {
        self.main
            .iter()
            .chain(self.additional.iter())
            .map(|p| p.name().to_string())
            .collect()
    }
}

/// Registry of known plugins
#[derive(Debug, Clone)]
pub struct PluginRegistry {
    main: HashMap<Platform, PluginFactory>,
    /// PCI vendor id (lowercase hex, no `0x`) -> factory
    additional: HashMap<String, PluginFactory>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl PluginRegistry {
    /// Registry without any plugins
    pub fn empty() -> Self {
        Self {
            main: HashMap::new(),
            additional: HashMap::new(),
        }
    }

    /// Registry with the built-in generic plugin as main plugin on every platform
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register_main(Platform::BareMetal, |ctx| {
            Box::new(GenericPlugin::bare_metal(Arc::clone(&ctx.host), ctx.checkpoint.clone()))
        });
        registry.register_main(Platform::Virtual, |ctx| {
            Box::new(GenericPlugin::virtual_machine(Arc::clone(&ctx.host)))
        });
        registry
    }

    pub fn register_main(&mut self, platform: Platform, factory: PluginFactory) {
        self.main.insert(platform, factory);
    }

    pub fn register_additional(&mut self, vendor_id: &str, factory: PluginFactory) {
        self.additional.insert(normalize_vendor(vendor_id), factory);
    }

    /// Instantiates the main plugin for `platform` and one additional plugin
    /// per distinct registered vendor in `vendors`
    pub fn load(&self, platform: Platform, vendors: &[String], ctx: &PluginContext) -> Result<PluginSet, PluginError> {
        let main = self
            .main
            .get(&platform)
            .ok_or_else(|| PluginError::NoMainPlugin(platform.to_string()))?;

        let mut seen = Vec::new();
        let mut additional = Vec::new();
        for vendor in vendors.iter().map(|v| normalize_vendor(v)) {
            if seen.contains(&vendor) {
                continue;
            }
            if let Some(factory) = self.additional.get(&vendor) {
                additional.push(factory(ctx));
            }
            seen.push(vendor);
        }

        let set = PluginSet {
            main: Some(main(ctx)),
            additional,
        };
        info!("Loaded plugins: {}", set.names().join(", "));
        Ok(set)
    }
}

fn normalize_vendor(vendor: &str) -> String {
    vendor.trim().trim_start_matches("0x").to_ascii_lowercase()
}

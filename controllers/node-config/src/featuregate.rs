//! Feature gates
//!
//! A table of named boolean switches built from compiled-in defaults plus
//! overrides supplied at startup. Built once in `main` and shared by `Arc`.

use crate::error::FeatureGateError;
use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

/// Restart the device plugin before applying and keep it blocked until the
/// new configuration is in place
pub const BLOCK_DEVICE_PLUGIN_UNTIL_CONFIGURED: &str = "blockDevicePluginUntilConfigured";

/// Report software bridges in the node state status
pub const MANAGE_SOFTWARE_BRIDGES: &str = "manageSoftwareBridges";

const DEFAULTS: &[(&str, bool)] = &[
    (BLOCK_DEVICE_PLUGIN_UNTIL_CONFIGURED, true),
    (MANAGE_SOFTWARE_BRIDGES, false),
];

/// Thread-safe feature flag table
#[derive(Debug)]
pub struct FeatureGate {
    features: RwLock<HashMap<String, bool>>,
}

impl Default for FeatureGate {
    fn default() -> Self {
        Self::new()
    }
}

impl FeatureGate {
    /// Gate holding only the compiled-in defaults
    pub fn new() -> Self {
        Self {
            features: RwLock::new(defaults()),
        }
    }

    /// Gate holding the defaults merged with `overrides`
    pub fn with_overrides(overrides: &HashMap<String, bool>) -> Self {
        let gate = Self::new();
        gate.init(Some(overrides));
        gate
    }

    /// Replaces the whole table with the defaults merged with `overrides`.
    ///
    /// Earlier overrides are discarded; `None` restores the defaults.
    pub fn init(&self, overrides: Option<&HashMap<String, bool>>) {
        let mut features = defaults();
        if let Some(overrides) = overrides {
            features.extend(overrides.iter().map(|(k, v)| (k.clone(), *v)));
        }

        let mut guard = self.features.write().unwrap_or_else(|e| e.into_inner());
        *guard = features;
    }

    /// Whether a feature is on. Unknown names are off.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.features
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .copied()
            .unwrap_or(false)
    }

    /// Parses `name=bool` pairs separated by commas
    pub fn parse_overrides(raw: &str) -> Result<HashMap<String, bool>, FeatureGateError> {
        let mut overrides = HashMap::new();
        for term in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let (name, value) = term
                .split_once('=')
                .ok_or_else(|| FeatureGateError::MissingValue(term.to_string()))?;
            let (name, value) = (name.trim(), value.trim());
            let enabled = value.parse::<bool>().map_err(|_| FeatureGateError::NotABool {
                name: name.to_string(),
                value: value.to_string(),
            })?;
            overrides.insert(name.to_string(), enabled);
        }
        Ok(overrides)
    }
}

fn defaults() -> HashMap<String, bool> {
    DEFAULTS.iter().map(|(k, v)| ((*k).to_string(), *v)).collect()
}

impl fmt::Display for FeatureGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let features = self.features.read().unwrap_or_else(|e| e.into_inner());
        let mut first = true;
        for (name, enabled) in features.iter() {
            if !first {
                f.write_str(" ")?;
            }
            write!(f, "{name}:{enabled}")?;
            first = false;
        }
        Ok(())
    }
}

//! Node drain annotation protocol
//!
//! Two annotations on a `NetworkNodeState` form the handshake between the
//! node daemon and whichever component performs the drain:
//!
//! - [`DESIRED_DRAIN_ANNOTATION`] is written only by the node daemon's
//!   reconciler and says what it needs ([`DesiredDrainState`]).
//! - [`CURRENT_DRAIN_ANNOTATION`] is written only by the drain executor and
//!   says how far the drain got ([`CurrentDrainState`]).
//!
//! Nothing else is shared between the two sides, so each field has exactly
//! one writer and no lock is needed.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Requested drain state, set by the node reconciler
pub const DESIRED_DRAIN_ANNOTATION: &str = "dcops.microscaler.io/desired-drain-state";

/// Progress of the drain, set by the drain executor
pub const CURRENT_DRAIN_ANNOTATION: &str = "dcops.microscaler.io/current-drain-state";

/// Mirror of the drain state on the Node object, for operators
pub const NODE_DRAIN_ANNOTATION: &str = "dcops.microscaler.io/drain-state";

/// Present when an external component owns draining for this node
pub const EXTERNAL_DRAINER_ANNOTATION: &str = "dcops.microscaler.io/use-external-drainer";

/// Set by the device plugin while it waits for configuration to finish
pub const DEVICE_PLUGIN_WAIT_CONFIG_ANNOTATION: &str = "dcops.microscaler.io/wait-for-config";

/// Error returned when an annotation holds a value outside the protocol
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid {field} drain state: {value:?}")]
pub struct ParseDrainStateError {
    /// Which side of the pair failed to parse
    pub field: &'static str,
    /// The offending value
    pub value: String,
}

/// What the node reconciler is asking for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DesiredDrainState {
    /// No drain needed
    Idle,
    /// Evict pods that use the managed devices
    DrainRequired,
    /// Evict everything, the node is about to reboot
    RebootRequired,
}

impl DesiredDrainState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesiredDrainState::Idle => "Idle",
            DesiredDrainState::DrainRequired => "DrainRequired",
            DesiredDrainState::RebootRequired => "RebootRequired",
        }
    }

    /// Whether this asks for any drain at all
    pub fn requires_drain(&self) -> bool {
        !matches!(self, DesiredDrainState::Idle)
    }
}

impl fmt::Display for DesiredDrainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DesiredDrainState {
    type Err = ParseDrainStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Idle" => Ok(DesiredDrainState::Idle),
            "DrainRequired" => Ok(DesiredDrainState::DrainRequired),
            "RebootRequired" => Ok(DesiredDrainState::RebootRequired),
            other => Err(ParseDrainStateError {
                field: "desired",
                value: other.to_string(),
            }),
        }
    }
}

/// How far the drain executor got
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CurrentDrainState {
    /// Node schedulable, nothing in flight
    Idle,
    /// Cordoned and evicting
    Draining,
    /// Cordoned and empty of the targeted pods
    DrainComplete,
}

impl CurrentDrainState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CurrentDrainState::Idle => "Idle",
            CurrentDrainState::Draining => "Draining",
            CurrentDrainState::DrainComplete => "DrainComplete",
        }
    }
}

impl fmt::Display for CurrentDrainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CurrentDrainState {
    type Err = ParseDrainStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Idle" => Ok(CurrentDrainState::Idle),
            "Draining" => Ok(CurrentDrainState::Draining),
            "DrainComplete" => Ok(CurrentDrainState::DrainComplete),
            other => Err(ParseDrainStateError {
                field: "current",
                value: other.to_string(),
            }),
        }
    }
}

/// Both halves of the drain handshake as read from one object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainPair {
    pub desired: DesiredDrainState,
    pub current: CurrentDrainState,
}

impl DrainPair {
    /// Both sides idle: no drain cycle in flight
    pub fn is_idle(&self) -> bool {
        self.desired == DesiredDrainState::Idle && self.current == CurrentDrainState::Idle
    }

    /// Desired value the reconciler should request next.
    ///
    /// A reboot request is never downgraded, and a pending drain is only
    /// upgraded to a reboot while the executor hasn't picked it up yet.
    pub fn next_request(&self, reboot: bool) -> DesiredDrainState {
        match (self.desired, self.current, reboot) {
            (DesiredDrainState::RebootRequired, _, _) => DesiredDrainState::RebootRequired,
            (_, CurrentDrainState::Idle, true) => DesiredDrainState::RebootRequired,
            (DesiredDrainState::DrainRequired, _, _) => DesiredDrainState::DrainRequired,
            (DesiredDrainState::Idle, CurrentDrainState::Idle, false) => DesiredDrainState::DrainRequired,
            // Executor is mid-cycle on a request we no longer hold; leave it alone.
            (DesiredDrainState::Idle, _, _) => DesiredDrainState::Idle,
        }
    }
}

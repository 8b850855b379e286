//! DCops Network CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the node network configuration
//! daemon, plus the annotation protocol used to coordinate node drains.

pub mod drain;
pub mod network_node_state;

pub use drain::*;
pub use network_node_state::*;

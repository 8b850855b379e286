//! Cluster API client for the node config daemon
//!
//! Wraps the handful of Kubernetes operations the daemon needs: reading and
//! annotating its `NetworkNodeState`, cordoning the node, listing, evicting
//! and deleting pods, and pausing OpenShift MachineConfigPools.
//!
//! All object mutations that touch annotations are read-modify-write with
//! the object's `resourceVersion`, retried on conflict, so concurrent writers
//! of *other* keys are never clobbered.
//!
//! # Example
//!
//! ```no_run
//! use cluster_client::{ClusterClientTrait, KubeClusterClient, PodSelector};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = KubeClusterClient::try_default("network-operator").await?;
//! let pods = client.list_pods(&PodSelector::on_node("worker-0")).await?;
//! println!("{} pods on worker-0", pods.len());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod cluster_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::KubeClusterClient;
pub use cluster_trait::ClusterClientTrait;
pub use error::ClusterError;
pub use models::*;
#[cfg(feature = "test-util")]
pub use mock::MockClusterClient;

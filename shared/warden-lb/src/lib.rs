//! Layer-4 Load Balancer Control Plane
//!
//! Health-checks backend nodes, computes per-node traffic weights and
//! reconciles them into the kernel's IPVS virtual-server table.
//! External commands go through a single non-blocking command bridge.

pub mod cluster;
pub mod collection;
pub mod config;
pub mod context;
pub mod executor;
pub mod health;
pub mod ipvs;
pub mod node;
pub mod status_file;
pub mod types;

#[cfg(test)]
mod test_support;

pub use cluster::{Cluster, ClusterKind};
pub use collection::{ClusterCollection, ReconcileReport};
pub use config::{load_clusters, parse_clusters};
pub use context::CheckContext;
pub use executor::{CommandExecutor, ShellExecutor};
pub use health::{HealthFetcher, HttpHealthFetcher};
pub use ipvs::{IpvsAdm, KernelTable};
pub use node::{ClusterScope, Node, INITIAL_WEIGHT};
pub use status_file::{StatusFileDir, StatusFiles};
pub use types::*;

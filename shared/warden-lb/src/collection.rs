//! Named set of clusters and configuration reconciliation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{info, warn};

use crate::cluster::Cluster;
use crate::ipvs::KernelTable;

/// What a call to [`ClusterCollection::config`] did
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Running clusters dropped from the configuration and stopped
    pub removed: Vec<String>,
    /// Clusters present before and after, merged with their running state
    pub incorporated: Vec<String>,
    /// New clusters, stopped until started
    pub added: Vec<String>,
    /// New clusters whose fwmark was already in the kernel and were resumed
    pub adopted: Vec<String>,
    pub reconciled_at: DateTime<Utc>,
}

impl ReconcileReport {
    fn new() -> Self {
        Self {
            removed: Vec::new(),
            incorporated: Vec::new(),
            added: Vec::new(),
            adopted: Vec::new(),
            reconciled_at: Utc::now(),
        }
    }

    fn finish(mut self) -> Self {
        self.removed.sort();
        self.incorporated.sort();
        self.added.sort();
        self.adopted.sort();
        self
    }

    pub fn changes(&self) -> usize {
        self.removed.len() + self.added.len() + self.adopted.len()
    }
}

#[derive(Debug, Default)]
pub struct ClusterCollection {
    clusters: HashMap<String, Cluster>,
}

impl ClusterCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the configured clusters with `new_clusters`.
    ///
    /// Removed clusters are stopped first. Clusters that keep their name
    /// inherit the running state of their predecessor; a relay replaced by
    /// a fully monitored cluster releases its fwmark beforehand. Unknown
    /// clusters whose fwmark already exists in the kernel are resumed from
    /// it, the rest are added stopped.
    pub async fn config(
        &mut self,
        new_clusters: HashMap<String, Cluster>,
        kernel: &dyn KernelTable,
    ) -> ReconcileReport {
        let mut report = ReconcileReport::new();

        let removed: Vec<String> = self
            .clusters
            .keys()
            .filter(|name| !new_clusters.contains_key(*name))
            .cloned()
            .collect();
        for name in removed {
            if let Some(mut cluster) = self.clusters.remove(&name) {
                cluster.stop_monitoring(kernel).await;
            }
            report.removed.push(name);
        }

        let kernel_state = match kernel.running_configuration().await {
            Ok(state) => state,
            Err(e) => {
                warn!(error = %e, "Failed to read kernel state, assuming it is empty");
                HashMap::new()
            }
        };

        for (name, mut new_cluster) in new_clusters {
            if let Some(mut current) = self.clusters.remove(&name) {
                if !current.kind.is_fully_monitored() && new_cluster.kind.is_fully_monitored() {
                    current.stop_relay_fwmark(kernel).await;
                }
                let merged = new_cluster.incorporate_state(current, kernel).await;
                self.clusters.insert(name.clone(), merged);
                report.incorporated.push(name);
                continue;
            }

            match kernel_state.get(&new_cluster.fwmark.to_string()) {
                Some(existing) => {
                    info!(
                        cluster = %new_cluster,
                        "Resuming previously running cluster from kernel state"
                    );
                    new_cluster.resume_monitoring(kernel, existing).await;
                    report.adopted.push(name.clone());
                }
                None => report.added.push(name.clone()),
            }
            self.clusters.insert(name, new_cluster);
        }

        report.finish()
    }

    pub fn get(&self, name: &str) -> Option<&Cluster> {
        self.clusters.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Cluster> {
        self.clusters.get_mut(name)
    }

    /// Insert or replace a cluster without reconciling
    pub fn insert(&mut self, cluster: Cluster) -> Option<Cluster> {
        self.clusters.insert(cluster.name.clone(), cluster)
    }

    pub fn remove(&mut self, name: &str) -> Option<Cluster> {
        self.clusters.remove(name)
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    pub fn clear(&mut self) {
        self.clusters.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Cluster> {
        self.clusters.values_mut()
    }

    pub fn running(&self) -> Vec<&Cluster> {
        self.clusters.values().filter(|c| c.is_monitored()).collect()
    }

    pub fn stopped(&self) -> Vec<&Cluster> {
        self.clusters.values().filter(|c| !c.is_monitored()).collect()
    }

    pub fn ready_for_check(&self, now: Instant) -> Vec<&Cluster> {
        self.clusters.values().filter(|c| c.needs_check(now)).collect()
    }

    pub fn ready_for_check_mut(&mut self, now: Instant) -> Vec<&mut Cluster> {
        self.clusters.values_mut().filter(|c| c.needs_check(now)).collect()
    }
}

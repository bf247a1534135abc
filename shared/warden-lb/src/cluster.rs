//! Virtual server and the nodes behind it

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::context::CheckContext;
use crate::ipvs::KernelTable;
use crate::node::{ClusterScope, Node, INITIAL_WEIGHT};
use crate::types::VirtualService;

pub const DEFAULT_SCHEDULER: &str = "wrr";
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_RAMP_UP_TIME: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterKind {
    /// Every node carries traffic in proportion to its weight
    #[default]
    Active,
    /// Only the best-ranked healthy node carries traffic
    ActivePassive,
    /// Passthrough at fixed full weight, no health checks
    Relay,
}

impl ClusterKind {
    pub fn is_fully_monitored(self) -> bool {
        !matches!(self, Self::Relay)
    }
}

/// One fwmark virtual server.
///
/// Starts stopped; `start_monitoring` / `resume_monitoring` move it to
/// monitored and `stop_monitoring` back. Kernel command failures are
/// logged and never abort an operation: the weights actually accepted by
/// the kernel are tracked so a failed change is retried on the next cycle.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub name: String,
    pub fwmark: u32,
    pub port: Option<u16>,
    pub scheduler: String,
    pub kind: ClusterKind,
    pub check_interval: Duration,
    pub ramp_up_time: Duration,
    /// Start monitoring as soon as the controller loads the cluster
    pub autostart: bool,
    nodes: Vec<Node>,
    monitored: bool,
    last_check: Option<Instant>,
    kernel_weights: HashMap<SocketAddr, u32>,
}

impl Cluster {
    pub fn new(name: impl Into<String>, fwmark: u32) -> Self {
        Self {
            name: name.into(),
            fwmark,
            port: None,
            scheduler: DEFAULT_SCHEDULER.to_string(),
            kind: ClusterKind::default(),
            check_interval: DEFAULT_CHECK_INTERVAL,
            ramp_up_time: DEFAULT_RAMP_UP_TIME,
            autostart: false,
            nodes: Vec::new(),
            monitored: false,
            last_check: None,
            kernel_weights: HashMap::new(),
        }
    }

    pub fn with_kind(mut self, kind: ClusterKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_nodes(mut self, nodes: Vec<Node>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_scheduler(mut self, scheduler: impl Into<String>) -> Self {
        self.scheduler = scheduler.into();
        self
    }

    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    pub fn with_ramp_up_time(mut self, ramp_up_time: Duration) -> Self {
        self.ramp_up_time = ramp_up_time;
        self
    }

    pub fn with_autostart(mut self, autostart: bool) -> Self {
        self.autostart = autostart;
        self
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn find_node(&self, address: SocketAddr) -> Option<&Node> {
        self.nodes.iter().find(|n| n.socket_addr() == address)
    }

    pub fn is_monitored(&self) -> bool {
        self.monitored
    }

    pub fn last_check(&self) -> Option<Instant> {
        self.last_check
    }

    /// Weight the kernel last accepted for `address`
    pub fn kernel_weight(&self, address: SocketAddr) -> Option<u32> {
        self.kernel_weights.get(&address).copied()
    }

    /// Best-ranked healthy node
    pub fn preferred_node(&self) -> Option<&Node> {
        self.nodes.iter().filter(|n| n.is_healthy()).min()
    }

    pub fn needs_check(&self, now: Instant) -> bool {
        if !self.monitored || !self.kind.is_fully_monitored() {
            return false;
        }
        match self.last_check {
            Some(last) => now.saturating_duration_since(last) >= self.check_interval,
            None => true,
        }
    }

    pub async fn start_monitoring(&mut self, kernel: &dyn KernelTable) {
        info!(cluster = %self, kind = ?self.kind, nodes = self.nodes.len(), "Starting monitoring");

        // a failed create leaves whatever the kernel still holds tracked
        match kernel.create(self.fwmark, &self.scheduler).await {
            Ok(()) => self.kernel_weights.clear(),
            Err(e) => warn!(cluster = %self, error = %e, "Failed to create virtual service"),
        }

        let kind = self.kind;
        for node in &mut self.nodes {
            match kind {
                ClusterKind::Relay => node.weight = Some(node.full_weight()),
                _ => node.initialize_weight(),
            }
        }

        let targets = self.entry_weights();
        self.sync_kernel(kernel, targets).await;
        self.monitored = true;
        self.last_check = None;
    }

    /// Take over a virtual service that already exists in the kernel
    /// (e.g. after a process restart) without recreating it.
    pub async fn resume_monitoring(&mut self, kernel: &dyn KernelTable, existing: &VirtualService) {
        info!(
            cluster = %self,
            servers = existing.servers.len(),
            "Resuming monitoring from kernel state"
        );

        self.kernel_weights = existing
            .servers
            .iter()
            .map(|server| (server.address, server.weight))
            .collect();

        let stale: Vec<SocketAddr> = self
            .kernel_weights
            .keys()
            .filter(|address| self.find_node(**address).is_none())
            .copied()
            .collect();
        self.remove_servers(kernel, stale).await;

        let kind = self.kind;
        for node in &mut self.nodes {
            match self.kernel_weights.get(&node.socket_addr()) {
                Some(&weight) if kind.is_fully_monitored() => node.weight = Some(weight),
                Some(_) => node.weight = Some(node.full_weight()),
                None if kind == ClusterKind::Relay => node.weight = Some(node.full_weight()),
                None => node.initialize_weight(),
            }
        }

        let targets = self.admission_targets();
        self.sync_kernel(kernel, targets).await;
        self.monitored = true;
        self.last_check = None;
    }

    pub async fn stop_monitoring(&mut self, kernel: &dyn KernelTable) {
        info!(cluster = %self, "Stopping monitoring");

        match kernel.remove(self.fwmark).await {
            Ok(()) => self.kernel_weights.clear(),
            Err(e) => warn!(cluster = %self, error = %e, "Failed to remove virtual service"),
        }

        for node in &mut self.nodes {
            node.invalidate_weight();
        }
        self.monitored = false;
    }

    /// Release the kernel entry held by a relay so the fwmark can be taken
    /// over by a fully monitored cluster. No-op for other kinds.
    pub async fn stop_relay_fwmark(&mut self, kernel: &dyn KernelTable) {
        if self.kind != ClusterKind::Relay {
            debug!(cluster = %self, "Not a relay, nothing to release");
            return;
        }

        info!(cluster = %self, "Releasing relay fwmark");
        match kernel.remove(self.fwmark).await {
            Ok(()) => self.kernel_weights.clear(),
            Err(e) => warn!(cluster = %self, error = %e, "Failed to release relay fwmark"),
        }
        self.monitored = false;
    }

    /// One check cycle: probe every node concurrently, then push the
    /// resulting weights into the kernel.
    pub async fn monitor_nodes(&mut self, ctx: &CheckContext, now: Instant) {
        self.last_check = Some(now);
        if !self.kind.is_fully_monitored() {
            return;
        }

        let scope = ClusterScope {
            name: &self.name,
            ramp_up_time: self.ramp_up_time,
        };
        join_all(self.nodes.iter_mut().map(move |node| node.monitor(scope, ctx, now))).await;

        let previously_active = self.kernel_active();
        let targets = self.check_weights();
        self.sync_kernel(ctx.kernel.as_ref(), targets).await;

        if self.kind == ClusterKind::ActivePassive {
            let active = self.kernel_active();
            if active != previously_active {
                info!(
                    cluster = %self,
                    from = ?previously_active,
                    to = ?active,
                    "Active node changed"
                );
            }
        }
    }

    /// Merge this freshly configured cluster with the running instance it
    /// replaces. Nodes present in both keep their weight and ramp-up clock,
    /// new nodes start fresh and vanished nodes are dropped. Monitoring
    /// state carries over only when both are the same kind.
    pub async fn incorporate_state(mut self, mut previous: Cluster, kernel: &dyn KernelTable) -> Cluster {
        self.nodes = std::mem::take(&mut self.nodes)
            .into_iter()
            .map(|node| match previous.find_node(node.socket_addr()) {
                Some(prev) => node.incorporate_state(prev),
                None => {
                    let mut node = node;
                    node.initialize_weight();
                    node
                }
            })
            .collect();

        if self.kind != previous.kind {
            debug!(
                cluster = %self,
                from = ?previous.kind,
                to = ?self.kind,
                "Cluster kind changed, starting from configuration"
            );
            if previous.monitored {
                previous.stop_monitoring(kernel).await;
            }
            return self;
        }

        self.monitored = previous.monitored;
        self.last_check = previous.last_check;
        if !self.monitored {
            return self;
        }

        if self.fwmark != previous.fwmark {
            warn!(
                cluster = %self.name,
                configured = self.fwmark,
                running = previous.fwmark,
                "Ignoring fwmark change of a running cluster; remove and re-add it to move"
            );
            self.fwmark = previous.fwmark;
        }
        self.kernel_weights = previous.kernel_weights;

        let departed: Vec<SocketAddr> = self
            .kernel_weights
            .keys()
            .filter(|address| self.find_node(**address).is_none())
            .copied()
            .collect();
        self.remove_servers(kernel, departed).await;

        let targets = self.admission_targets();
        self.sync_kernel(kernel, targets).await;

        self
    }

    /// Weights used when a node first enters the kernel table. An
    /// active/passive cluster admits only its active node with traffic.
    fn entry_weights(&self) -> Vec<(usize, u32)> {
        let active = match self.kind {
            ClusterKind::ActivePassive => self
                .kernel_active()
                .or_else(|| self.preferred_node().map(Node::socket_addr)),
            _ => None,
        };

        self.nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| match self.kind {
                ClusterKind::Relay => (idx, node.full_weight()),
                ClusterKind::ActivePassive if Some(node.socket_addr()) != active => (idx, 0),
                _ => (idx, INITIAL_WEIGHT),
            })
            .collect()
    }

    /// Entry weights for nodes the kernel does not hold yet. Relays are
    /// pinned to full weight, so every node is a target.
    fn admission_targets(&self) -> Vec<(usize, u32)> {
        match self.kind {
            ClusterKind::Relay => self.entry_weights(),
            _ => self
                .entry_weights()
                .into_iter()
                .filter(|(idx, _)| !self.kernel_weights.contains_key(&self.nodes[*idx].socket_addr()))
                .collect(),
        }
    }

    /// Kernel weights derived from the last check
    fn check_weights(&self) -> Vec<(usize, u32)> {
        let computed = self
            .nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (idx, node.weight.unwrap_or(0)));

        match self.kind {
            ClusterKind::ActivePassive => {
                let preferred = self.preferred_node().map(Node::socket_addr);
                computed
                    .map(|(idx, weight)| {
                        if Some(self.nodes[idx].socket_addr()) == preferred {
                            (idx, weight)
                        } else {
                            (idx, 0)
                        }
                    })
                    .collect()
            }
            _ => computed.collect(),
        }
    }

    /// Best-ranked node currently carrying traffic in the kernel
    fn kernel_active(&self) -> Option<SocketAddr> {
        self.nodes
            .iter()
            .filter(|node| self.kernel_weight(node.socket_addr()).is_some_and(|weight| weight > 0))
            .min()
            .map(Node::socket_addr)
    }

    /// Issue `add_node` / `apply` for every target that differs from what
    /// the kernel holds. Commands run concurrently.
    async fn sync_kernel(&mut self, kernel: &dyn KernelTable, targets: Vec<(usize, u32)>) {
        let fwmark = self.fwmark;
        let changes: Vec<(SocketAddr, u32, bool)> = targets
            .into_iter()
            .filter_map(|(idx, weight)| {
                let address = self.nodes[idx].socket_addr();
                match self.kernel_weights.get(&address) {
                    Some(&current) if current == weight => None,
                    Some(_) => Some((address, weight, true)),
                    None => Some((address, weight, false)),
                }
            })
            .collect();

        let results = join_all(changes.iter().map(|&(address, weight, present)| async move {
            if present {
                kernel.apply(fwmark, address, weight).await
            } else {
                kernel.add_node(fwmark, address, weight).await
            }
        }))
        .await;

        for ((address, weight, _), result) in changes.into_iter().zip(results) {
            match result {
                Ok(()) => {
                    debug!(cluster = %self, node = %address, weight, "Kernel weight updated");
                    self.kernel_weights.insert(address, weight);
                }
                Err(e) => warn!(
                    cluster = %self,
                    node = %address,
                    weight,
                    error = %e,
                    "Kernel update failed, will retry next cycle"
                ),
            }
        }
    }

    async fn remove_servers(&mut self, kernel: &dyn KernelTable, servers: Vec<SocketAddr>) {
        for address in servers {
            match kernel.remove_node(self.fwmark, address).await {
                Ok(()) => {
                    info!(cluster = %self, node = %address, "Removed real server");
                    self.kernel_weights.remove(&address);
                }
                Err(e) => warn!(cluster = %self, node = %address, error = %e, "Failed to remove real server"),
            }
        }
    }
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (fwmark {})", self.name, self.fwmark)
    }
}

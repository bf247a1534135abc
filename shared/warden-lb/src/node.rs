//! Backend node health and weight state

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::context::CheckContext;

/// Weight a node gets when it enters the kernel table, before its first check
pub const INITIAL_WEIGHT: u32 = 1;

/// Upper bound of a health score and of the ramp-up weight
pub const MAX_HEALTH: u32 = 100;

pub const UP_FLAG: &str = "up";
pub const DOWN_FLAG: &str = "down";

/// The parts of a cluster a node needs while computing its weight
#[derive(Debug, Clone, Copy)]
pub struct ClusterScope<'a> {
    pub name: &'a str,
    pub ramp_up_time: Duration,
}

/// One backend behind a virtual server.
///
/// Identity is the `(address, port)` pair; every other field is ignored by
/// `==` and `Hash`.
#[derive(Debug, Clone)]
pub struct Node {
    pub address: IpAddr,
    pub port: u16,
    pub path: String,
    pub priority: i32,
    pub weight: Option<u32>,
    pub max_weight: Option<u32>,
    start_time: Instant,
}

impl Node {
    pub fn new(address: IpAddr, port: u16, path: impl Into<String>, start_time: Instant) -> Self {
        Self {
            address,
            port,
            path: path.into(),
            priority: 0,
            weight: None,
            max_weight: None,
            start_time,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_weight(mut self, max_weight: u32) -> Self {
        self.max_weight = Some(max_weight);
        self
    }

    pub fn with_weight(mut self, weight: Option<u32>) -> Self {
        self.weight = weight;
        self
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// Take the node out of rotation without removing it
    pub fn invalidate_weight(&mut self) {
        self.weight = Some(0);
    }

    pub fn initialize_weight(&mut self) {
        self.weight = Some(INITIAL_WEIGHT);
    }

    /// Time since the node started, zero if `now` precedes the start
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.start_time)
    }

    /// Whether the node currently carries traffic
    pub fn is_healthy(&self) -> bool {
        self.weight.unwrap_or(0) > 0
    }

    /// Full weight, capped by `max_weight`. Used for passthrough clusters.
    pub fn full_weight(&self) -> u32 {
        self.cap(MAX_HEALTH)
    }

    /// Compute, store and return this tick's weight.
    pub async fn monitor(&mut self, cluster: ClusterScope<'_>, ctx: &CheckContext, now: Instant) -> u32 {
        let weight = self.determine_weight(cluster, ctx, now).await;
        debug!(cluster = cluster.name, node = %self, weight, "Node checked");
        self.weight = Some(weight);
        weight
    }

    async fn determine_weight(&self, cluster: ClusterScope<'_>, ctx: &CheckContext, now: Instant) -> u32 {
        if self.flag_present(DOWN_FLAG, cluster, ctx) {
            return 0;
        }
        // not capped by max_weight
        if self.flag_present(UP_FLAG, cluster, ctx) {
            return MAX_HEALTH;
        }

        let health = match ctx.health.current_health(self).await {
            Ok(health) => u32::from(health).min(MAX_HEALTH),
            Err(e) => {
                warn!(cluster = cluster.name, node = %self, error = %e, "Health probe failed, treating node as down");
                0
            }
        };

        self.cap(health.min(self.ramp_weight(cluster.ramp_up_time, now)))
    }

    fn ramp_weight(&self, ramp_up_time: Duration, now: Instant) -> u32 {
        if ramp_up_time.is_zero() {
            return MAX_HEALTH;
        }
        let fraction = (self.age(now).as_secs_f64() / ramp_up_time.as_secs_f64()).min(1.0);
        (fraction * MAX_HEALTH as f64).floor() as u32
    }

    fn cap(&self, weight: u32) -> u32 {
        match self.max_weight {
            Some(max) => weight.min(max),
            None => weight,
        }
    }

    fn flag_present(&self, flag: &str, cluster: ClusterScope<'_>, ctx: &CheckContext) -> bool {
        ctx.status.exists(flag, cluster.name) || ctx.status.exists(flag, &self.status_scope(cluster.name))
    }

    /// Status-file scope of this node inside `cluster`
    pub fn status_scope(&self, cluster: &str) -> String {
        format!("{}/{}", cluster, self.socket_addr())
    }

    /// Keep this node's configuration but carry over the weight and ramp-up
    /// clock of the instance it replaces.
    pub fn incorporate_state(mut self, previous: &Node) -> Self {
        self.weight = previous.weight;
        self.start_time = previous.start_time;
        self
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address && self.port == other.port
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.address.hash(state);
        self.port.hash(state);
    }
}

/// Failover ranking: healthy before unhealthy (`None` or `0` weight), then
/// lower priority, then lower address. Port only breaks the remaining tie.
impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .is_healthy()
            .cmp(&self.is_healthy())
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| self.address.cmp(&other.address))
            .then_with(|| self.port.cmp(&other.port))
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

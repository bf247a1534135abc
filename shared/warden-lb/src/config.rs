//! Cluster definitions file
//!
//! ```yaml
//! web:
//!   fwmark: 100
//!   kind: active_passive
//!   ramp_up_time: 30
//!   nodes:
//!     - address: 10.0.0.1
//!       port: 8080
//!       path: /health
//!       priority: 1
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::cluster::{Cluster, ClusterKind, DEFAULT_SCHEDULER};
use crate::node::Node;
use crate::types::LbError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterDefinition {
    pub fwmark: u32,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_scheduler")]
    pub scheduler: String,
    /// Seconds between checks
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    /// Seconds for a new node to reach full weight
    #[serde(default = "default_ramp_up_time")]
    pub ramp_up_time: u64,
    #[serde(default)]
    pub kind: ClusterKind,
    #[serde(default = "default_autostart")]
    pub autostart: bool,
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub address: IpAddr,
    pub port: u16,
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub max_weight: Option<u32>,
}

fn default_scheduler() -> String {
    DEFAULT_SCHEDULER.to_string()
}

fn default_check_interval() -> u64 {
    1
}

fn default_ramp_up_time() -> u64 {
    60
}

fn default_autostart() -> bool {
    true
}

fn default_path() -> String {
    "/".to_string()
}

impl ClusterDefinition {
    /// Build the cluster; node ramp-up clocks start at `now`.
    pub fn into_cluster(self, name: &str, now: Instant) -> Cluster {
        let nodes = self
            .nodes
            .into_iter()
            .map(|def| {
                let node = Node::new(def.address, def.port, def.path, now).with_priority(def.priority);
                match def.max_weight {
                    Some(max) => node.with_max_weight(max),
                    None => node,
                }
            })
            .collect();

        let cluster = Cluster::new(name, self.fwmark)
            .with_kind(self.kind)
            .with_scheduler(self.scheduler)
            .with_check_interval(Duration::from_secs(self.check_interval))
            .with_ramp_up_time(Duration::from_secs(self.ramp_up_time))
            .with_autostart(self.autostart)
            .with_nodes(nodes);

        match self.port {
            Some(port) => cluster.with_port(port),
            None => cluster,
        }
    }
}

/// Parse and validate a cluster file
pub fn parse_clusters(yaml: &str, now: Instant) -> Result<HashMap<String, Cluster>, LbError> {
    let definitions: BTreeMap<String, ClusterDefinition> =
        serde_yaml::from_str(yaml).map_err(|e| LbError::Config(format!("Invalid cluster file: {}", e)))?;

    validate(&definitions)?;

    Ok(definitions
        .into_iter()
        .map(|(name, def)| {
            let cluster = def.into_cluster(&name, now);
            (name, cluster)
        })
        .collect())
}

pub async fn load_clusters(path: impl AsRef<Path>, now: Instant) -> Result<HashMap<String, Cluster>, LbError> {
    let path = path.as_ref();
    let yaml = tokio::fs::read_to_string(path).await?;
    let clusters = parse_clusters(&yaml, now)?;
    debug!(path = %path.display(), clusters = clusters.len(), "Cluster file loaded");
    Ok(clusters)
}

fn validate(definitions: &BTreeMap<String, ClusterDefinition>) -> Result<(), LbError> {
    let mut fwmarks: HashMap<u32, &str> = HashMap::new();

    for (name, def) in definitions {
        if let Some(other) = fwmarks.insert(def.fwmark, name) {
            return Err(LbError::Config(format!(
                "fwmark {} is used by both `{}` and `{}`",
                def.fwmark, other, name
            )));
        }
        if def.check_interval == 0 {
            return Err(LbError::Config(format!("`{}`: check_interval must be positive", name)));
        }

        let mut seen = HashSet::new();
        for node in &def.nodes {
            let address = SocketAddr::new(node.address, node.port);
            if !seen.insert(address) {
                return Err(LbError::Config(format!("`{}`: node {} is listed twice", name, address)));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CLUSTERS: &str = r#"
web:
  fwmark: 100
  port: 80
  ramp_up_time: 30
  nodes:
    - address: 10.0.0.1
      port: 8080
      path: /health
      priority: 1
    - address: 10.0.0.2
      port: 8080
      max_weight: 40
db:
  fwmark: 200
  kind: active_passive
  scheduler: sh
  check_interval: 5
  autostart: false
  nodes:
    - address: "2001:db8::5"
      port: 5432
edge:
  fwmark: 300
  kind: relay
"#;

    #[test]
    fn test_parse_with_defaults() {
        let now = Instant::now();
        let clusters = parse_clusters(CLUSTERS, now).unwrap();
        assert_eq!(clusters.len(), 3);

        let web = &clusters["web"];
        assert_eq!(web.name, "web");
        assert_eq!(web.fwmark, 100);
        assert_eq!(web.port, Some(80));
        assert_eq!(web.scheduler, "wrr");
        assert_eq!(web.kind, ClusterKind::Active);
        assert_eq!(web.check_interval, Duration::from_secs(1));
        assert_eq!(web.ramp_up_time, Duration::from_secs(30));
        assert!(web.autostart);
        assert!(!web.is_monitored());

        let nodes = web.nodes();
        assert_eq!(nodes[0].path, "/health");
        assert_eq!(nodes[0].priority, 1);
        assert_eq!(nodes[1].path, "/");
        assert_eq!(nodes[1].max_weight, Some(40));
        assert_eq!(nodes[1].start_time(), now);
        assert_eq!(nodes[1].weight, None);

        let db = &clusters["db"];
        assert_eq!(db.kind, ClusterKind::ActivePassive);
        assert_eq!(db.scheduler, "sh");
        assert_eq!(db.check_interval, Duration::from_secs(5));
        assert!(!db.autostart);
        assert_eq!(db.nodes()[0].socket_addr(), "[2001:db8::5]:5432".parse().unwrap());

        assert_eq!(clusters["edge"].kind, ClusterKind::Relay);
        assert!(clusters["edge"].nodes().is_empty());
    }

    #[test]
    fn test_duplicate_fwmark_rejected() {
        let yaml = "a:\n  fwmark: 7\nb:\n  fwmark: 7\n";
        let err = parse_clusters(yaml, Instant::now()).unwrap_err();
        assert!(matches!(err, LbError::Config(ref msg) if msg.contains("fwmark 7")));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let yaml = r#"
a:
  fwmark: 1
  nodes:
    - { address: 10.0.0.1, port: 80 }
    - { address: 10.0.0.1, port: 80, path: /other }
"#;
        let err = parse_clusters(yaml, Instant::now()).unwrap_err();
        assert!(matches!(err, LbError::Config(ref msg) if msg.contains("10.0.0.1:80")));
    }

    #[test]
    fn test_same_address_different_port_allowed() {
        let yaml = r#"
a:
  fwmark: 1
  nodes:
    - { address: 10.0.0.1, port: 80 }
    - { address: 10.0.0.1, port: 81 }
"#;
        assert_eq!(parse_clusters(yaml, Instant::now()).unwrap()["a"].nodes().len(), 2);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        assert!(matches!(parse_clusters("web: [1, 2", Instant::now()), Err(LbError::Config(_))));
        assert!(matches!(
            parse_clusters("web:\n  fwmark: 1\n  kind: round_robin\n", Instant::now()),
            Err(LbError::Config(_))
        ));
        assert!(matches!(
            parse_clusters("web:\n  fwmark: 1\n  check_interval: 0\n", Instant::now()),
            Err(LbError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_load_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CLUSTERS.as_bytes()).unwrap();

        let clusters = load_clusters(file.path(), Instant::now()).await.unwrap();
        assert_eq!(clusters.len(), 3);

        let missing = load_clusters("/nonexistent/clusters.yaml", Instant::now()).await;
        assert!(matches!(missing, Err(LbError::Io(_))));
    }
}

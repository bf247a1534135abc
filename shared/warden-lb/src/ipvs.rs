//! Kernel virtual-server table
//!
//! [`KernelTable`] is what clusters program; [`IpvsAdm`] implements it by
//! shelling out to `ipvsadm` through the command bridge.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::executor::CommandExecutor;
use crate::types::{LbError, RealServer, VirtualService};

#[async_trait]
pub trait KernelTable: Send + Sync {
    /// Snapshot of every fwmark service, keyed by the fwmark as text
    async fn running_configuration(&self) -> Result<HashMap<String, VirtualService>, LbError>;

    /// Create the fwmark virtual service
    async fn create(&self, fwmark: u32, scheduler: &str) -> Result<(), LbError>;

    /// Delete the fwmark virtual service and all of its real servers
    async fn remove(&self, fwmark: u32) -> Result<(), LbError>;

    /// Add a real server, or set its weight when it is already present
    async fn add_node(&self, fwmark: u32, server: SocketAddr, weight: u32) -> Result<(), LbError>;

    /// Set a real server's weight
    async fn apply(&self, fwmark: u32, server: SocketAddr, weight: u32) -> Result<(), LbError>;

    async fn remove_node(&self, fwmark: u32, server: SocketAddr) -> Result<(), LbError>;
}

#[derive(Clone)]
pub struct IpvsAdm {
    binary: String,
    executor: Arc<dyn CommandExecutor>,
}

impl IpvsAdm {
    pub fn new(binary: impl Into<String>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            binary: binary.into(),
            executor,
        }
    }

    async fn run(&self, args: &str) -> Result<String, LbError> {
        let command = format!("{} {}", self.binary, args);
        let output = self.executor.invoke(&command).await?;
        Ok(output.into_result(&command)?.output)
    }

    fn server_args(fwmark: u32, server: SocketAddr) -> String {
        format!("--fwmark-service {} --real-server {}", fwmark, server)
    }

    async fn add_server(&self, fwmark: u32, server: SocketAddr, weight: u32) -> Result<(), LbError> {
        self.run(&format!("--add-server {} --ipip --weight {}", Self::server_args(fwmark, server), weight))
            .await
            .map(drop)
    }

    async fn edit_server(&self, fwmark: u32, server: SocketAddr, weight: u32) -> Result<(), LbError> {
        self.run(&format!("--edit-server {} --ipip --weight {}", Self::server_args(fwmark, server), weight))
            .await
            .map(drop)
    }
}

#[async_trait]
impl KernelTable for IpvsAdm {
    async fn running_configuration(&self) -> Result<HashMap<String, VirtualService>, LbError> {
        let output = self.run("--save --numeric").await?;
        Ok(parse_save_output(&output))
    }

    async fn create(&self, fwmark: u32, scheduler: &str) -> Result<(), LbError> {
        self.run(&format!("--add-service --fwmark-service {} --scheduler {}", fwmark, scheduler))
            .await
            .map(drop)
    }

    async fn remove(&self, fwmark: u32) -> Result<(), LbError> {
        self.run(&format!("--delete-service --fwmark-service {}", fwmark))
            .await
            .map(drop)
    }

    async fn add_node(&self, fwmark: u32, server: SocketAddr, weight: u32) -> Result<(), LbError> {
        match self.add_server(fwmark, server, weight).await {
            Err(LbError::CommandFailed { .. }) => {
                debug!(fwmark, server = %server, "Add failed, editing existing real server instead");
                self.edit_server(fwmark, server, weight).await
            }
            other => other,
        }
    }

    async fn apply(&self, fwmark: u32, server: SocketAddr, weight: u32) -> Result<(), LbError> {
        match self.edit_server(fwmark, server, weight).await {
            Err(LbError::CommandFailed { .. }) => {
                debug!(fwmark, server = %server, "Edit failed, adding real server instead");
                self.add_server(fwmark, server, weight).await
            }
            other => other,
        }
    }

    async fn remove_node(&self, fwmark: u32, server: SocketAddr) -> Result<(), LbError> {
        self.run(&format!("--delete-server {}", Self::server_args(fwmark, server)))
            .await
            .map(drop)
    }
}

enum SaveEntry<'a> {
    Service { fwmark: u32, scheduler: &'a str },
    Server { fwmark: u32, server: RealServer },
}

/// Parse `ipvsadm --save --numeric`. Only fwmark services are kept;
/// malformed lines are logged and skipped.
///
/// ```text
/// -A -f 100 -s wrr
/// -a -f 100 -r 10.0.0.1:80 -i -w 40
/// ```
pub fn parse_save_output(output: &str) -> HashMap<String, VirtualService> {
    let mut services: HashMap<String, VirtualService> = HashMap::new();

    for line in output.lines() {
        let entry = match parse_save_line(line) {
            Ok(Some(entry)) => entry,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "Skipping unparsable kernel table line");
                continue;
            }
        };

        match entry {
            SaveEntry::Service { fwmark, scheduler } => {
                services
                    .entry(fwmark.to_string())
                    .or_insert_with(|| VirtualService::new(fwmark, scheduler))
                    .scheduler = scheduler.to_string();
            }
            SaveEntry::Server { fwmark, server } => services
                .entry(fwmark.to_string())
                .or_insert_with(|| VirtualService::new(fwmark, "wlc"))
                .servers
                .push(server),
        }
    }

    services
}

fn parse_save_line(line: &str) -> Result<Option<SaveEntry<'_>>, LbError> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(&kind) = tokens.first() else {
        return Ok(None);
    };
    let Some(fwmark) = option_value(&tokens, "-f") else {
        return Ok(None);
    };
    let fwmark: u32 = fwmark
        .parse()
        .map_err(|e| LbError::Parse(format!("bad fwmark in `{}`: {}", line, e)))?;

    match kind {
        "-A" => Ok(Some(SaveEntry::Service {
            fwmark,
            scheduler: option_value(&tokens, "-s").unwrap_or("wlc"),
        })),
        "-a" => {
            let address = option_value(&tokens, "-r")
                .ok_or_else(|| LbError::Parse(format!("missing real server in `{}`", line)))
                .and_then(parse_real_server)?;
            let weight = option_value(&tokens, "-w")
                .map(|w| w.parse::<u32>())
                .transpose()
                .map_err(|e| LbError::Parse(format!("bad weight in `{}`: {}", line, e)))?
                .unwrap_or(1);
            Ok(Some(SaveEntry::Server {
                fwmark,
                server: RealServer { address, weight },
            }))
        }
        _ => Ok(None),
    }
}

fn option_value<'a>(tokens: &[&'a str], flag: &str) -> Option<&'a str> {
    tokens
        .iter()
        .position(|t| *t == flag)
        .and_then(|idx| tokens.get(idx + 1))
        .copied()
}

fn parse_real_server(raw: &str) -> Result<SocketAddr, LbError> {
    raw.parse::<SocketAddr>()
        .or_else(|_| raw.parse::<IpAddr>().map(|ip| SocketAddr::new(ip, 0)))
        .map_err(|e| LbError::Parse(format!("bad real server `{}`: {}", raw, e)))
}

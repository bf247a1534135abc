//! In-memory collaborators for unit tests

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::context::CheckContext;
use crate::executor::CommandExecutor;
use crate::health::HealthFetcher;
use crate::ipvs::KernelTable;
use crate::node::Node;
use crate::status_file::StatusFiles;
use crate::types::{CommandOutput, LbError, RealServer, VirtualService};

pub fn context(
    health: Arc<FakeHealth>,
    status: Arc<FakeStatus>,
    kernel: Arc<FakeKernel>,
) -> CheckContext {
    CheckContext::new(health, status, kernel)
}

/// Records every command; commands matching a failure pattern exit 1
#[derive(Default)]
pub struct RecordingExecutor {
    commands: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, String)>>,
}

impl RecordingExecutor {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn fail_matching(&self, pattern: &str) {
        self.failures.lock().unwrap().push(pattern.to_string());
    }

    pub fn respond(&self, pattern: &str, output: &str) {
        self.responses
            .lock()
            .unwrap()
            .push((pattern.to_string(), output.to_string()));
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn invoke(&self, command: &str) -> Result<CommandOutput, LbError> {
        self.commands.lock().unwrap().push(command.to_string());

        if self.failures.lock().unwrap().iter().any(|p| command.contains(p.as_str())) {
            return Ok(CommandOutput {
                output: "failed".to_string(),
                status: 1,
            });
        }

        let output = self
            .responses
            .lock()
            .unwrap()
            .iter()
            .find(|(p, _)| command.contains(p.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();

        Ok(CommandOutput { output, status: 0 })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KernelOp {
    Create(u32),
    Remove(u32),
    AddNode(u32, SocketAddr, u32),
    Apply(u32, SocketAddr, u32),
    RemoveNode(u32, SocketAddr),
}

/// Kernel table kept in memory; ops on a failing fwmark return an error
#[derive(Default)]
pub struct FakeKernel {
    ops: Mutex<Vec<KernelOp>>,
    services: Mutex<HashMap<String, VirtualService>>,
    failing: Mutex<HashSet<u32>>,
}

impl FakeKernel {
    pub fn with_service(self, service: VirtualService) -> Self {
        self.services
            .lock()
            .unwrap()
            .insert(service.fwmark.to_string(), service);
        self
    }

    pub fn ops(&self) -> Vec<KernelOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }

    pub fn fail_fwmark(&self, fwmark: u32) {
        self.failing.lock().unwrap().insert(fwmark);
    }

    pub fn heal_fwmark(&self, fwmark: u32) {
        self.failing.lock().unwrap().remove(&fwmark);
    }

    pub fn weight_of(&self, fwmark: u32, address: SocketAddr) -> Option<u32> {
        self.services
            .lock()
            .unwrap()
            .get(&fwmark.to_string())
            .and_then(|s| s.server(address).map(|r| r.weight))
    }

    pub fn has_service(&self, fwmark: u32) -> bool {
        self.services.lock().unwrap().contains_key(&fwmark.to_string())
    }

    fn record(&self, fwmark: u32, op: KernelOp) -> Result<(), LbError> {
        self.ops.lock().unwrap().push(op);
        if self.failing.lock().unwrap().contains(&fwmark) {
            return Err(LbError::CommandFailed {
                command: format!("fwmark {}", fwmark),
                status: 1,
                output: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn set_weight(&self, fwmark: u32, address: SocketAddr, weight: u32) {
        let mut services = self.services.lock().unwrap();
        let service = services
            .entry(fwmark.to_string())
            .or_insert_with(|| VirtualService::new(fwmark, "wrr"));
        match service.servers.iter_mut().find(|s| s.address == address) {
            Some(server) => server.weight = weight,
            None => service.servers.push(RealServer { address, weight }),
        }
    }
}

#[async_trait]
impl KernelTable for FakeKernel {
    async fn running_configuration(&self) -> Result<HashMap<String, VirtualService>, LbError> {
        Ok(self.services.lock().unwrap().clone())
    }

    async fn create(&self, fwmark: u32, scheduler: &str) -> Result<(), LbError> {
        self.record(fwmark, KernelOp::Create(fwmark))?;
        self.services
            .lock()
            .unwrap()
            .entry(fwmark.to_string())
            .or_insert_with(|| VirtualService::new(fwmark, scheduler));
        Ok(())
    }

    async fn remove(&self, fwmark: u32) -> Result<(), LbError> {
        self.record(fwmark, KernelOp::Remove(fwmark))?;
        self.services.lock().unwrap().remove(&fwmark.to_string());
        Ok(())
    }

    async fn add_node(&self, fwmark: u32, server: SocketAddr, weight: u32) -> Result<(), LbError> {
        self.record(fwmark, KernelOp::AddNode(fwmark, server, weight))?;
        self.set_weight(fwmark, server, weight);
        Ok(())
    }

    async fn apply(&self, fwmark: u32, server: SocketAddr, weight: u32) -> Result<(), LbError> {
        self.record(fwmark, KernelOp::Apply(fwmark, server, weight))?;
        self.set_weight(fwmark, server, weight);
        Ok(())
    }

    async fn remove_node(&self, fwmark: u32, server: SocketAddr) -> Result<(), LbError> {
        self.record(fwmark, KernelOp::RemoveNode(fwmark, server))?;
        if let Some(service) = self.services.lock().unwrap().get_mut(&fwmark.to_string()) {
            service.servers.retain(|s| s.address != server);
        }
        Ok(())
    }
}

/// Scripted health scores; `None` means unreachable
#[derive(Default)]
pub struct FakeHealth {
    default: Option<u8>,
    per_node: Mutex<HashMap<SocketAddr, Option<u8>>>,
}

impl FakeHealth {
    pub fn always(health: u8) -> Self {
        Self {
            default: Some(health),
            per_node: Mutex::new(HashMap::new()),
        }
    }

    pub fn unreachable() -> Self {
        Self::default()
    }

    pub fn set(&self, address: &str, health: Option<u8>) {
        self.per_node
            .lock()
            .unwrap()
            .insert(address.parse().unwrap(), health);
    }
}

#[async_trait]
impl HealthFetcher for FakeHealth {
    async fn current_health(&self, node: &Node) -> Result<u8, LbError> {
        let health = self
            .per_node
            .lock()
            .unwrap()
            .get(&node.socket_addr())
            .copied()
            .unwrap_or(self.default);
        health.ok_or_else(|| LbError::Probe(format!("{} unreachable", node)))
    }
}

#[derive(Default)]
pub struct FakeStatus {
    flags: Mutex<HashSet<(String, String)>>,
}

impl FakeStatus {
    pub fn with(flags: &[(&str, &str)]) -> Self {
        let status = Self::default();
        for (flag, scope) in flags {
            status.raise(flag, scope);
        }
        status
    }

    pub fn raise(&self, flag: &str, scope: &str) {
        self.flags
            .lock()
            .unwrap()
            .insert((flag.to_string(), scope.to_string()));
    }
}

impl StatusFiles for FakeStatus {
    fn exists(&self, flag: &str, scope: &str) -> bool {
        self.flags
            .lock()
            .unwrap()
            .contains(&(flag.to_string(), scope.to_string()))
    }
}

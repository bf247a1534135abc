//! Shared control-plane types

use std::net::SocketAddr;

/// Captured result of one external command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// stdout followed by stderr
    pub output: String,
    /// Exit code; -1 when the process was killed by a signal
    pub status: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Turn a non-zero exit into `LbError::CommandFailed`.
    pub fn into_result(self, command: &str) -> Result<Self, LbError> {
        if self.success() {
            Ok(self)
        } else {
            Err(LbError::CommandFailed {
                command: command.to_string(),
                status: self.status,
                output: self.output.trim().to_string(),
            })
        }
    }
}

/// Real server entry of a kernel virtual service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealServer {
    pub address: SocketAddr,
    pub weight: u32,
}

/// Kernel-side record of one fwmark virtual service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualService {
    pub fwmark: u32,
    pub scheduler: String,
    pub servers: Vec<RealServer>,
}

impl VirtualService {
    pub fn new(fwmark: u32, scheduler: impl Into<String>) -> Self {
        Self {
            fwmark,
            scheduler: scheduler.into(),
            servers: Vec::new(),
        }
    }

    pub fn server(&self, address: SocketAddr) -> Option<&RealServer> {
        self.servers.iter().find(|s| s.address == address)
    }
}

/// Control plane errors
#[derive(Debug, thiserror::Error)]
pub enum LbError {
    #[error("Failed to run command `{command}`: {source}")]
    Command {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command `{command}` exited with status {status}: {output}")]
    CommandFailed {
        command: String,
        status: i32,
        output: String,
    },

    #[error("Health probe failed: {0}")]
    Probe(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

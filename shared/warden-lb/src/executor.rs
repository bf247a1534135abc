//! Command Bridge
//!
//! Every external command (kernel table changes, shell-level probes) leaves
//! the process through a [`CommandExecutor`]. The caller's task suspends
//! until the child exits and is resumed once with the captured output and
//! exit status; other tasks keep running meanwhile. No retry or timeout is
//! applied here, callers own that policy.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, info};

use crate::types::{CommandOutput, LbError};

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `command` and return its output and exit status.
    ///
    /// A non-zero exit is returned as data, not as an error; only a failure
    /// to spawn or wait on the process is an `Err`.
    async fn invoke(&self, command: &str) -> Result<CommandOutput, LbError>;
}

/// Runs commands through `sh -c` on the tokio process driver
#[derive(Clone)]
pub struct ShellExecutor {
    permits: Arc<Semaphore>,
}

impl ShellExecutor {
    /// `max_concurrent` bounds how many children may run at once.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new(16)
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn invoke(&self, command: &str) -> Result<CommandOutput, LbError> {
        info!(command = %command, "Running command");

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| LbError::Command {
                command: command.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })?;

        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .await
            .map_err(|source| LbError::Command {
                command: command.to_string(),
                source,
            })?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        let status = output.status.code().unwrap_or(-1);

        debug!(command = %command, status, "Command finished");

        Ok(CommandOutput { output: text, status })
    }
}

//! Service infrastructure for warden processes

use async_trait::async_trait;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};

use crate::config::WardenConfig;
use crate::error::{Result, WardenError};

/// Standard trait every warden process implements
#[async_trait]
pub trait WardenService: Send + Sync + 'static {
    /// Service identifier (e.g., "warden-controller")
    fn service_id(&self) -> &'static str;

    /// Service version
    fn version(&self) -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Start the service; runs until the process is asked to stop
    async fn start(&self) -> Result<()>;

    /// Re-read configuration (SIGHUP)
    async fn reload(&self) -> Result<()> {
        Ok(())
    }

    /// Graceful shutdown
    async fn shutdown(&self) -> Result<()>;
}

enum Signal {
    Shutdown,
    Reload,
}

#[cfg(unix)]
struct Signals {
    terminate: signal::unix::Signal,
    hangup: signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn install() -> Result<Self> {
        use signal::unix::{signal as unix_signal, SignalKind};

        let listen = |kind: SignalKind| {
            unix_signal(kind)
                .map_err(|e| WardenError::Internal(format!("Failed to install signal handler: {}", e)))
        };

        Ok(Self {
            terminate: listen(SignalKind::terminate())?,
            hangup: listen(SignalKind::hangup())?,
        })
    }

    async fn next(&mut self) -> Result<Signal> {
        tokio::select! {
            res = signal::ctrl_c() => {
                res?;
                Ok(Signal::Shutdown)
            }
            _ = self.terminate.recv() => Ok(Signal::Shutdown),
            _ = self.hangup.recv() => Ok(Signal::Reload),
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn install() -> Result<Self> {
        Ok(Self)
    }

    async fn next(&mut self) -> Result<Signal> {
        signal::ctrl_c().await?;
        Ok(Signal::Shutdown)
    }
}

/// Standard process runtime bootstrap
pub struct ServiceRuntime {
    config: WardenConfig,
    start_time: std::time::Instant,
}

impl ServiceRuntime {
    /// Create new runtime from environment
    pub fn new() -> Result<Self> {
        let config = WardenConfig::from_env()?;
        Ok(Self {
            config,
            start_time: std::time::Instant::now(),
        })
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    /// Run a service with standard lifecycle management
    pub async fn run<S: WardenService>(&self, service: Arc<S>) -> Result<()> {
        info!(
            service_id = service.service_id(),
            version = service.version(),
            service_name = %self.config.service_name,
            "Starting service"
        );

        let service_clone = service.clone();
        let service_handle = tokio::spawn(async move {
            if let Err(e) = service_clone.start().await {
                tracing::error!("Service error: {}", e);
            }
        });

        let mut signals = Signals::install()?;
        loop {
            match signals.next().await? {
                Signal::Reload => {
                    info!("Reload signal received");
                    if let Err(e) = service.reload().await {
                        warn!(error = %e, "Reload failed, keeping current state");
                    }
                }
                Signal::Shutdown => break,
            }
        }

        info!("Shutdown signal received, gracefully stopping...");

        if let Err(e) = service.shutdown().await {
            warn!("Error during shutdown: {}", e);
        }

        service_handle.abort();

        info!(
            uptime_seconds = self.start_time.elapsed().as_secs(),
            "Service stopped"
        );

        Ok(())
    }
}

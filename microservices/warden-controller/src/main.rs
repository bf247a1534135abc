//! Warden Controller - L4 load balancer control plane
//!
//! Loads the cluster file, reconciles it against the kernel's IPVS table
//! and keeps node weights current. SIGHUP re-reads the cluster file.

use std::sync::Arc;
use tracing::info;
use warden_core::{Result, ServiceRuntime, WardenError};
use warden_telemetry::TelemetryError;

mod controller;

use controller::ControllerService;

#[tokio::main]
async fn main() -> Result<()> {
    let runtime = ServiceRuntime::new()?;
    warden_telemetry::init(runtime.config()).map_err(|e| match e {
        TelemetryError::Filter(..) => WardenError::Config(e.to_string()),
        TelemetryError::TracingInit(_) => WardenError::Internal(e.to_string()),
    })?;

    info!(clusters_file = %runtime.config().clusters_file.display(), "Starting Warden Controller");

    let service = Arc::new(ControllerService::new(runtime.config().clone())?);
    runtime.run(service).await
}

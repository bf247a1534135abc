//! Warden Telemetry
//!
//! Structured logging setup and in-process metric primitives.

mod metrics;

pub use metrics::{Counter, Gauge, Histogram};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use warden_core::WardenConfig;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Invalid log filter `{0}`: {1}")]
    Filter(String, String),

    #[error("Tracing initialization failed: {0}")]
    TracingInit(String),
}

/// Install the global subscriber for a service.
///
/// `RUST_LOG` wins over `config.log_level`; `config.json_logs` selects the
/// JSON formatter.
pub fn init(config: &WardenConfig) -> Result<(), TelemetryError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => level_filter(&config.log_level)?,
    };

    let fmt_layer = if config.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| TelemetryError::TracingInit(e.to_string()))?;

    tracing::info!(
        service = %config.service_name,
        log_level = %config.log_level,
        json_logs = config.json_logs,
        "Tracing initialized"
    );

    Ok(())
}

fn level_filter(directives: &str) -> Result<EnvFilter, TelemetryError> {
    EnvFilter::try_new(directives).map_err(|e| TelemetryError::Filter(directives.to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_filter_accepts_directives() {
        assert!(level_filter("info").is_ok());
        assert!(level_filter("warn,warden_lb=debug").is_ok());
    }

    #[test]
    fn test_level_filter_rejects_unknown_level() {
        let err = level_filter("warden_lb=loud").unwrap_err();
        assert!(matches!(err, TelemetryError::Filter(ref d, _) if d == "warden_lb=loud"));
    }
}

//! Configuration management for warden processes

use crate::error::{Result, WardenError};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct WardenConfig {
    pub service_name: String,
    pub clusters_file: PathBuf,
    pub status_dir: PathBuf,
    pub check_tick: Duration,
    pub probe_timeout: Duration,
    pub max_concurrent_commands: usize,
    pub ipvsadm_path: String,
    pub log_level: String,
    pub json_logs: bool,
}

impl WardenConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let max_concurrent_commands: usize = parse_var(&lookup, "MAX_CONCURRENT_COMMANDS", 16)?;
        if max_concurrent_commands == 0 {
            return Err(WardenError::Config(
                "MAX_CONCURRENT_COMMANDS must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            service_name: lookup("SERVICE_NAME").unwrap_or_else(|| "warden-controller".to_string()),
            clusters_file: lookup("CLUSTERS_FILE")
                .unwrap_or_else(|| "/etc/warden/clusters.yaml".to_string())
                .into(),
            status_dir: lookup("STATUS_DIR")
                .unwrap_or_else(|| "/etc/warden/status".to_string())
                .into(),
            check_tick: Duration::from_millis(parse_var(&lookup, "CHECK_TICK_MS", 1000)?),
            probe_timeout: Duration::from_millis(parse_var(&lookup, "PROBE_TIMEOUT_MS", 2000)?),
            max_concurrent_commands,
            ipvsadm_path: lookup("IPVSADM_PATH").unwrap_or_else(|| "ipvsadm".to_string()),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            json_logs: lookup("JSON_LOGS")
                .map(|v| matches!(v.trim(), "1" | "true"))
                .unwrap_or(false),
        })
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| WardenError::Config(format!("Invalid {}: {}", key, e))),
        None => Ok(default),
    }
}

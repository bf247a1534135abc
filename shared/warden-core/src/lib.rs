//! Warden Core - Shared service infrastructure for the load balancer control plane
//!
//! This crate provides:
//! - Standard service trait every warden process implements
//! - Error handling utilities
//! - Configuration management

pub mod config;
pub mod error;
pub mod service;

pub use config::WardenConfig;
pub use error::{Result, WardenError};
pub use service::{ServiceRuntime, WardenService};

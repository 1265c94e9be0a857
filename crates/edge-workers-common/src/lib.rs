//! Common types, errors, and configuration for edge-workers.
//!
//! This crate provides shared functionality used across the edge-workers workspace:
//! - Error types using `thiserror` for type-safe error handling
//! - Configuration structures for runtime settings
//! - The TOML configuration file format

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{LogConfig, OutboundConfig, RoutingConfig, RuntimeConfig, SandboxConfig};
pub use config_file::{AdminConfig, ConfigFile, ConfigFileError, ServerConfigFile, StorageConfig};
pub use error::{HostError, StoreError, WorkerError};

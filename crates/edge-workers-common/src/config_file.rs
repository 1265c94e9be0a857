//! Configuration file structures for edge-workers.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`ServerConfigFile`]: HTTP server settings
//! - [`AdminConfig`]: Admin API settings
//! - [`StorageConfig`]: Where worker definitions and the running set live

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::RuntimeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [runtime.sandbox]
/// timeout_ms = 1000
///
/// [runtime.logging]
/// max_entries_per_worker = 1000
///
/// [server]
/// bind_addr = "0.0.0.0:3000"
/// shutdown_grace_secs = 5
///
/// [admin]
/// enabled = true
/// token = "your-secret-token"
/// prefix = "/api"
///
/// [storage]
/// workers_dir = "./workers"
/// autostart_file = "./autostart.json"
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Runtime configuration.
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfigFile,

    /// Admin API configuration.
    #[serde(default)]
    pub admin: AdminConfig,

    /// Storage locations.
    #[serde(default)]
    pub storage: StorageConfig,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }

    /// Reserved path prefixes for the router: the configured ones plus the
    /// admin prefix when the admin API is mounted.
    pub fn reserved_prefixes(&self) -> Vec<String> {
        let mut prefixes = self.runtime.routing.reserved_prefixes.clone();
        if self.admin.enabled {
            let admin = self.admin.prefix.trim_matches('/');
            if !admin.is_empty() && !prefixes.iter().any(|p| p == admin) {
                prefixes.push(admin.to_string());
            }
        }
        prefixes
    }
}

/// HTTP server configuration from config file.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfigFile {
    /// Bind address (e.g., "0.0.0.0:3000").
    #[serde(default = "defaults::bind_addr")]
    pub bind_addr: String,

    /// Timeout until response headers are produced, in seconds.
    #[serde(default = "defaults::request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Enable graceful shutdown.
    #[serde(default = "defaults::graceful_shutdown")]
    pub graceful_shutdown: bool,

    /// Grace period for in-flight requests after a shutdown signal.
    #[serde(default = "defaults::shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Largest inbound request body forwarded to a worker.
    #[serde(default = "defaults::max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ServerConfigFile {
    fn default() -> Self {
        Self {
            bind_addr: defaults::bind_addr(),
            request_timeout_secs: defaults::request_timeout_secs(),
            graceful_shutdown: defaults::graceful_shutdown(),
            shutdown_grace_secs: defaults::shutdown_grace_secs(),
            max_body_bytes: defaults::max_body_bytes(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AdminConfig {
    /// Mount the Admin API.
    #[serde(default = "defaults::admin_enabled")]
    pub enabled: bool,

    /// Optional authentication token.
    ///
    /// When set, clients must include it in the `X-Admin-Token` header.
    pub token: Option<String>,

    /// URL prefix for Admin API endpoints.
    #[serde(default = "defaults::admin_prefix")]
    pub prefix: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: defaults::admin_enabled(),
            token: None,
            prefix: defaults::admin_prefix(),
        }
    }
}

impl AdminConfig {
    /// Returns `true` if the Admin API is mounted and requires a token.
    pub fn is_protected(&self) -> bool {
        self.enabled && self.token.as_deref().is_some_and(|t| !t.is_empty())
    }
}

/// Storage locations.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Directory holding one sub-directory per worker.
    #[serde(default = "defaults::workers_dir")]
    pub workers_dir: PathBuf,

    /// File recording which workers were running.
    #[serde(default = "defaults::autostart_file")]
    pub autostart_file: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            workers_dir: defaults::workers_dir(),
            autostart_file: defaults::autostart_file(),
        }
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

/// Default value functions for serde.
mod defaults {
    use std::path::PathBuf;

    pub fn bind_addr() -> String {
        "0.0.0.0:3000".to_string()
    }

    pub const fn request_timeout_secs() -> u64 {
        30
    }

    pub const fn graceful_shutdown() -> bool {
        true
    }

    pub const fn shutdown_grace_secs() -> u64 {
        5
    }

    pub const fn max_body_bytes() -> usize {
        10 * 1024 * 1024
    }

    pub const fn admin_enabled() -> bool {
        true
    }

    pub fn admin_prefix() -> String {
        "/api".to_string()
    }

    pub fn workers_dir() -> PathBuf {
        PathBuf::from("./workers")
    }

    pub fn autostart_file() -> PathBuf {
        PathBuf::from("./autostart.json")
    }
}

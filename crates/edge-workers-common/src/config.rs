//! Configuration structures for edge-workers.
//!
//! This module defines configuration options for various components:
//! - [`RuntimeConfig`]: Top-level configuration containing all settings
//! - [`SandboxConfig`]: Execution budgets for guest code
//! - [`LogConfig`]: Per-worker log buffer sizing
//! - [`OutboundConfig`]: Guest `fetch` client settings
//! - [`RoutingConfig`]: Paths the router never treats as worker routes

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
///
/// This structure contains all configuration options for the worker runtime.
/// It is usually embedded in the `[runtime]` table of the TOML config file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RuntimeConfig {
    /// Guest execution budgets.
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Log Channel settings.
    #[serde(default)]
    pub logging: LogConfig,

    /// Outbound HTTP settings for guest `fetch`.
    #[serde(default)]
    pub outbound: OutboundConfig,

    /// Router settings.
    #[serde(default)]
    pub routing: RoutingConfig,
}

/// Execution budgets for guest code.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SandboxConfig {
    /// Wall-clock budget for one compile or handler call, in milliseconds.
    ///
    /// Exceeding it fails the call with `Timeout` and retires the instance.
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Budget for producing one chunk of a streamed response, in milliseconds.
    #[serde(default = "defaults::stream_idle_timeout_ms")]
    pub stream_idle_timeout_ms: u64,

    /// Maximum iterations of a single guest loop before the engine aborts it.
    ///
    /// Backstop for code that never yields to the wall-clock check.
    #[serde(default = "defaults::loop_iteration_limit")]
    pub loop_iteration_limit: u64,

    /// Maximum guest call depth.
    #[serde(default = "defaults::recursion_limit")]
    pub recursion_limit: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: defaults::timeout_ms(),
            stream_idle_timeout_ms: defaults::stream_idle_timeout_ms(),
            loop_iteration_limit: defaults::loop_iteration_limit(),
            recursion_limit: defaults::recursion_limit(),
        }
    }
}

impl SandboxConfig {
    /// Get the execution timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Get the stream pull budget as a `Duration`.
    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_idle_timeout_ms)
    }
}

/// Log Channel settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Entries kept per worker; the oldest is evicted on overflow.
    #[serde(default = "defaults::max_entries_per_worker")]
    pub max_entries_per_worker: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_entries_per_worker: defaults::max_entries_per_worker(),
        }
    }
}

/// Outbound HTTP settings for guest `fetch`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutboundConfig {
    /// Total request timeout in seconds.
    #[serde(default = "defaults::outbound_timeout_secs")]
    pub timeout_secs: u64,

    /// Connect timeout in seconds.
    #[serde(default = "defaults::connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Largest response body handed back to a guest.
    #[serde(default = "defaults::max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            timeout_secs: defaults::outbound_timeout_secs(),
            connect_timeout_secs: defaults::connect_timeout_secs(),
            max_body_bytes: defaults::max_body_bytes(),
        }
    }
}

impl OutboundConfig {
    /// Get the request timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Get the connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

/// Router settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RoutingConfig {
    /// Leading path segments reserved for the runtime itself (without slashes).
    #[serde(default = "defaults::reserved_prefixes")]
    pub reserved_prefixes: Vec<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            reserved_prefixes: defaults::reserved_prefixes(),
        }
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn timeout_ms() -> u64 {
        1000
    }

    pub const fn stream_idle_timeout_ms() -> u64 {
        30_000
    }

    pub const fn loop_iteration_limit() -> u64 {
        50_000_000
    }

    pub const fn recursion_limit() -> usize {
        512
    }

    pub const fn max_entries_per_worker() -> usize {
        1000
    }

    pub const fn outbound_timeout_secs() -> u64 {
        30
    }

    pub const fn connect_timeout_secs() -> u64 {
        10
    }

    pub const fn max_body_bytes() -> usize {
        10 * 1024 * 1024
    }

    pub fn reserved_prefixes() -> Vec<String> {
        vec!["api".to_string()]
    }
}

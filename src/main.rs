//! edge-workers CLI entry point.
//!
//! Loads the configuration, restores the workers that were running when the
//! process last stopped, and serves them over HTTP.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use edge_workers_common::ConfigFile;
use edge_workers_core::{FileStore, WorkerManager};
use edge_workers_host::StandardHost;
use edge_workers_server::{AdminRouterConfig, AppState, EdgeServer, ServerConfig};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Local emulator for edge worker scripts.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to a TOML configuration file.
    #[arg(short, long, env = "EDGE_WORKERS_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on; overrides `server.bind_addr`.
    #[arg(short, long, env = "BIND_ADDR")]
    bind: Option<SocketAddr>,

    /// Directory holding worker definitions; overrides `storage.workers_dir`.
    #[arg(long, env = "EDGE_WORKERS_DIR")]
    workers_dir: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text", env = "EDGE_WORKERS_LOG_FORMAT")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,edge_workers=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting edge-workers");

    let mut file = match &cli.config {
        Some(path) => ConfigFile::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ConfigFile::default(),
    };
    if let Some(dir) = cli.workers_dir {
        file.storage.workers_dir = dir;
    }

    let bind_addr = match cli.bind {
        Some(addr) => addr,
        None => file.server.bind_addr.parse().with_context(|| {
            format!(
                "Invalid bind_addr '{}'. Expected format: 'host:port' (e.g., '0.0.0.0:3000')",
                file.server.bind_addr
            )
        })?,
    };

    let mut runtime_config = file.runtime.clone();
    runtime_config.routing.reserved_prefixes = file.reserved_prefixes();

    info!(
        bind_addr = %bind_addr,
        workers_dir = %file.storage.workers_dir.display(),
        autostart_file = %file.storage.autostart_file.display(),
        timeout_ms = runtime_config.sandbox.timeout_ms,
        "Configuration loaded"
    );

    let store = Arc::new(FileStore::new(
        file.storage.workers_dir.clone(),
        file.storage.autostart_file.clone(),
    ));
    let host = StandardHost::new(&runtime_config.outbound).context("Failed to build outbound HTTP client")?;
    let manager = Arc::new(WorkerManager::new(
        &runtime_config,
        store.clone(),
        store,
        Arc::new(host),
    ));

    match manager.autostart().await {
        Ok(started) => info!(started, "Restored running workers"),
        Err(e) => warn!(error = %e, "Could not read the running set; starting with no workers"),
    }

    let mut server_config = ServerConfig {
        bind_addr,
        request_timeout_secs: file.server.request_timeout_secs,
        graceful_shutdown: file.server.graceful_shutdown,
        shutdown_grace_secs: file.server.shutdown_grace_secs,
        admin: None,
    };
    if file.admin.enabled {
        if !file.admin.is_protected() {
            warn!("Admin API is enabled without a token");
        }
        server_config = server_config.with_admin(AdminRouterConfig {
            prefix: file.admin.prefix.clone(),
            token: file.admin.token.clone(),
        });
    }

    let state = AppState::new(manager).with_max_body_bytes(file.server.max_body_bytes);
    let server = EdgeServer::new(state, server_config);

    info!("Server initialized. Available endpoints:");
    info!("  GET  /health                       - Health check");
    info!("  GET  /ready                        - Readiness check");
    if file.admin.enabled {
        let prefix = &file.admin.prefix;
        info!("  GET  {prefix}/workers                 - List workers");
        info!("  POST {prefix}/workers/:id/start       - Start a worker");
        info!("  POST {prefix}/workers/:id/stop        - Stop a worker");
        info!("  GET  {prefix}/workers/:id/logs        - Worker logs");
    }
    info!("  ANY  /<route>/...                  - Dispatch to a running worker");

    server.run().await?;

    Ok(())
}

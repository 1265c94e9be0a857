//! HTTP server implementation.
//!
//! This module provides the main [`EdgeServer`] struct for running
//! the edge-workers HTTP front door.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use edge_workers_common::WorkerError;

use crate::router::{AdminRouterConfig, build_router_with_admin};
use crate::state::AppState;

/// Configuration for the HTTP server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the server.
    pub bind_addr: SocketAddr,
    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Enable graceful shutdown on SIGTERM/SIGINT.
    pub graceful_shutdown: bool,
    /// Grace period for in-flight requests once shutdown begins.
    pub shutdown_grace_secs: u64,
    /// Admin API mount, if any.
    pub admin: Option<AdminRouterConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            request_timeout_secs: 30,
            graceful_shutdown: true,
            shutdown_grace_secs: 5,
            admin: None,
        }
    }
}

impl ServerConfig {
    /// Create a new server config with custom bind address.
    pub fn with_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Create a new server config with custom timeout.
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Mount the Admin API.
    pub fn with_admin(mut self, admin: AdminRouterConfig) -> Self {
        self.admin = Some(admin);
        self
    }

    /// Get the request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Get the shutdown grace period as Duration.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// edge-workers HTTP server.
///
/// This is the main entry point for running the HTTP server.
///
/// # Example
///
/// ```ignore
/// use edge_workers_server::{AppState, EdgeServer, ServerConfig};
///
/// let server = EdgeServer::new(AppState::new(manager), ServerConfig::default());
/// server.state().manager().autostart().await?;
/// server.run().await?;
/// ```
pub struct EdgeServer {
    /// Application state.
    state: AppState,
    /// Server configuration.
    config: ServerConfig,
}

impl EdgeServer {
    /// Create a new server instance.
    pub fn new(state: AppState, config: ServerConfig) -> Self {
        Self { state, config }
    }

    /// Get a reference to the application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run the server until shutdown.
    ///
    /// On SIGTERM/SIGINT (with graceful shutdown enabled) the manager stops
    /// accepting work, in-flight requests get the grace period, and then
    /// every instance is terminated. The running set is left as it was so
    /// the same workers come back on the next start.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot bind to the address.
    pub async fn run(self) -> Result<(), WorkerError> {
        let app = build_router_with_admin(
            self.state.clone(),
            self.config.request_timeout(),
            self.config.admin.clone(),
        );

        let listener = TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|e| WorkerError::invalid_config(format!("Failed to bind: {e}")))?;

        info!(addr = %self.config.bind_addr, "Starting HTTP server");

        let manager = Arc::clone(self.state.manager());
        if self.config.graceful_shutdown {
            let stopping = Arc::new(Notify::new());
            let signalled = Arc::clone(&stopping);
            let signal_manager = Arc::clone(&manager);
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_signal().await;
                    signal_manager.begin_shutdown();
                    signalled.notify_one();
                })
                .into_future();

            let grace = self.config.shutdown_grace();
            tokio::select! {
                result = serve => {
                    result.map_err(|e| WorkerError::invalid_config(format!("Server error: {e}")))?;
                }
                () = async {
                    stopping.notified().await;
                    manager.drain(grace).await;
                } => {
                    info!("Grace period over, closing remaining connections");
                }
            }
        } else {
            axum::serve(listener, app)
                .await
                .map_err(|e| WorkerError::invalid_config(format!("Server error: {e}")))?;
        }

        let stopped = manager.shutdown_all();
        info!(stopped, "Server shutdown complete");
        Ok(())
    }

    /// Start the server and return a handle for testing.
    ///
    /// The server binds to an ephemeral port (127.0.0.1:0) and
    /// returns a handle that can be used to get the actual address
    /// and shut down the server.
    pub async fn start_test(state: AppState) -> Result<TestHandle, WorkerError> {
        let app = build_router_with_admin(
            state.clone(),
            Duration::from_secs(30),
            Some(AdminRouterConfig {
                prefix: "/api".into(),
                token: None,
            }),
        );

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| WorkerError::invalid_config(format!("Failed to bind: {e}")))?;

        let addr = listener
            .local_addr()
            .map_err(|e| WorkerError::invalid_config(format!("Failed to get addr: {e}")))?;

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(TestHandle {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
            handle,
        })
    }
}

/// Handle for a test server instance.
///
/// Use this to interact with and shut down a test server.
pub struct TestHandle {
    /// The address the server is bound to.
    addr: SocketAddr,
    /// Application state (for starting workers).
    state: AppState,
    /// Shutdown signal sender.
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    /// Server task handle.
    handle: tokio::task::JoinHandle<Result<(), std::io::Error>>,
}

impl TestHandle {
    /// Get the server address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the server URL.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the application state.
    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Shutdown the server gracefully and terminate its workers.
    pub async fn shutdown(mut self) {
        self.state.manager().begin_shutdown();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.handle.await;
        self.state.manager().shutdown_all();
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 3000);
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.shutdown_grace(), Duration::from_secs(5));
        assert!(config.graceful_shutdown);
        assert!(config.admin.is_none());
    }

    #[test]
    fn test_server_config_builder() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let config = ServerConfig::default()
            .with_bind_addr(addr)
            .with_timeout(60)
            .with_admin(AdminRouterConfig {
                prefix: "/admin".into(),
                token: None,
            });

        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.request_timeout_secs, 60);
        assert_eq!(config.admin.unwrap().prefix, "/admin");
    }
}

//! HTTP server for edge-workers.
//!
//! This crate is the front door in front of the worker runtime. It handles:
//!
//! - Worker dispatch for every path no other route claims
//! - Response adaptation, including streamed bodies
//! - The Admin API for starting, stopping and inspecting workers
//! - Health and readiness checks
//! - Graceful shutdown
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use edge_workers_common::RuntimeConfig;
//! use edge_workers_core::{MemoryStore, WorkerManager};
//! use edge_workers_host::StandardHost;
//! use edge_workers_server::{AppState, EdgeServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RuntimeConfig::default();
//!     let store = Arc::new(MemoryStore::new());
//!     let host = Arc::new(StandardHost::new(&config.outbound)?);
//!     let manager = WorkerManager::new(&config, store.clone(), store, host);
//!
//!     let server = EdgeServer::new(AppState::new(Arc::new(manager)), ServerConfig::default());
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod handler;
pub mod request;
pub mod response;
pub mod router;
pub mod server;
pub mod state;

pub use router::AdminRouterConfig;
pub use server::{EdgeServer, ServerConfig, TestHandle};
pub use state::AppState;

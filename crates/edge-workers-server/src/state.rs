//! Shared application state.
//!
//! This module provides [`AppState`], which holds shared resources
//! across all HTTP request handlers.

use std::sync::Arc;

use edge_workers_core::WorkerManager;

/// Default limit for inbound request bodies forwarded to workers.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state across all request handlers.
///
/// This struct is cloned for each request, so it uses `Arc` for shared data.
#[derive(Clone)]
pub struct AppState {
    /// Lifecycle manager owning every running worker.
    manager: Arc<WorkerManager>,

    /// Largest inbound body accepted for worker dispatch.
    max_body_bytes: usize,
}

impl AppState {
    /// Create new application state around a manager.
    pub fn new(manager: Arc<WorkerManager>) -> Self {
        Self {
            manager,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Set the inbound body limit.
    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Get the worker manager.
    pub fn manager(&self) -> &Arc<WorkerManager> {
        &self.manager
    }

    /// Get the inbound body limit.
    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("running_workers", &self.manager.snapshot().len())
            .field("max_body_bytes", &self.max_body_bytes)
            .finish_non_exhaustive()
    }
}

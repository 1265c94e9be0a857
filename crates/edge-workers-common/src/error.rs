//! Error types for edge-workers.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`WorkerError`]: Lifecycle, execution and routing failures
//! - [`HostError`]: Failures of host services called by guest code
//! - [`StoreError`]: Metadata store and running-set record failures

use thiserror::Error;

/// Top-level errors for worker lifecycle, execution and dispatch.
///
/// Lifecycle and routing variants are returned as structured results to the
/// caller. Execution variants describe what happened inside a sandbox.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// No worker definition exists for the id.
    #[error("Worker not found: {worker_id}")]
    NotFound {
        /// The identifier that was looked up.
        worker_id: String,
    },

    /// The worker already has an instance (running or starting).
    #[error("Worker already running: {worker_id}")]
    AlreadyRunning {
        /// The worker identifier.
        worker_id: String,
    },

    /// The worker has no running instance.
    #[error("Worker not running: {worker_id}")]
    NotRunning {
        /// The worker identifier.
        worker_id: String,
    },

    /// Guest source failed to parse or evaluate.
    #[error("Compile error in worker {worker_id}: {reason}")]
    CompileError {
        /// The worker identifier.
        worker_id: String,
        /// Engine message describing the failure.
        reason: String,
    },

    /// Guest source registered neither a fetch listener nor an exported `fetch`.
    #[error("Worker {worker_id} registers no fetch handler")]
    NoHandler {
        /// The worker identifier.
        worker_id: String,
    },

    /// Guest code exceeded its wall-clock budget.
    #[error("Worker {worker_id} timed out after {budget_ms}ms")]
    Timeout {
        /// The worker identifier.
        worker_id: String,
        /// The budget that was exceeded.
        budget_ms: u64,
    },

    /// The engine aborted guest execution (runtime limit hit, corrupted prelude).
    #[error("Worker {worker_id} execution aborted: {reason}")]
    ExecutionAborted {
        /// The worker identifier.
        worker_id: String,
        /// Engine message.
        reason: String,
    },

    /// The guest handler threw or produced an invalid response.
    #[error("Handler error in worker {worker_id}: {message}")]
    HandlerError {
        /// The worker identifier.
        worker_id: String,
        /// Guest error message (may include a stack trace; never sent to clients).
        message: String,
    },

    /// The instance's sandbox thread is gone.
    #[error("Sandbox for worker {worker_id} is unavailable")]
    SandboxUnavailable {
        /// The worker identifier.
        worker_id: String,
    },

    /// A response body was read twice.
    #[error("Body has already been consumed")]
    BodyAlreadyConsumed,

    /// A defined worker matches the path but has no running instance.
    #[error("No running worker for route: {route}")]
    WorkerNotRunning {
        /// The matching route.
        route: String,
    },

    /// The path is related to a defined route but matches none.
    #[error("Worker route does not exist: {path}")]
    UnknownRoute {
        /// The request path.
        path: String,
    },

    /// The path does not belong to any worker.
    #[error("Not a worker route: {path}")]
    NotAWorkerRoute {
        /// The request path.
        path: String,
    },

    /// Dispatch was refused because shutdown has begun.
    #[error("Runtime is shutting down")]
    ShuttingDown,

    /// The metadata store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

/// Errors from host services called by guest code.
///
/// These are thrown into the guest as JavaScript errors; their display text
/// is what the guest sees as `error.message`.
#[derive(Error, Debug)]
pub enum HostError {
    /// The operation exists in the API surface but is not supported.
    #[error("NotImplemented: {operation} is not supported by this runtime")]
    NotImplemented {
        /// The unsupported operation, e.g. `crypto.subtle.encrypt`.
        operation: String,
    },

    /// Unknown digest algorithm.
    #[error("NotSupportedError: unsupported algorithm '{algorithm}'")]
    UnsupportedAlgorithm {
        /// Algorithm name as given by the guest.
        algorithm: String,
    },

    /// Invalid argument passed by the guest.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Why the argument was rejected.
        reason: String,
    },

    /// An outbound request failed before a response was received.
    #[error("fetch failed for {url}: {reason}")]
    OutboundFailed {
        /// The requested URL.
        url: String,
        /// Client error message.
        reason: String,
    },

    /// An outbound response body exceeded the configured limit.
    #[error("Response body exceeds {limit} bytes")]
    BodyTooLarge {
        /// The limit in bytes.
        limit: usize,
    },
}

/// Errors from the metadata store and running-set record.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No record exists for the id.
    #[error("No definition for worker {worker_id}")]
    NotFound {
        /// The worker identifier.
        worker_id: String,
    },

    /// Filesystem access failed.
    #[error("IO error on '{path}': {source}")]
    Io {
        /// The path being accessed.
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A record could not be decoded.
    #[error("Corrupt record '{path}': {reason}")]
    Corrupt {
        /// The path of the record.
        path: String,
        /// Decoder message.
        reason: String,
    },
}

impl WorkerError {
    /// Create a new `NotFound` error.
    pub fn not_found(worker_id: impl Into<String>) -> Self {
        Self::NotFound {
            worker_id: worker_id.into(),
        }
    }

    /// Create a new `AlreadyRunning` error.
    pub fn already_running(worker_id: impl Into<String>) -> Self {
        Self::AlreadyRunning {
            worker_id: worker_id.into(),
        }
    }

    /// Create a new `NotRunning` error.
    pub fn not_running(worker_id: impl Into<String>) -> Self {
        Self::NotRunning {
            worker_id: worker_id.into(),
        }
    }

    /// Create a new `CompileError` error.
    pub fn compile(worker_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CompileError {
            worker_id: worker_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a new `HandlerError` error.
    pub fn handler(worker_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::HandlerError {
            worker_id: worker_id.into(),
            message: message.into(),
        }
    }

    /// Create a new `ExecutionAborted` error.
    pub fn aborted(worker_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ExecutionAborted {
            worker_id: worker_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a new `SandboxUnavailable` error.
    pub fn sandbox_unavailable(worker_id: impl Into<String>) -> Self {
        Self::SandboxUnavailable {
            worker_id: worker_id.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error indicates the worker definition was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::Store(StoreError::NotFound { .. })
        )
    }

    /// Returns `true` for the outcomes the router produces instead of a response.
    pub fn is_routing_outcome(&self) -> bool {
        matches!(
            self,
            Self::WorkerNotRunning { .. } | Self::UnknownRoute { .. } | Self::NotAWorkerRoute { .. }
        )
    }

    /// Returns `true` if the sandbox that produced this error must not be reused.
    pub fn poisons_instance(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::ExecutionAborted { .. } | Self::SandboxUnavailable { .. }
        )
    }
}

impl HostError {
    /// Create a new `NotImplemented` error.
    pub fn not_implemented(operation: impl Into<String>) -> Self {
        Self::NotImplemented {
            operation: operation.into(),
        }
    }

    /// Create a new `InvalidArgument` error.
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }
}

impl StoreError {
    /// Create a new `Io` error for `path`.
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    /// Create a new `Corrupt` error for `path`.
    pub fn corrupt(path: impl AsRef<std::path::Path>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.as_ref().display().to_string(),
            reason: reason.into(),
        }
    }
}

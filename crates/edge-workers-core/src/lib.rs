//! Worker runtime core for edge-workers.
//!
//! This crate provides everything between an inbound request and a guest
//! response:
//! - [`WorkerManager`]: starts, stops and dispatches to workers
//! - [`RunningInstance`]: one sandbox thread per running worker
//! - [`Sandbox`]: JavaScript context with the guest API prelude
//! - [`RouteResolver`]: maps request paths to worker routes
//! - [`LogChannel`]: bounded per-worker log buffers with live subscribers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    WorkerManager                        │
//! │  (Shared, thread-safe)                                  │
//! │  - Instance registry (Starting/Running/Stopping)        │
//! │  - Route resolution per request                         │
//! │  - Running-set persistence                              │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                  RunningInstance                        │
//! │  (One per running worker)                               │
//! │  - Command channel to the sandbox thread                │
//! │  - Host-side timeouts, poisoning, retire hook           │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                      Sandbox                            │
//! │  (Owned by its thread, never shared)                    │
//! │  - boa Context + prelude                                │
//! │  - Host natives from a HostLinker                       │
//! │  - Loop and recursion limits                            │
//! └─────────────────────────────────────────────────────────┘
//! ```

mod inflight;
pub mod instance;
pub mod logs;
pub mod manager;
mod registry;
pub mod request;
pub mod routing;
pub mod sandbox;
pub mod store;

pub use inflight::InflightGuard;
pub use instance::{
    BodyKind, GuestBody, GuestResponse, GuestStream, HandlerKind, RetireHook, RunningInstance,
};
pub use logs::{LogChannel, LogEntry, LogEvent, LogLevel, LogSink, SubscriptionId};
pub use manager::{Dispatched, WorkerManager};
pub use request::{GuestRequest, InboundRequest};
pub use routing::{RouteEntry, RouteMatch, RouteResolver};
pub use sandbox::{ExecutionClock, GuestScope, HostLinker, Sandbox};
pub use store::{DefinitionStore, FileStore, MemoryStore, RunningSetStore, WorkerDefinition};

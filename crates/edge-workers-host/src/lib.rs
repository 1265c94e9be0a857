//! Host services for edge-workers sandboxes.
//!
//! This crate provides the native side of the guest API. A sandbox gets
//! these services by being linked with [`StandardHost`], which implements
//! [`edge_workers_core::HostLinker`].
//!
//! # Services
//!
//! - [`logging`]: Guest console output into the worker's Log Channel
//! - [`http_outbound`]: Outbound HTTP for guest `fetch`
//! - [`crypto`]: Digests, random values and UUIDs
//! - [`linker`]: Registration of all of the above on a sandbox context
//!
//! Outbound requests are not filtered. Any `http` or `https` URL the guest
//! asks for is fetched.

pub mod crypto;
pub mod http_outbound;
pub mod linker;
pub mod logging;

pub use http_outbound::{HttpOutboundHost, HttpRequest, HttpResponse};
pub use linker::StandardHost;
pub use logging::LoggingHost;

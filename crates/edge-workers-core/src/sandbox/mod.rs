//! Guest execution sandbox.
//!
//! Each running worker owns one [`Sandbox`] on a dedicated thread. The
//! sandbox evaluates a JavaScript prelude that provides the guest API
//! (Request, Response, streams, timers, console, fetch, crypto) and talks to
//! the host through a handful of native functions registered by a
//! [`HostLinker`].

mod clock;
mod engine;
mod wire;

pub use clock::{Deadline, ExecutionClock, PausedClock};
pub use engine::{Sandbox, SandboxBody, SandboxResponse};

use boa_engine::{Context, JsArgs, JsNativeError, JsResult, JsString, JsValue};
use tokio::runtime::Handle;

use crate::logs::LogChannel;

/// What a linker needs to know about the worker it is linking.
#[derive(Debug, Clone)]
pub struct GuestScope {
    worker_id: String,
    logs: LogChannel,
    runtime: Handle,
    clock: ExecutionClock,
}

impl GuestScope {
    /// Create a scope for `worker_id` with a fresh execution clock.
    pub fn new(worker_id: impl Into<String>, logs: LogChannel, runtime: Handle) -> Self {
        Self {
            worker_id: worker_id.into(),
            logs,
            runtime,
            clock: ExecutionClock::default(),
        }
    }

    /// Clock the sandbox's budgets are measured on. Natives waiting on
    /// outbound I/O pause it.
    pub fn clock(&self) -> &ExecutionClock {
        &self.clock
    }

    /// Worker this sandbox belongs to.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Log channel guest console output goes to.
    pub fn logs(&self) -> &LogChannel {
        &self.logs
    }

    /// Runtime handle for blocking on async host work from the sandbox thread.
    pub fn runtime(&self) -> &Handle {
        &self.runtime
    }
}

/// Installs host capabilities into a fresh sandbox context.
///
/// Called once per sandbox, on the sandbox's own thread, before the prelude
/// runs. The prelude expects these globals:
///
/// | name                 | signature                          |
/// |----------------------|------------------------------------|
/// | `__host_log`         | `(level, message)`                 |
/// | `__host_fetch`       | `(requestJson) -> responseJson`    |
/// | `__host_digest`      | `(algorithm, hex) -> hex`          |
/// | `__host_random`      | `(length) -> hex`                  |
/// | `__host_uuid`        | `() -> string`                     |
/// | `__host_unsupported` | `(operation)`, always throws       |
pub trait HostLinker: Send + Sync {
    /// Register the host natives.
    fn link(&self, context: &mut Context, scope: &GuestScope) -> JsResult<()>;
}

/// Argument `index` converted to a Rust string.
pub fn string_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<String> {
    Ok(args
        .get_or_undefined(index)
        .to_string(context)?
        .to_std_string_escaped())
}

/// Argument `index` converted to a non-negative length.
pub fn length_arg(args: &[JsValue], index: usize, context: &mut Context) -> JsResult<usize> {
    let length = args.get_or_undefined(index).to_length(context)?;
    usize::try_from(length).map_err(|_| {
        JsNativeError::range()
            .with_message(format!("length {length} is out of range"))
            .into()
    })
}

/// A Rust string as a JS value.
pub fn js_value(text: &str) -> JsValue {
    JsValue::from(JsString::from(text))
}

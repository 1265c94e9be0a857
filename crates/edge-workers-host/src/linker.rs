//! Host function registration for sandbox contexts.
//!
//! Natives are plain function pointers. The state they need (which worker
//! they serve, the outbound client) lives in a thread-local set up by
//! [`StandardHost::link`]; every sandbox owns its thread, so the binding is
//! one per worker instance.

use std::cell::RefCell;

use boa_engine::{Context, JsNativeError, JsResult, JsValue, NativeFunction, js_string};
use tracing::warn;

use edge_workers_common::{HostError, OutboundConfig};
use edge_workers_core::sandbox::{js_value, length_arg, string_arg};
use edge_workers_core::{GuestScope, HostLinker};

use crate::crypto;
use crate::http_outbound::{HttpOutboundHost, HttpRequest};
use crate::logging::{LoggingHost, level_from_name};

struct HostState {
    scope: GuestScope,
    outbound: HttpOutboundHost,
}

thread_local! {
    static HOST: RefCell<Option<HostState>> = const { RefCell::new(None) };
}

/// The full host surface: console, fetch, and crypto.
#[derive(Debug, Clone)]
pub struct StandardHost {
    outbound: HttpOutboundHost,
}

impl StandardHost {
    /// Build a host with an outbound client configured from `config`.
    pub fn new(config: &OutboundConfig) -> Result<Self, HostError> {
        Ok(Self::with_outbound(HttpOutboundHost::new(config)?))
    }

    /// Build a host around an existing outbound client.
    pub fn with_outbound(outbound: HttpOutboundHost) -> Self {
        Self { outbound }
    }
}

impl HostLinker for StandardHost {
    fn link(&self, context: &mut Context, scope: &GuestScope) -> JsResult<()> {
        HOST.with(|host| {
            *host.borrow_mut() = Some(HostState {
                scope: scope.clone(),
                outbound: self.outbound.clone(),
            });
        });
        register_all(context)
    }
}

/// Register all standard host functions on a context.
///
/// This registers:
/// - `__host_log(level, message)`
/// - `__host_fetch(requestJson)`
/// - `__host_digest(algorithm, hex)`
/// - `__host_random(length)`
/// - `__host_uuid()`
/// - `__host_unsupported(operation)`
///
/// The natives read their worker binding from the calling thread; calling
/// them on a thread [`StandardHost::link`] never ran on raises an error.
pub fn register_all(context: &mut Context) -> JsResult<()> {
    register_logging(context)?;
    context.register_global_callable(
        js_string!("__host_fetch"),
        1,
        NativeFunction::from_fn_ptr(host_fetch),
    )?;
    context.register_global_callable(
        js_string!("__host_digest"),
        2,
        NativeFunction::from_fn_ptr(host_digest),
    )?;
    context.register_global_callable(
        js_string!("__host_random"),
        1,
        NativeFunction::from_fn_ptr(host_random),
    )?;
    context.register_global_callable(
        js_string!("__host_uuid"),
        0,
        NativeFunction::from_fn_ptr(host_uuid),
    )?;
    context.register_global_callable(
        js_string!("__host_unsupported"),
        1,
        NativeFunction::from_fn_ptr(host_unsupported),
    )?;
    Ok(())
}

/// Register the logging host function.
///
/// `__host_log(level, message)` takes the console method name as `level`
/// and an already-formatted line.
pub fn register_logging(context: &mut Context) -> JsResult<()> {
    context.register_global_callable(
        js_string!("__host_log"),
        2,
        NativeFunction::from_fn_ptr(host_log),
    )
}

fn with_host<R>(f: impl FnOnce(&HostState) -> R) -> JsResult<R> {
    HOST.with(|host| match host.borrow().as_ref() {
        Some(state) => Ok(f(state)),
        None => Err(JsNativeError::error()
            .with_message("host services are not linked on this thread")
            .into()),
    })
}

fn host_error(error: &HostError) -> JsNativeError {
    match error {
        HostError::InvalidArgument { .. } | HostError::BodyTooLarge { .. } => {
            JsNativeError::typ().with_message(error.to_string())
        }
        _ => JsNativeError::error().with_message(error.to_string()),
    }
}

fn host_log(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let level = string_arg(args, 0, context)?;
    let message = string_arg(args, 1, context)?;
    with_host(|host| LoggingHost::log(&host.scope, level_from_name(&level), &message))?;
    Ok(JsValue::undefined())
}

fn host_fetch(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let payload = string_arg(args, 0, context)?;
    let request: HttpRequest = serde_json::from_str(&payload)
        .map_err(|e| JsNativeError::typ().with_message(format!("malformed fetch request: {e}")))?;

    let (scope, outbound) = with_host(|host| (host.scope.clone(), host.outbound.clone()))?;
    // Waiting on the network is not guest execution time.
    let paused = scope.clock().pause();
    let response = scope.runtime().block_on(outbound.fetch(&scope, request));
    drop(paused);
    let response = response.map_err(|e| JsNativeError::typ().with_message(format!("fetch failed: {e}")))?;

    let reply = serde_json::to_string(&response).map_err(|e| {
        warn!(error = %e, "Failed to serialize fetch response");
        JsNativeError::error().with_message(format!("fetch failed: {e}"))
    })?;
    Ok(js_value(&reply))
}

fn host_digest(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let algorithm = string_arg(args, 0, context)?;
    let data = hex::decode(string_arg(args, 1, context)?)
        .map_err(|e| JsNativeError::typ().with_message(format!("invalid digest input: {e}")))?;
    let out = crypto::digest(&algorithm, &data).map_err(|e| host_error(&e))?;
    Ok(js_value(&hex::encode(out)))
}

fn host_random(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let len = length_arg(args, 0, context)?;
    let bytes = crypto::random_bytes(len).map_err(|e| host_error(&e))?;
    Ok(js_value(&hex::encode(bytes)))
}

fn host_uuid(_this: &JsValue, _args: &[JsValue], _context: &mut Context) -> JsResult<JsValue> {
    Ok(js_value(&crypto::random_uuid()))
}

fn host_unsupported(
    _this: &JsValue,
    args: &[JsValue],
    context: &mut Context,
) -> JsResult<JsValue> {
    let operation = string_arg(args, 0, context)?;
    Err(host_error(&crypto::unsupported(&operation)).into())
}

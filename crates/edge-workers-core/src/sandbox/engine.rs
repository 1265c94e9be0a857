use std::borrow::Cow;
use std::sync::LazyLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use boa_engine::context::ContextBuilder;
use boa_engine::{Context, JsNativeError, JsResult, JsValue, NativeFunction, Source, js_string};
use bytes::Bytes;
use regex::Regex;
use tracing::{debug, warn};

use edge_workers_common::{SandboxConfig, WorkerError};

use super::clock::{Deadline, ExecutionClock};
use super::wire::{BodyWire, ChunkWire, RequestWire, ResponseWire, Settled};
use super::{GuestScope, HostLinker, js_value, string_arg};
use crate::instance::HandlerKind;
use crate::request::GuestRequest;

const PRELUDE: &str = include_str!("prelude.js");

/// Longest single sleep while settling, so an abandoned caller is noticed.
const ABANDON_POLL: Duration = Duration::from_millis(25);

static EXPORT_DEFAULT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bexport\s+default\s+").expect("static pattern"));

/// Response produced by a guest handler, decoded from the wire.
#[derive(Debug)]
pub struct SandboxResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: SandboxBody,
}

/// Body of a [`SandboxResponse`].
#[derive(Debug)]
pub enum SandboxBody {
    Empty,
    Text(String),
    Binary(Bytes),
    /// Stream held open inside the sandbox, pulled by id.
    Stream(u32),
}

/// One JavaScript context with the prelude and a loaded guest script.
///
/// Not `Send`: a sandbox lives and dies on the thread that created it.
pub struct Sandbox {
    context: Context,
    worker_id: String,
    clock: ExecutionClock,
    timeout: Duration,
    stream_idle_timeout: Duration,
    next_op: u64,
}

impl Sandbox {
    /// Build a context, link host natives and evaluate the prelude.
    pub fn new(
        scope: &GuestScope,
        config: &SandboxConfig,
        linker: &dyn HostLinker,
    ) -> Result<Self, WorkerError> {
        let worker_id = scope.worker_id().to_string();
        let setup_failed =
            |stage: &str, e: &dyn std::fmt::Display| WorkerError::compile(&worker_id, format!("{stage}: {e}"));

        let mut context = ContextBuilder::new()
            .build()
            .map_err(|e| setup_failed("failed to construct JS context", &e))?;
        context
            .runtime_limits_mut()
            .set_loop_iteration_limit(config.loop_iteration_limit);
        context
            .runtime_limits_mut()
            .set_recursion_limit(config.recursion_limit);

        register_intrinsics(&mut context).map_err(|e| setup_failed("failed to register intrinsics", &e))?;
        linker
            .link(&mut context, scope)
            .map_err(|e| setup_failed("failed to link host functions", &e))?;
        context
            .eval(Source::from_bytes(PRELUDE))
            .map_err(|e| setup_failed("prelude failed", &e))?;

        Ok(Self {
            context,
            worker_id,
            clock: scope.clock().clone(),
            timeout: config.timeout(),
            stream_idle_timeout: config.stream_idle_timeout(),
            next_op: 0,
        })
    }

    /// Evaluate the guest script and resolve its handler.
    pub fn load(&mut self, source: &str) -> Result<HandlerKind, WorkerError> {
        let source = rewrite_default_export(source);
        self.context
            .eval(Source::from_bytes(source.as_bytes()))
            .map_err(|e| WorkerError::compile(&self.worker_id, e.to_string()))?;
        self.context.run_jobs();

        match self.call_string("__edge.bind()")?.as_str() {
            "exported" => Ok(HandlerKind::ExportedFetch),
            "event" => Ok(HandlerKind::EventListener),
            _ => Err(WorkerError::NoHandler {
                worker_id: self.worker_id.clone(),
            }),
        }
    }

    /// Run the handler for one request until it settles.
    ///
    /// Gives up early, without a result, once `abandoned` is raised.
    pub fn handle(
        &mut self,
        request: &GuestRequest,
        abandoned: &AtomicBool,
    ) -> Result<SandboxResponse, WorkerError> {
        let deadline = self.clock.deadline(self.timeout);
        let op = self.next_op();
        let payload = serde_json::to_string(&RequestWire::from(request))
            .and_then(|json| serde_json::to_string(&json))
            .map_err(|e| WorkerError::handler(&self.worker_id, format!("invalid request: {e}")))?;

        self.call(&format!("__edge.dispatch({op}, {payload})"))?;
        let settled = self.settle(op, &deadline, self.timeout, abandoned)?;

        match serde_json::from_str::<Settled<ResponseWire>>(&settled) {
            Ok(Settled::Ok { value }) => self.decode_response(value),
            Ok(Settled::Error { message }) => Err(WorkerError::handler(&self.worker_id, message)),
            Err(e) => Err(WorkerError::handler(
                &self.worker_id,
                format!("handler produced an invalid response: {e}"),
            )),
        }
    }

    /// Pull the next chunk of a response stream. `None` once it is exhausted.
    pub fn pull(&mut self, stream_id: u32, abandoned: &AtomicBool) -> Result<Option<Bytes>, WorkerError> {
        let deadline = self.clock.deadline(self.stream_idle_timeout);
        let op = self.next_op();
        self.call(&format!("__edge.pull({op}, {stream_id})"))?;
        let settled = self.settle(op, &deadline, self.stream_idle_timeout, abandoned)?;

        match serde_json::from_str::<Settled<ChunkWire>>(&settled) {
            Ok(Settled::Ok { value }) if value.done => Ok(None),
            Ok(Settled::Ok { value }) => match (value.text, value.hex) {
                (Some(text), _) => Ok(Some(Bytes::from(text))),
                (None, Some(hex)) => hex::decode(hex)
                    .map(|bytes| Some(Bytes::from(bytes)))
                    .map_err(|e| WorkerError::handler(&self.worker_id, format!("invalid chunk: {e}"))),
                (None, None) => Ok(Some(Bytes::new())),
            },
            Ok(Settled::Error { message }) => Err(WorkerError::handler(&self.worker_id, message)),
            Err(e) => Err(WorkerError::handler(
                &self.worker_id,
                format!("stream produced an invalid chunk: {e}"),
            )),
        }
    }

    /// Cancel a response stream, running the guest's cancel callback.
    pub fn cancel(&mut self, stream_id: u32) {
        match self.call(&format!("__edge.cancel({stream_id})")) {
            Ok(_) => self.context.run_jobs(),
            Err(e) => warn!(worker_id = %self.worker_id, stream_id, error = %e, "Stream cancel failed"),
        }
    }

    fn next_op(&mut self) -> u64 {
        self.next_op += 1;
        self.next_op
    }

    /// Settle operation `op`. On failure the guest is told to drop the
    /// operation, so a late result is not kept around.
    fn settle(
        &mut self,
        op: u64,
        deadline: &Deadline,
        budget: Duration,
        abandoned: &AtomicBool,
    ) -> Result<String, WorkerError> {
        let settled = self.drive(op, deadline, budget, abandoned);
        if settled.is_err() {
            if let Err(e) = self.call(&format!("__edge.forget({op})")) {
                debug!(worker_id = %self.worker_id, op, error = %e, "Could not drop unsettled operation");
            }
        }
        settled
    }

    /// Drive jobs and timers until operation `op` settles, `deadline`
    /// passes or the caller goes away.
    fn drive(
        &mut self,
        op: u64,
        deadline: &Deadline,
        budget: Duration,
        abandoned: &AtomicBool,
    ) -> Result<String, WorkerError> {
        loop {
            self.context.run_jobs();
            let settled = self.call_string(&format!("__edge.take({op})"))?;
            if !settled.is_empty() {
                return Ok(settled);
            }

            let next_timer = self
                .call_string("__edge.nextTimer()")?
                .parse::<i64>()
                .unwrap_or(-1);
            let Ok(wait_ms) = u64::try_from(next_timer) else {
                return Err(WorkerError::handler(
                    &self.worker_id,
                    "handler finished without producing a result",
                ));
            };

            if abandoned.load(Ordering::Acquire) {
                return Err(WorkerError::handler(
                    &self.worker_id,
                    "caller went away before the operation settled",
                ));
            }
            let remaining = deadline.remaining();
            if remaining.is_zero() {
                return Err(WorkerError::Timeout {
                    worker_id: self.worker_id.clone(),
                    budget_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
                });
            }
            let wait = Duration::from_millis(wait_ms).min(remaining).min(ABANDON_POLL);
            if !wait.is_zero() {
                thread::sleep(wait);
            }
            self.call("__edge.runTimers()")?;
        }
    }

    /// Operations the guest still tracks, settled or not.
    #[cfg(test)]
    fn retained_ops(&mut self) -> usize {
        self.call_string("__edge.retained()")
            .ok()
            .and_then(|count| count.parse().ok())
            .unwrap_or(usize::MAX)
    }

    fn decode_response(&self, wire: ResponseWire) -> Result<SandboxResponse, WorkerError> {
        let body = match wire.body {
            BodyWire::Empty => SandboxBody::Empty,
            BodyWire::Text { text } => SandboxBody::Text(text),
            BodyWire::Binary { hex } => SandboxBody::Binary(Bytes::from(hex::decode(hex).map_err(
                |e| WorkerError::handler(&self.worker_id, format!("invalid binary body: {e}")),
            )?)),
            BodyWire::Stream { id } => SandboxBody::Stream(id),
        };
        Ok(SandboxResponse {
            status: wire.status,
            status_text: wire.status_text,
            headers: wire.headers,
            body,
        })
    }

    /// Evaluate an internal call. Failures here mean the context itself is
    /// no longer trustworthy (resource limits, broken prelude).
    fn call(&mut self, script: &str) -> Result<JsValue, WorkerError> {
        self.context
            .eval(Source::from_bytes(script.as_bytes()))
            .map_err(|e| {
                debug!(worker_id = %self.worker_id, script, error = %e, "Sandbox call failed");
                WorkerError::aborted(&self.worker_id, e.to_string())
            })
    }

    fn call_string(&mut self, script: &str) -> Result<String, WorkerError> {
        let value = self.call(script)?;
        value
            .to_string(&mut self.context)
            .map(|s| s.to_std_string_escaped())
            .map_err(|e| WorkerError::aborted(&self.worker_id, e.to_string()))
    }
}

/// Turn the first `export default` into an assignment to `module.exports`,
/// so module-style workers run as classic scripts.
fn rewrite_default_export(source: &str) -> Cow<'_, str> {
    EXPORT_DEFAULT.replace(source, "module.exports = ")
}

fn register_intrinsics(context: &mut Context) -> JsResult<()> {
    context.register_global_callable(
        js_string!("__edge_utf8_encode"),
        1,
        NativeFunction::from_fn_ptr(utf8_encode),
    )?;
    context.register_global_callable(
        js_string!("__edge_utf8_decode"),
        1,
        NativeFunction::from_fn_ptr(utf8_decode),
    )?;
    Ok(())
}

fn utf8_encode(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let text = string_arg(args, 0, context)?;
    Ok(js_value(&hex::encode(text.as_bytes())))
}

fn utf8_decode(_this: &JsValue, args: &[JsValue], context: &mut Context) -> JsResult<JsValue> {
    let encoded = string_arg(args, 0, context)?;
    let bytes = hex::decode(encoded)
        .map_err(|e| JsNativeError::typ().with_message(format!("invalid hex payload: {e}")))?;
    Ok(js_value(&String::from_utf8_lossy(&bytes)))
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::logs::LogChannel;

    static LIVE: AtomicBool = AtomicBool::new(false);

    thread_local! {
        static CONSOLE: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    }

    struct ConsoleLinker;

    impl HostLinker for ConsoleLinker {
        fn link(&self, context: &mut Context, _scope: &GuestScope) -> JsResult<()> {
            context.register_global_callable(
                js_string!("__host_log"),
                2,
                NativeFunction::from_fn_ptr(|_this, args, context| {
                    let line = format!(
                        "{} {}",
                        string_arg(args, 0, context)?,
                        string_arg(args, 1, context)?
                    );
                    CONSOLE.with(|lines| lines.borrow_mut().push(line));
                    Ok(JsValue::undefined())
                }),
            )?;
            Ok(())
        }
    }

    fn sandbox_with(config: SandboxConfig, source: &str) -> Result<(Sandbox, HandlerKind), WorkerError> {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let scope = GuestScope::new("w1", LogChannel::new(16), runtime.handle().clone());
        let mut sandbox = Sandbox::new(&scope, &config, &ConsoleLinker)?;
        let kind = sandbox.load(source)?;
        Ok((sandbox, kind))
    }

    fn sandbox(source: &str) -> Sandbox {
        sandbox_with(SandboxConfig::default(), source).unwrap().0
    }

    fn get(url: &str) -> GuestRequest {
        GuestRequest {
            method: "GET".into(),
            url: url.into(),
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    fn text_of(response: &SandboxResponse) -> &str {
        match &response.body {
            SandboxBody::Text(text) => text,
            other => panic!("expected text body, got {other:?}"),
        }
    }

    #[test]
    fn test_event_listener_handler() {
        let (mut sandbox, kind) = sandbox_with(
            SandboxConfig::default(),
            r"addEventListener('fetch', (event) => {
                event.respondWith(new Response('hi ' + new URL(event.request.url).pathname, {
                    status: 201,
                    headers: { 'X-Kind': 'event' },
                }));
            });",
        )
        .unwrap();
        assert_eq!(kind, HandlerKind::EventListener);

        let response = sandbox.handle(&get("http://localhost/abc"), &LIVE).unwrap();
        assert_eq!(response.status, 201);
        assert_eq!(text_of(&response), "hi /abc");
        assert!(response.headers.contains(&("x-kind".into(), "event".into())));
    }

    #[test]
    fn test_export_default_handler() {
        let (mut sandbox, kind) = sandbox_with(
            SandboxConfig::default(),
            r"export default {
                async fetch(request, env, ctx) {
                    const body = await request.text();
                    return Response.json({ method: request.method, body, hasCtx: typeof ctx.waitUntil });
                },
            };",
        )
        .unwrap();
        assert_eq!(kind, HandlerKind::ExportedFetch);

        let request = GuestRequest {
            method: "POST".into(),
            body: Bytes::from_static(b"payload"),
            ..get("http://localhost/")
        };
        let response = sandbox.handle(&request, &LIVE).unwrap();
        let json: serde_json::Value = serde_json::from_str(text_of(&response)).unwrap();
        assert_eq!(json["method"], "POST");
        assert_eq!(json["body"], "payload");
        assert_eq!(json["hasCtx"], "function");
        assert!(response.headers.contains(&("content-type".into(), "application/json".into())));
    }

    #[test]
    fn test_no_handler_and_compile_error() {
        let err = sandbox_with(SandboxConfig::default(), "const x = 1;").err().unwrap();
        assert!(matches!(err, WorkerError::NoHandler { .. }));

        let err = sandbox_with(SandboxConfig::default(), "function (").err().unwrap();
        assert!(matches!(err, WorkerError::CompileError { .. }));
    }

    #[test]
    fn test_thrown_error_is_handler_error() {
        let mut sandbox = sandbox("addEventListener('fetch', () => { throw new Error('boom'); });");
        let err = sandbox.handle(&get("http://localhost/"), &LIVE).unwrap_err();
        match err {
            WorkerError::HandlerError { message, .. } => assert!(message.contains("boom")),
            other => panic!("unexpected {other:?}"),
        }

        // The sandbox stays usable.
        assert!(sandbox.handle(&get("http://localhost/"), &LIVE).is_err());
    }

    #[test]
    fn test_non_response_is_handler_error() {
        let mut sandbox = sandbox("export default { fetch() { return 'nope'; } };");
        let err = sandbox.handle(&get("http://localhost/"), &LIVE).unwrap_err();
        assert!(matches!(err, WorkerError::HandlerError { .. }));
    }

    #[test]
    fn test_timers_drive_settlement() {
        let mut sandbox = sandbox(
            r"export default {
                fetch() {
                    return new Promise((resolve) => setTimeout(() => resolve(new Response('late')), 20));
                },
            };",
        );
        let response = sandbox.handle(&get("http://localhost/"), &LIVE).unwrap();
        assert_eq!(text_of(&response), "late");
    }

    #[test]
    fn test_cooperative_timeout() {
        let config = SandboxConfig {
            timeout_ms: 50,
            ..SandboxConfig::default()
        };
        let (mut sandbox, _) = sandbox_with(
            config,
            "export default { fetch() { return new Promise(() => setInterval(() => {}, 10)); } };",
        )
        .unwrap();
        let err = sandbox.handle(&get("http://localhost/"), &LIVE).unwrap_err();
        assert!(matches!(err, WorkerError::Timeout { budget_ms: 50, .. }));
    }

    #[test]
    fn test_never_settling_handler() {
        let mut sandbox = sandbox("export default { fetch() { return new Promise(() => {}); } };");
        let err = sandbox.handle(&get("http://localhost/"), &LIVE).unwrap_err();
        assert!(matches!(err, WorkerError::HandlerError { .. }));
    }

    #[test]
    fn test_runaway_loop_aborts() {
        let config = SandboxConfig {
            loop_iteration_limit: 10_000,
            ..SandboxConfig::default()
        };
        let (mut sandbox, _) = sandbox_with(
            config,
            "export default { fetch() { for (;;) {} } };",
        )
        .unwrap();
        let err = sandbox.handle(&get("http://localhost/"), &LIVE).unwrap_err();
        assert!(err.poisons_instance(), "got {err:?}");
    }

    #[test]
    fn test_stream_pull_and_cancel() {
        let mut sandbox = sandbox(
            r"let n = 0;
            export default {
                fetch() {
                    return new Response(new ReadableStream({
                        pull(controller) {
                            n += 1;
                            controller.enqueue('chunk' + n);
                            if (n === 2) controller.close();
                        },
                        cancel() { console.log('cancelled'); },
                    }));
                },
            };",
        );
        let response = sandbox.handle(&get("http://localhost/"), &LIVE).unwrap();
        let SandboxBody::Stream(id) = response.body else {
            panic!("expected stream body");
        };
        assert_eq!(sandbox.pull(id, &LIVE).unwrap(), Some(Bytes::from("chunk1")));
        assert_eq!(sandbox.pull(id, &LIVE).unwrap(), Some(Bytes::from("chunk2")));
        assert_eq!(sandbox.pull(id, &LIVE).unwrap(), None);

        // A second stream cancelled early runs the guest's cancel callback once.
        let response = sandbox.handle(&get("http://localhost/"), &LIVE).unwrap();
        let SandboxBody::Stream(id) = response.body else {
            panic!("expected stream body");
        };
        sandbox.cancel(id);
        sandbox.cancel(id);
        let cancelled = CONSOLE.with(|lines| {
            lines
                .borrow()
                .iter()
                .filter(|line| line.as_str() == "info cancelled")
                .count()
        });
        assert_eq!(cancelled, 1);
    }

    #[test]
    fn test_body_read_twice() {
        let mut sandbox = sandbox(
            r"export default {
                async fetch(request) {
                    await request.text();
                    try {
                        await request.text();
                        return new Response('read twice');
                    } catch (e) {
                        return new Response(e.message);
                    }
                },
            };",
        );
        let response = sandbox.handle(&get("http://localhost/"), &LIVE).unwrap();
        assert!(text_of(&response).starts_with("BodyAlreadyConsumed"));
    }

    #[test]
    fn test_binary_body_and_text_codec() {
        let mut sandbox = sandbox(
            r"export default {
                fetch() {
                    const bytes = new TextEncoder().encode('héllo');
                    return new Response(bytes);
                },
            };",
        );
        let response = sandbox.handle(&get("http://localhost/"), &LIVE).unwrap();
        match response.body {
            SandboxBody::Binary(bytes) => assert_eq!(&bytes[..], "héllo".as_bytes()),
            other => panic!("expected binary body, got {other:?}"),
        }
    }

    #[test]
    fn test_late_result_of_timed_out_request_is_dropped() {
        let config = SandboxConfig {
            timeout_ms: 30,
            ..SandboxConfig::default()
        };
        let (mut sandbox, _) = sandbox_with(
            config,
            r"export default {
                fetch(request) {
                    const delay = new URL(request.url).pathname === '/slow' ? 60 : 0;
                    return new Promise((resolve) => setTimeout(() => resolve(new Response('done')), delay));
                },
            };",
        )
        .unwrap();

        let err = sandbox.handle(&get("http://localhost/slow"), &LIVE).unwrap_err();
        assert!(matches!(err, WorkerError::Timeout { budget_ms: 30, .. }));
        assert_eq!(sandbox.retained_ops(), 0);

        // The slow timer fires while the next request settles.
        thread::sleep(Duration::from_millis(50));
        let response = sandbox.handle(&get("http://localhost/fast"), &LIVE).unwrap();
        assert_eq!(text_of(&response), "done");
        assert_eq!(sandbox.retained_ops(), 0);
    }

    #[test]
    fn test_abandoned_request_stops_waiting() {
        let mut sandbox = sandbox(
            r"export default {
                fetch() {
                    return new Promise((resolve) => setTimeout(() => resolve(new Response('late')), 2000));
                },
            };",
        );
        let abandoned = AtomicBool::new(true);
        let started = std::time::Instant::now();
        let err = sandbox.handle(&get("http://localhost/"), &abandoned).unwrap_err();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(matches!(err, WorkerError::HandlerError { .. }));
        assert!(!err.poisons_instance());
        assert_eq!(sandbox.retained_ops(), 0);
    }

    #[test]
    fn test_set_cookie_values_stay_separate() {
        let mut sandbox = sandbox(
            r"export default {
                fetch() {
                    const headers = new Headers();
                    headers.append('Set-Cookie', 'a=1');
                    headers.append('Set-Cookie', 'b=2');
                    headers.append('Vary', 'accept');
                    headers.append('Vary', 'origin');
                    const summary = headers.get('vary') + '|' + headers.getSetCookie().length;
                    return new Response(summary, { headers });
                },
            };",
        );
        let response = sandbox.handle(&get("http://localhost/"), &LIVE).unwrap();
        assert_eq!(text_of(&response), "accept, origin|2");
        let cookies: Vec<_> = response
            .headers
            .iter()
            .filter(|(name, _)| name == "set-cookie")
            .map(|(_, value)| value.as_str())
            .collect();
        assert_eq!(cookies, ["a=1", "b=2"]);
        assert!(response.headers.contains(&("vary".into(), "accept, origin".into())));
    }

    #[test]
    fn test_rewrite_default_export() {
        assert_eq!(
            rewrite_default_export("export default {}; // export default"),
            "module.exports = {}; // export default"
        );
        assert_eq!(rewrite_default_export("const a = 1;"), "const a = 1;");
    }
}

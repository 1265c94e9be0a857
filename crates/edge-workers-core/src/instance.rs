//! Running worker instances.
//!
//! A [`RunningInstance`] is a handle to one sandbox thread. The thread owns
//! the JavaScript context and serves commands one at a time:
//!
//! 1. Build the context, link host functions, evaluate the guest script
//! 2. Report the resolved handler (or the load failure) back to the caller
//! 3. Serve `Handle`, `Pull` and `Cancel` commands until terminated
//!
//! Every call that waits on the sandbox is bounded by a host-side timeout
//! measured on the sandbox's [`ExecutionClock`], so time spent waiting on
//! outbound requests is not charged. A sandbox that overruns it is poisoned:
//! it keeps its thread until the engine's loop limit unwinds it, but it never
//! serves another request, and its retire hook removes it from service.
//!
//! The execution slot is held until the sandbox answers, not until the caller
//! stops waiting. A caller that goes away raises the command's `abandoned`
//! flag and the sandbox stops settling at its next poll.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, OwnedMutexGuard, mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, instrument, warn};

use edge_workers_common::{SandboxConfig, WorkerError};

use crate::inflight::InflightGuard;
use crate::logs::LogChannel;
use crate::request::GuestRequest;
use crate::sandbox::{Deadline, ExecutionClock, GuestScope, HostLinker, Sandbox, SandboxBody, SandboxResponse};
use crate::store::WorkerDefinition;

/// Extra time the host waits beyond the sandbox's own budget before giving up
/// on it. The sandbox enforces the budget cooperatively first.
const HOST_SLACK: Duration = Duration::from_millis(250);

/// Called once, the first time an instance is poisoned.
pub type RetireHook = Arc<dyn Fn(&RunningInstance) + Send + Sync>;

/// How a worker registered its request handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HandlerKind {
    /// `addEventListener('fetch', ...)` with `event.respondWith(...)`.
    EventListener,
    /// `export default { fetch }`, called as `fetch(request, env, ctx)`.
    ExportedFetch,
}

type Reply<T> = oneshot::Sender<Result<T, WorkerError>>;

enum Command {
    Handle {
        request: GuestRequest,
        reply: Reply<SandboxResponse>,
        abandoned: Arc<AtomicBool>,
    },
    Pull {
        stream_id: u32,
        reply: Reply<Option<Bytes>>,
        abandoned: Arc<AtomicBool>,
    },
    Cancel {
        stream_id: u32,
    },
    Terminate,
}

/// Budget for one command and what overrunning it means.
#[derive(Debug, Clone, Copy)]
struct Budget {
    limit: Duration,
    limit_ms: u64,
    /// Whether a cooperative timeout reported by the sandbox retires it.
    timeout_poisons: bool,
}

/// A started worker.
pub struct RunningInstance {
    worker_id: String,
    name: String,
    route: String,
    handler: HandlerKind,
    started_at: DateTime<Utc>,
    commands: mpsc::UnboundedSender<Command>,
    /// One execution at a time; queued callers wait here, outside the timeout.
    slot: Arc<Mutex<()>>,
    clock: ExecutionClock,
    poisoned: AtomicBool,
    on_poison: RetireHook,
    config: SandboxConfig,
}

impl std::fmt::Debug for RunningInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningInstance")
            .field("worker_id", &self.worker_id)
            .field("route", &self.route)
            .field("handler", &self.handler)
            .field("poisoned", &self.is_poisoned())
            .finish_non_exhaustive()
    }
}

impl RunningInstance {
    /// Spawn a sandbox thread for `definition` and wait for its script to load.
    ///
    /// `on_poison` runs once if the instance is later poisoned.
    ///
    /// # Errors
    ///
    /// - [`WorkerError::CompileError`] if the script fails to evaluate
    /// - [`WorkerError::NoHandler`] if it registers no fetch handler
    /// - [`WorkerError::Timeout`] if loading overruns the execution budget
    #[instrument(skip_all, fields(worker_id = %definition.id))]
    pub async fn spawn(
        definition: &WorkerDefinition,
        config: &SandboxConfig,
        linker: Arc<dyn HostLinker>,
        logs: LogChannel,
        on_poison: RetireHook,
    ) -> Result<Arc<Self>, WorkerError> {
        let scope = GuestScope::new(definition.id.clone(), logs, Handle::current());
        let clock = scope.clock().clone();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let source = definition.code.clone();
        let thread_config = config.clone();
        thread::Builder::new()
            .name(format!("worker-{}", definition.id))
            .spawn(move || serve(scope, thread_config, linker, source, ready_tx, command_rx))
            .map_err(|e| {
                WorkerError::compile(&definition.id, format!("failed to spawn sandbox thread: {e}"))
            })?;

        let handler = match timeout(config.timeout() + HOST_SLACK, ready_rx).await {
            Ok(Ok(loaded)) => loaded?,
            Ok(Err(_)) => return Err(WorkerError::sandbox_unavailable(&definition.id)),
            Err(_) => {
                return Err(WorkerError::Timeout {
                    worker_id: definition.id.clone(),
                    budget_ms: config.timeout_ms,
                });
            }
        };

        debug!(handler = ?handler, "Sandbox ready");
        Ok(Arc::new(Self {
            worker_id: definition.id.clone(),
            name: definition.name.clone(),
            route: definition.normalized_route().to_string(),
            handler,
            started_at: Utc::now(),
            commands: command_tx,
            slot: Arc::new(Mutex::new(())),
            clock,
            poisoned: AtomicBool::new(false),
            on_poison,
            config: config.clone(),
        }))
    }

    /// Worker id.
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Route the worker was started with.
    pub fn route(&self) -> &str {
        &self.route
    }

    /// Handler style resolved at start.
    pub fn handler(&self) -> HandlerKind {
        self.handler
    }

    /// When the instance finished loading.
    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whether the sandbox overran a budget and must be retired.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    fn poison(&self) {
        if !self.poisoned.swap(true, Ordering::AcqRel) {
            error!(worker_id = %self.worker_id, "Sandbox poisoned");
            (self.on_poison)(self);
        }
    }

    /// Run the handler for `request`.
    ///
    /// # Errors
    ///
    /// - [`WorkerError::HandlerError`] if the guest throws or returns a non-Response
    /// - [`WorkerError::Timeout`] if the budget is exceeded; the instance is poisoned
    /// - [`WorkerError::SandboxUnavailable`] if the instance is poisoned or gone
    pub async fn handle(self: &Arc<Self>, request: GuestRequest) -> Result<GuestResponse, WorkerError> {
        let budget = Budget {
            limit: self.config.timeout(),
            limit_ms: self.config.timeout_ms,
            timeout_poisons: true,
        };
        let response = self
            .execute(budget, |reply, abandoned| Command::Handle {
                request,
                reply,
                abandoned,
            })
            .await?;

        let body = match response.body {
            SandboxBody::Empty => GuestBody::Empty,
            SandboxBody::Text(text) => GuestBody::Text(text),
            SandboxBody::Binary(bytes) => GuestBody::Binary(bytes),
            SandboxBody::Stream(stream_id) => {
                GuestBody::Stream(GuestStream::new(Arc::clone(self), stream_id))
            }
        };
        Ok(GuestResponse {
            status: response.status,
            status_text: response.status_text,
            headers: response.headers,
            body,
        })
    }

    /// An idle stream is the guest's problem, not a stuck sandbox; only a
    /// host-side overrun poisons here.
    async fn pull(self: &Arc<Self>, stream_id: u32) -> Result<Option<Bytes>, WorkerError> {
        let budget = Budget {
            limit: self.config.stream_idle_timeout(),
            limit_ms: self.config.stream_idle_timeout_ms,
            timeout_poisons: false,
        };
        self.execute(budget, |reply, abandoned| Command::Pull {
            stream_id,
            reply,
            abandoned,
        })
        .await
    }

    fn cancel_stream(&self, stream_id: u32) {
        if self.is_poisoned() {
            return;
        }
        // Ordered behind any in-flight command; a closed channel means the
        // sandbox is already gone and there is nothing left to cancel.
        let _ = self.commands.send(Command::Cancel { stream_id });
    }

    /// Ask the sandbox thread to exit once its current command finishes.
    /// The instance refuses new work immediately.
    pub fn terminate(&self) {
        self.poisoned.store(true, Ordering::Release);
        let _ = self.commands.send(Command::Terminate);
    }

    fn ensure_usable(&self) -> Result<(), WorkerError> {
        if self.is_poisoned() {
            Err(WorkerError::sandbox_unavailable(&self.worker_id))
        } else {
            Ok(())
        }
    }

    fn send(&self, command: Command) -> Result<(), WorkerError> {
        self.commands.send(command).map_err(|_| {
            self.poison();
            WorkerError::sandbox_unavailable(&self.worker_id)
        })
    }

    /// Take the slot, send one command and hand the wait to a watcher task
    /// that owns the slot until the sandbox replies or is poisoned.
    async fn execute<T, F>(self: &Arc<Self>, budget: Budget, command: F) -> Result<T, WorkerError>
    where
        T: Send + 'static,
        F: FnOnce(Reply<T>, Arc<AtomicBool>) -> Command,
    {
        let slot = Arc::clone(&self.slot).lock_owned().await;
        self.ensure_usable()?;

        let abandoned = Arc::new(AtomicBool::new(false));
        let (reply, rx) = oneshot::channel();
        self.send(command(reply, Arc::clone(&abandoned)))?;

        let deadline = self.clock.deadline(budget.limit + HOST_SLACK);
        let (forward, outcome) = oneshot::channel();
        tokio::spawn(Arc::clone(self).watch(slot, rx, forward, abandoned, deadline, budget));

        outcome
            .await
            .unwrap_or_else(|_| Err(WorkerError::sandbox_unavailable(&self.worker_id)))
    }

    async fn watch<T>(
        self: Arc<Self>,
        _slot: OwnedMutexGuard<()>,
        mut rx: oneshot::Receiver<Result<T, WorkerError>>,
        mut forward: Reply<T>,
        abandoned: Arc<AtomicBool>,
        deadline: Deadline,
        budget: Budget,
    ) {
        let outcome = loop {
            tokio::select! {
                replied = &mut rx => break self.settled(replied, budget),
                () = forward.closed(), if !abandoned.load(Ordering::Acquire) => {
                    debug!(worker_id = %self.worker_id, "Caller went away, waiting for the sandbox to settle");
                    abandoned.store(true, Ordering::Release);
                }
                () = sleep(deadline.remaining()) => {
                    // Outbound waits may have moved the deadline while asleep.
                    if deadline.is_expired() {
                        self.poison();
                        break Err(WorkerError::Timeout {
                            worker_id: self.worker_id.clone(),
                            budget_ms: budget.limit_ms,
                        });
                    }
                }
            }
        };
        let _ = forward.send(outcome);
    }

    fn settled<T>(
        &self,
        replied: Result<Result<T, WorkerError>, oneshot::error::RecvError>,
        budget: Budget,
    ) -> Result<T, WorkerError> {
        match replied {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                let poisons = match &e {
                    WorkerError::Timeout { .. } => budget.timeout_poisons,
                    other => other.poisons_instance(),
                };
                if poisons {
                    self.poison();
                }
                Err(e)
            }
            Err(_) => {
                // The sandbox thread dropped the reply: it panicked or exited.
                self.poison();
                Err(WorkerError::sandbox_unavailable(&self.worker_id))
            }
        }
    }
}

/// Sandbox thread body.
fn serve(
    scope: GuestScope,
    config: SandboxConfig,
    linker: Arc<dyn HostLinker>,
    source: String,
    ready: oneshot::Sender<Result<HandlerKind, WorkerError>>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let worker_id = scope.worker_id().to_string();
    let loaded = Sandbox::new(&scope, &config, linker.as_ref()).and_then(|mut sandbox| {
        let handler = sandbox.load(&source)?;
        Ok((sandbox, handler))
    });

    let mut sandbox = match loaded {
        Ok((sandbox, handler)) => {
            if ready.send(Ok(handler)).is_err() {
                debug!(worker_id = %worker_id, "Start abandoned before the sandbox was ready");
                return;
            }
            sandbox
        }
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    while let Some(command) = commands.blocking_recv() {
        match command {
            Command::Handle {
                request,
                reply,
                abandoned,
            } => {
                if abandoned.load(Ordering::Acquire) {
                    warn!(worker_id = %worker_id, url = %request.url, "Skipping abandoned request");
                    let _ = reply.send(Err(WorkerError::handler(
                        &worker_id,
                        "caller went away before the request ran",
                    )));
                    continue;
                }
                let _ = reply.send(sandbox.handle(&request, &abandoned));
            }
            Command::Pull {
                stream_id,
                reply,
                abandoned,
            } => {
                let _ = reply.send(sandbox.pull(stream_id, &abandoned));
            }
            Command::Cancel { stream_id } => sandbox.cancel(stream_id),
            Command::Terminate => break,
        }
    }
    debug!(worker_id = %worker_id, "Sandbox thread exiting");
}

/// Kind of body a guest response carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Empty,
    Text,
    Binary,
    Stream,
}

/// A response produced by a guest handler.
#[derive(Debug)]
pub struct GuestResponse {
    /// HTTP status.
    pub status: u16,
    /// Reason phrase set by the guest, possibly empty.
    pub status_text: String,
    /// Headers with lower-cased names.
    pub headers: Vec<(String, String)>,
    /// Body.
    pub body: GuestBody,
}

impl GuestResponse {
    /// Header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Body of a [`GuestResponse`].
#[derive(Debug)]
pub enum GuestBody {
    Empty,
    Text(String),
    Binary(Bytes),
    Stream(GuestStream),
}

impl GuestBody {
    /// Which kind of body this is.
    pub fn kind(&self) -> BodyKind {
        match self {
            GuestBody::Empty => BodyKind::Empty,
            GuestBody::Text(_) => BodyKind::Text,
            GuestBody::Binary(_) => BodyKind::Binary,
            GuestBody::Stream(_) => BodyKind::Stream,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    Finished,
    Cancelled,
}

/// A response body still being produced inside the sandbox.
///
/// Chunks are pulled on demand. Dropping an unfinished stream cancels it,
/// and the guest's cancel callback runs at most once.
pub struct GuestStream {
    instance: Arc<RunningInstance>,
    stream_id: u32,
    state: StreamState,
    guard: Option<InflightGuard>,
}

impl std::fmt::Debug for GuestStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestStream")
            .field("worker_id", &self.instance.worker_id)
            .field("stream_id", &self.stream_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl GuestStream {
    fn new(instance: Arc<RunningInstance>, stream_id: u32) -> Self {
        Self {
            instance,
            stream_id,
            state: StreamState::Open,
            guard: None,
        }
    }

    /// Keep the request counted as in flight until the stream ends.
    pub(crate) fn attach(&mut self, guard: InflightGuard) {
        self.guard = Some(guard);
    }

    /// Worker producing the stream.
    pub fn worker_id(&self) -> &str {
        &self.instance.worker_id
    }

    /// Whether the stream ended or was cancelled.
    pub fn is_closed(&self) -> bool {
        self.state != StreamState::Open
    }

    /// Next chunk, or `None` once the guest closed the stream.
    ///
    /// # Errors
    ///
    /// - [`WorkerError::BodyAlreadyConsumed`] after [`GuestStream::cancel`]
    /// - [`WorkerError::HandlerError`] if the guest errored the stream
    /// - [`WorkerError::Timeout`] if no chunk arrives within the idle budget
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>, WorkerError> {
        match self.state {
            StreamState::Finished => return Ok(None),
            StreamState::Cancelled => return Err(WorkerError::BodyAlreadyConsumed),
            StreamState::Open => {}
        }

        let chunk = self.instance.pull(self.stream_id).await;
        if let Ok(None) = chunk {
            self.state = StreamState::Finished;
            self.guard = None;
        }
        chunk
    }

    /// Cancel the stream. Only the first call reaches the guest.
    pub fn cancel(&mut self) {
        if self.state == StreamState::Open {
            self.state = StreamState::Cancelled;
            self.instance.cancel_stream(self.stream_id);
            self.guard = None;
        }
    }
}

impl Drop for GuestStream {
    fn drop(&mut self) {
        self.cancel();
    }
}

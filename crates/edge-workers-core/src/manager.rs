//! Worker lifecycle and request dispatch.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use edge_workers_common::{RuntimeConfig, SandboxConfig, StoreError, WorkerError};

use crate::inflight::InflightTracker;
use crate::instance::{GuestBody, GuestResponse, RetireHook, RunningInstance};
use crate::logs::LogChannel;
use crate::registry::InstanceRegistry;
use crate::request::InboundRequest;
use crate::routing::{RouteEntry, RouteMatch, RouteResolver};
use crate::sandbox::HostLinker;
use crate::store::{DefinitionStore, RunningSetStore};

/// A request that reached a worker.
#[derive(Debug)]
pub struct Dispatched {
    /// Worker that served it.
    pub worker_id: String,
    /// Route it matched.
    pub route: String,
    /// The guest's response.
    pub response: GuestResponse,
}

/// Owns every running instance and routes requests to them.
///
/// Lifecycle operations (`start`, `stop`, `restart_all`, `autostart`) keep
/// the persisted running set in step with the registry. `shutdown_all`
/// deliberately does not, so the set survives a restart of the process.
pub struct WorkerManager {
    book: Arc<Bookkeeping>,
    definitions: Arc<dyn DefinitionStore>,
    linker: Arc<dyn HostLinker>,
    logs: LogChannel,
    sandbox: SandboxConfig,
    resolver: RouteResolver,
    accepting: AtomicBool,
    inflight: Arc<InflightTracker>,
}

/// State shared with the retire hooks of running instances.
struct Bookkeeping {
    registry: InstanceRegistry,
    running_set: Arc<dyn RunningSetStore>,
    logs: LogChannel,
    persist_lock: Mutex<()>,
}

impl Bookkeeping {
    /// Take a poisoned instance out of service. Returns `false` if it was
    /// already stopped or replaced.
    fn retire(&self, instance: &RunningInstance) -> bool {
        if !self.registry.retire(instance) {
            return false;
        }
        instance.terminate();
        error!(worker_id = %instance.worker_id(), "Worker retired after its sandbox became unusable");
        self.logs.error(
            instance.worker_id(),
            format!(
                "Worker \"{}\" stopped: sandbox exceeded its limits",
                instance.name()
            ),
        );
        true
    }

    async fn persist(&self) {
        let _lock = self.persist_lock.lock().await;
        let ids = self.registry.snapshot();
        if let Err(e) = self.running_set.save_running_ids(&ids).await {
            warn!(error = %e, "Failed to persist running set");
        }
    }
}

impl WorkerManager {
    /// Create a manager.
    ///
    /// # Arguments
    ///
    /// * `config` - Sandbox budgets, log capacity and reserved route prefixes
    /// * `definitions` - Where worker definitions and sources are read from
    /// * `running_set` - Where the set of running ids is persisted
    /// * `linker` - Host capabilities installed into every sandbox
    pub fn new(
        config: &RuntimeConfig,
        definitions: Arc<dyn DefinitionStore>,
        running_set: Arc<dyn RunningSetStore>,
        linker: Arc<dyn HostLinker>,
    ) -> Self {
        let logs = LogChannel::new(config.logging.max_entries_per_worker);
        Self {
            book: Arc::new(Bookkeeping {
                registry: InstanceRegistry::default(),
                running_set,
                logs: logs.clone(),
                persist_lock: Mutex::new(()),
            }),
            definitions,
            linker,
            logs,
            sandbox: config.sandbox.clone(),
            resolver: RouteResolver::new(&config.routing.reserved_prefixes),
            accepting: AtomicBool::new(true),
            inflight: Arc::new(InflightTracker::default()),
        }
    }

    /// Per-worker log channel.
    pub fn logs(&self) -> &LogChannel {
        &self.logs
    }

    /// Definition store.
    pub fn definitions(&self) -> &Arc<dyn DefinitionStore> {
        &self.definitions
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start `worker_id`.
    ///
    /// # Errors
    ///
    /// - [`WorkerError::NotFound`] if no definition exists
    /// - [`WorkerError::AlreadyRunning`] if it is running or being started/stopped
    /// - [`WorkerError::CompileError`] / [`WorkerError::NoHandler`] if the script is unusable
    /// - [`WorkerError::ShuttingDown`] once shutdown has begun
    #[instrument(skip(self))]
    pub async fn start(&self, worker_id: &str) -> Result<Arc<RunningInstance>, WorkerError> {
        if !self.is_accepting() {
            return Err(WorkerError::ShuttingDown);
        }
        let reservation = self.book.registry.reserve(worker_id)?;

        let definition = match self.definitions.get_definition(worker_id).await {
            Ok(definition) => definition,
            Err(StoreError::NotFound { .. }) => return Err(WorkerError::not_found(worker_id)),
            Err(e) => return Err(e.into()),
        };

        let instance = match RunningInstance::spawn(
            &definition,
            &self.sandbox,
            Arc::clone(&self.linker),
            self.logs.clone(),
            self.retire_hook(),
        )
        .await
        {
            Ok(instance) => instance,
            Err(e) => {
                warn!(worker_id, error = %e, "Worker failed to start");
                self.logs.error(worker_id, format!("Failed to start: {e}"));
                return Err(e);
            }
        };

        reservation.commit(Arc::clone(&instance));
        info!(worker_id, route = %instance.route(), handler = ?instance.handler(), "Worker started");
        self.logs
            .info(worker_id, format!("Worker \"{}\" started", instance.name()));
        self.persist_running_set().await;
        Ok(instance)
    }

    /// Stop `worker_id`, terminating its sandbox.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::NotRunning`] if it has no running instance.
    #[instrument(skip(self))]
    pub async fn stop(&self, worker_id: &str) -> Result<(), WorkerError> {
        let instance = self.book.registry.begin_stop(worker_id)?;
        instance.terminate();
        self.book.registry.finish_stop(worker_id);

        info!(worker_id, "Worker stopped");
        self.logs
            .info(worker_id, format!("Worker \"{}\" stopped", instance.name()));
        self.persist_running_set().await;
        Ok(())
    }

    /// Stop and start every running worker, picking up new sources.
    ///
    /// Returns how many workers were running when the restart began; a
    /// worker whose new source fails to start counts but stays stopped, and
    /// the failure is logged for it.
    pub async fn restart_all(&self) -> usize {
        let ids = self.book.registry.snapshot();
        let mut failed = 0;
        for worker_id in &ids {
            if let Err(e) = self.stop(worker_id).await {
                warn!(worker_id = %worker_id, error = %e, "Restart: stop failed");
                self.logs.error(worker_id, format!("Failed to stop: {e}"));
            }
            if let Err(e) = self.start(worker_id).await {
                failed += 1;
                warn!(worker_id = %worker_id, error = %e, "Restart: start failed");
            }
        }
        info!(total = ids.len(), failed, "Workers restarted");
        ids.len()
    }

    /// Terminate every instance without touching the persisted running set.
    pub fn shutdown_all(&self) -> usize {
        let drained = self.book.registry.drain();
        for instance in &drained {
            instance.terminate();
            self.logs.info(
                instance.worker_id(),
                format!("Worker \"{}\" stopped", instance.name()),
            );
        }
        info!(count = drained.len(), "All workers shut down");
        drained.len()
    }

    /// Start every worker recorded in the running set.
    ///
    /// # Errors
    ///
    /// Fails only if the running set cannot be read; individual start
    /// failures are logged and skipped.
    pub async fn autostart(&self) -> Result<usize, WorkerError> {
        let ids = self.book.running_set.load_running_ids().await?;
        let mut started = 0;
        for worker_id in &ids {
            match self.start(worker_id).await {
                Ok(_) => started += 1,
                Err(e) => warn!(worker_id = %worker_id, error = %e, "Autostart failed"),
            }
        }
        if started < ids.len() {
            // Drop ids that no longer start from the record.
            self.persist_running_set().await;
        }
        info!(started, recorded = ids.len(), "Autostart complete");
        Ok(started)
    }

    /// Whether `worker_id` has a running instance.
    pub fn is_running(&self, worker_id: &str) -> bool {
        self.book.registry.is_running(worker_id)
    }

    /// Ids of running workers.
    pub fn snapshot(&self) -> BTreeSet<String> {
        self.book.registry.snapshot()
    }

    /// Running instance for `worker_id`.
    pub fn instance(&self, worker_id: &str) -> Option<Arc<RunningInstance>> {
        self.book.registry.get(worker_id)
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Route `request` to a running worker and run its handler.
    ///
    /// # Errors
    ///
    /// - [`WorkerError::NotAWorkerRoute`] if the path belongs to nobody
    /// - [`WorkerError::WorkerNotRunning`] if the matching worker is stopped
    /// - [`WorkerError::UnknownRoute`] if the path only resembles a route
    /// - [`WorkerError::ShuttingDown`] once shutdown has begun
    /// - any handler error from [`RunningInstance::handle`]
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path))]
    pub async fn dispatch(&self, request: InboundRequest) -> Result<Dispatched, WorkerError> {
        if !self.is_accepting() {
            return Err(WorkerError::ShuttingDown);
        }

        let definitions = self.definitions.list_definitions().await?;
        let outcome = {
            let entries: Vec<RouteEntry<'_>> = definitions
                .iter()
                .map(|definition| RouteEntry {
                    route: definition.normalized_route(),
                    worker_id: &definition.id,
                    running: self.book.registry.is_running(&definition.id),
                })
                .collect();
            self.resolver.resolve(&request.path, &entries)
        };

        let (worker_id, route, forwarded_path) = match outcome {
            RouteMatch::Dispatch {
                worker_id,
                route,
                forwarded_path,
            } => (worker_id, route, forwarded_path),
            RouteMatch::NotRunning { route } => return Err(WorkerError::WorkerNotRunning { route }),
            RouteMatch::Unknown => return Err(WorkerError::UnknownRoute { path: request.path }),
            RouteMatch::NotAWorkerRoute => {
                return Err(WorkerError::NotAWorkerRoute { path: request.path });
            }
        };

        // Stopped between resolving and here.
        let Some(instance) = self.book.registry.get(&worker_id) else {
            return Err(WorkerError::WorkerNotRunning { route });
        };

        let guard = self.inflight.enter();
        let guest_request = request.rewrite(&forwarded_path);
        let method = guest_request.method.clone();
        let url = guest_request.url.clone();
        debug!(worker_id = %worker_id, url = %url, "Dispatching");
        self.logs
            .info(&worker_id, format!("Request: {method} {url}"));

        match instance.handle(guest_request).await {
            Ok(mut response) => {
                self.logs.info(
                    &worker_id,
                    format!("Request {method} {url} completed [{}]", response.status),
                );
                if let GuestBody::Stream(stream) = &mut response.body {
                    stream.attach(guard);
                }
                Ok(Dispatched {
                    worker_id,
                    route,
                    response,
                })
            }
            Err(e) => {
                self.logs
                    .error(&worker_id, format!("Request {method} {url} failed: {e}"));
                if instance.is_poisoned() {
                    // The retire hook already took it out of the registry.
                    self.persist_running_set().await;
                }
                match e {
                    WorkerError::SandboxUnavailable { .. } => {
                        Err(WorkerError::WorkerNotRunning { route })
                    }
                    other => Err(other),
                }
            }
        }
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Refuse new dispatches and starts from now on.
    pub fn begin_shutdown(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            info!(inflight = self.inflight.count(), "Shutdown started");
        }
    }

    /// Whether new requests are accepted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Requests (including open response streams) still being served.
    pub fn inflight(&self) -> usize {
        self.inflight.count()
    }

    /// Wait up to `grace` for in-flight requests to finish.
    /// Returns `false` if some were still running when the grace period ended.
    pub async fn drain(&self, grace: Duration) -> bool {
        let drained = self.inflight.wait_idle(grace).await;
        if !drained {
            warn!(
                inflight = self.inflight.count(),
                "Grace period elapsed with requests in flight"
            );
        }
        drained
    }

    /// Hook given to each instance: a poisoned sandbox leaves the registry
    /// at once, whichever caller noticed it, and the running set follows.
    fn retire_hook(&self) -> RetireHook {
        let book = Arc::downgrade(&self.book);
        Arc::new(move |instance: &RunningInstance| {
            let Some(book) = book.upgrade() else {
                return;
            };
            if !book.retire(instance) {
                return;
            }
            match Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move { book.persist().await });
                }
                Err(_) => warn!(
                    worker_id = %instance.worker_id(),
                    "No runtime to persist the running set after retiring a worker"
                ),
            }
        })
    }

    async fn persist_running_set(&self) {
        self.book.persist().await;
    }
}

impl std::fmt::Debug for WorkerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerManager")
            .field("running", &self.book.registry.snapshot())
            .field("accepting", &self.is_accepting())
            .finish_non_exhaustive()
    }
}

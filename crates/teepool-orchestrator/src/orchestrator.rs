//! Orchestrator — assign-or-enqueue routing, reporting, and shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use teepool_autoscale::{Autoscaler, Capacity};
use teepool_core::{PoolError, PoolPolicy, PoolResult, WorkerId, WorkerTemplate};
use teepool_metrics::{PoolStats, StatsCollector, render_prometheus};
use teepool_provision::ProvisioningBackend;
use teepool_state::{Admission, AdmissionQueue, NodePoolRegistry, Worker};

/// Where a routed request should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteOutcome {
    pub endpoint: String,
    /// `None` when the fallback endpoint was used.
    pub worker_id: Option<WorkerId>,
    pub used_fallback: bool,
    /// Time spent in the admission queue.
    pub waited: Duration,
}

/// What [`Orchestrator::shutdown`] cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub rejected: usize,
    pub destroyed: usize,
}

enum Routing {
    Assigned(Worker),
    Queued(Admission),
}

pub struct Orchestrator {
    registry: Arc<NodePoolRegistry>,
    queue: AdmissionQueue,
    autoscaler: Autoscaler,
    stats: StatsCollector,
    fallback_endpoint: Option<String>,
    shutdown_tx: watch::Sender<bool>,
    closed: AtomicBool,
    control_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn ProvisioningBackend>,
        policy: PoolPolicy,
        templates: Vec<WorkerTemplate>,
    ) -> Self {
        let registry = Arc::new(NodePoolRegistry::new());
        let queue = AdmissionQueue::new();
        let autoscaler = Autoscaler::new(
            registry.clone(),
            queue.clone(),
            backend,
            policy,
            templates,
        );
        let stats = StatsCollector::new(registry.clone(), queue.clone());
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            registry,
            queue,
            autoscaler,
            stats,
            fallback_endpoint: None,
            shutdown_tx,
            closed: AtomicBool::new(false),
            control_loop: Mutex::new(None),
        }
    }

    /// Serve this endpoint instead of failing on timeout or provisioning
    /// failure.
    pub fn with_fallback(mut self, endpoint: Option<String>) -> Self {
        self.fallback_endpoint = endpoint;
        self
    }

    pub fn policy(&self) -> &PoolPolicy {
        self.autoscaler.policy()
    }

    pub fn autoscaler(&self) -> &Autoscaler {
        &self.autoscaler
    }

    /// Start the autoscaler loop on a background task. Idempotent.
    pub fn spawn_control_loop(&self) {
        let mut slot = self.control_loop.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        let scaler = self.autoscaler.clone();
        let shutdown = self.shutdown_tx.subscribe();
        *slot = Some(tokio::spawn(scaler.run(shutdown)));
    }

    // ── Routing ────────────────────────────────────────────────────

    /// Find a worker for `capability` (`None` matches any), waiting in the
    /// admission queue if none is serving.
    pub async fn route(&self, capability: Option<&str>) -> PoolResult<RouteOutcome> {
        match self.assign_or_enqueue(capability)? {
            Routing::Assigned(worker) => {
                debug!(worker_id = %worker.id, capability = ?capability, "routed to serving worker");
                Ok(RouteOutcome {
                    endpoint: worker.endpoint.unwrap_or_default(),
                    worker_id: Some(worker.id),
                    used_fallback: false,
                    waited: Duration::ZERO,
                })
            }
            Routing::Queued(admission) => match admission.wait().await {
                Ok(assignment) => Ok(RouteOutcome {
                    endpoint: assignment.endpoint,
                    worker_id: Some(assignment.worker_id),
                    used_fallback: false,
                    waited: assignment.waited,
                }),
                Err(e) => {
                    // A timed-out or rejected head no longer blocks the
                    // requests queued behind it.
                    self.autoscaler.drain_queue();
                    self.fall_back(e)
                }
            },
        }
    }

    fn assign_or_enqueue(&self, capability: Option<&str>) -> PoolResult<Routing> {
        if self.is_closed() {
            return Err(PoolError::Shutdown);
        }
        // Unknown capabilities can never be served.
        self.autoscaler.template_for(capability)?;

        if let Some(worker) = self.registry.claim(capability) {
            return Ok(Routing::Assigned(worker));
        }

        let policy = self.policy();
        let nodes = self.registry.len();
        let queue_depth = self.queue.depth();
        if nodes >= policy.max_nodes && queue_depth >= policy.max_queue_depth {
            warn!(nodes, queue_depth, "rejecting request, pool and queue full");
            return Err(PoolError::CapacityExceeded {
                nodes,
                max_nodes: policy.max_nodes,
                queue_depth,
            });
        }

        let capacity = self.autoscaler.ensure_capacity(capability)?;
        let deadline = Instant::now() + policy.request_deadline;
        let admission = self
            .queue
            .enqueue(capability.map(str::to_string), deadline, capacity.attempt());

        // A worker may have turned warm between the claim and the enqueue.
        self.queue.drain(&self.registry);

        if self.is_closed() {
            self.queue.reject_all(&PoolError::Shutdown);
        }

        // Only the enqueue that reaches the threshold fires the trigger; a
        // request that launched its own worker already scaled up.
        if matches!(capacity, Capacity::Joined(_))
            && self.queue.depth() == policy.scale_up_queue_threshold
            && let Some(id) = self.autoscaler.scale_up_for_backlog(capability)
        {
            info!(worker_id = %id, queue_depth = policy.scale_up_queue_threshold, "backlog scale-up");
        }

        debug!(request_id = %admission.id(), ?capacity, "request queued");
        Ok(Routing::Queued(admission))
    }

    fn fall_back(&self, error: PoolError) -> PoolResult<RouteOutcome> {
        let eligible = matches!(
            error,
            PoolError::Timeout { .. } | PoolError::ProvisioningFailure { .. }
        );
        match &self.fallback_endpoint {
            Some(endpoint) if eligible => {
                info!(error = %error, %endpoint, "routing to fallback endpoint");
                Ok(RouteOutcome {
                    endpoint: endpoint.clone(),
                    worker_id: None,
                    used_fallback: true,
                    waited: Duration::ZERO,
                })
            }
            _ => Err(error),
        }
    }

    /// Record how a request served by `worker_id` went. The worker is idle
    /// again, so queued requests are drained. Returns false for unknown
    /// workers.
    pub fn report(&self, worker_id: WorkerId, success: bool) -> bool {
        if !self.registry.record_outcome(worker_id, success) {
            return false;
        }
        if !success {
            debug!(%worker_id, "request failure reported");
        }
        self.queue.drain(&self.registry);
        true
    }

    // ── Views ──────────────────────────────────────────────────────

    pub fn nodes(&self) -> Vec<Worker> {
        self.registry.snapshot()
    }

    pub fn node(&self, worker_id: WorkerId) -> Option<Worker> {
        self.registry.get(worker_id)
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.collect()
    }

    /// Prometheus text exposition of [`stats`](Self::stats).
    pub fn metrics(&self) -> String {
        render_prometheus(&self.stats())
    }

    // ── Shutdown ───────────────────────────────────────────────────

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the control loop, reject everything queued, and destroy every
    /// worker. New routes fail with [`PoolError::Shutdown`].
    pub async fn shutdown(&self) -> ShutdownReport {
        if self.closed.swap(true, Ordering::SeqCst) {
            return ShutdownReport::default();
        }
        info!("orchestrator shutting down");

        let _ = self.shutdown_tx.send(true);
        let control_loop = self
            .control_loop
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = control_loop
            && let Err(e) = handle.await
        {
            warn!(error = %e, "autoscaler task ended abnormally");
        }

        let rejected = self.queue.reject_all(&PoolError::Shutdown);
        let destroyed = self.autoscaler.drain_all().await;
        info!(rejected, destroyed, "orchestrator stopped");
        ShutdownReport {
            rejected,
            destroyed,
        }
    }
}

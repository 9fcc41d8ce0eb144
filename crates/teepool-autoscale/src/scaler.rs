//! Autoscaler — tick evaluation and the provisioning tasks it spawns.
//!
//! [`TickPlan::evaluate`] is a pure function over a registry snapshot;
//! [`Autoscaler::tick`] applies a plan through the registry's atomic
//! transitions, so a plan built from a stale snapshot can never demote or
//! drain a worker that was assigned in the meantime.

use std::sync::Arc;

use tokio::sync::{Notify, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use teepool_core::{PoolError, PoolPolicy, PoolResult, WorkerId, WorkerTemplate};
use teepool_provision::{ProvisionError, ProvisioningBackend};
use teepool_state::{AdmissionQueue, NodePoolRegistry, Reservation, Worker, WorkerStatus};

/// Why a tick decided to launch a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchReason {
    /// Queue depth reached the scale-up threshold with nothing starting.
    Backlog,
    /// Serving workers are below the warm floor with nothing starting.
    WarmFloor,
}

/// Decisions for one tick, computed from a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickPlan {
    /// `hot` workers idle long enough to be demoted to `warm`.
    pub demote: Vec<WorkerId>,
    /// Serving workers whose error count reached the eviction threshold.
    pub evict: Vec<WorkerId>,
    /// Idle `warm` workers to drain, longest idle first.
    pub drain: Vec<WorkerId>,
    pub launch: Option<LaunchReason>,
}

impl TickPlan {
    pub fn evaluate(
        workers: &[Worker],
        queue_depth: usize,
        policy: &PoolPolicy,
        now: Instant,
    ) -> Self {
        let mut plan = TickPlan::default();
        let total = workers.len();
        let starting = workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Starting)
            .count();
        let mut warm = workers.iter().filter(|w| w.status.is_serving()).count();

        for w in workers {
            if w.status == WorkerStatus::Hot && w.idle_for(now) > policy.demotion_idle() {
                plan.demote.push(w.id);
            }
        }

        // A zero threshold would evict every healthy worker; treat it as unset.
        if let Some(threshold) = policy.error_eviction_threshold.filter(|&t| t > 0) {
            for w in workers {
                if w.status.is_serving() && w.error_count >= threshold {
                    plan.evict.push(w.id);
                    warm -= 1;
                }
            }
        }

        // Demoted workers count as warm for the rest of this tick.
        let mut idle: Vec<&Worker> = workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Warm || plan.demote.contains(&w.id))
            .filter(|w| !plan.evict.contains(&w.id))
            .filter(|w| w.idle_for(now) > policy.scale_down_idle_threshold)
            .collect();
        idle.sort_by_key(|w| std::cmp::Reverse(w.idle_for(now)));
        for w in idle {
            if warm <= policy.min_warm_nodes {
                break;
            }
            plan.drain.push(w.id);
            warm -= 1;
        }

        if total < policy.max_nodes {
            if queue_depth > 0 && queue_depth >= policy.scale_up_queue_threshold && starting == 0 {
                plan.launch = Some(LaunchReason::Backlog);
            } else if starting == 0 && warm < policy.warm_floor() {
                plan.launch = Some(LaunchReason::WarmFloor);
            }
        }

        plan
    }

    pub fn is_empty(&self) -> bool {
        self.demote.is_empty()
            && self.evict.is_empty()
            && self.drain.is_empty()
            && self.launch.is_none()
    }
}

/// What a tick actually did after re-checking each decision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub demoted: usize,
    pub evicted: usize,
    pub drained: usize,
    pub launched: Option<WorkerId>,
}

/// How a queued request will get a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capacity {
    /// A new worker was launched for this request.
    Launched(WorkerId),
    /// A matching worker is already starting.
    Joined(WorkerId),
    /// The pool is full; the request waits for a worker to free up.
    AtCapacity,
}

impl Capacity {
    /// The creation attempt the request depends on, if any.
    pub fn attempt(self) -> Option<WorkerId> {
        match self {
            Capacity::Launched(id) | Capacity::Joined(id) => Some(id),
            Capacity::AtCapacity => None,
        }
    }
}

/// The warm-pool control loop. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Autoscaler {
    registry: Arc<NodePoolRegistry>,
    queue: AdmissionQueue,
    backend: Arc<dyn ProvisioningBackend>,
    policy: PoolPolicy,
    templates: Arc<[WorkerTemplate]>,
    wake: Arc<Notify>,
}

impl Autoscaler {
    pub fn new(
        registry: Arc<NodePoolRegistry>,
        queue: AdmissionQueue,
        backend: Arc<dyn ProvisioningBackend>,
        policy: PoolPolicy,
        templates: Vec<WorkerTemplate>,
    ) -> Self {
        Self {
            registry,
            queue,
            backend,
            policy,
            templates: templates.into(),
            wake: Arc::new(Notify::new()),
        }
    }

    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Template serving `capability`. Without a capability, the template
    /// with the fewest serving or starting workers wins.
    pub fn template_for(&self, capability: Option<&str>) -> PoolResult<&WorkerTemplate> {
        match capability {
            Some(cap) => self
                .templates
                .iter()
                .find(|t| t.capability == cap)
                .ok_or_else(|| PoolError::UnknownCapability(cap.to_string())),
            None => self
                .least_covered(&self.registry.snapshot())
                .ok_or_else(|| PoolError::UnknownCapability("<any>".to_string())),
        }
    }

    fn least_covered(&self, workers: &[Worker]) -> Option<&WorkerTemplate> {
        self.templates.iter().min_by_key(|t| {
            workers
                .iter()
                .filter(|w| w.capability == t.capability)
                .filter(|w| w.status.is_serving() || w.status == WorkerStatus::Starting)
                .count()
        })
    }

    // ── Control loop ───────────────────────────────────────────────

    /// Evaluate the pool once and apply the result.
    ///
    /// Must be called from within a tokio runtime; launches and teardowns
    /// run on spawned tasks.
    pub fn tick(&self) -> TickReport {
        let now = Instant::now();
        let workers = self.registry.snapshot();
        let plan = TickPlan::evaluate(&workers, self.queue.depth(), &self.policy, now);
        let mut report = TickReport::default();
        if plan.is_empty() {
            self.drain_queue();
            debug!(workers = workers.len(), "autoscaler tick: no change");
            return report;
        }

        for &id in &plan.demote {
            if self.registry.demote_if_idle(id, self.policy.demotion_idle()) {
                report.demoted += 1;
            }
        }
        for &id in &plan.evict {
            if self.registry.mark_draining(id) {
                warn!(worker_id = %id, "evicting worker over error threshold");
                self.retire(id);
                report.evicted += 1;
            }
        }
        for &id in &plan.drain {
            if self.registry.drain_if_idle(id, self.policy.scale_down_idle_threshold) {
                self.retire(id);
                report.drained += 1;
            }
        }

        if let Some(reason) = plan.launch {
            let template = match reason {
                LaunchReason::Backlog => match self.queue.head_capability() {
                    Some(Some(cap)) => self.template_for(Some(&cap)).ok(),
                    Some(None) => self.least_covered(&workers),
                    None => None,
                },
                LaunchReason::WarmFloor => self.least_covered(&workers),
            };
            if let Some(template) = template {
                report.launched = self.launch(template, reason);
            }
        }

        // Demoted workers are idle again.
        self.drain_queue();

        info!(
            demoted = report.demoted,
            evicted = report.evicted,
            drained = report.drained,
            launched = ?report.launched,
            "autoscaler tick"
        );
        report
    }

    /// Run ticks until `shutdown` flips. Ticks once immediately so the
    /// warm floor is filled at startup.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.policy.tick_interval.as_millis() as u64,
            backend = self.backend.name(),
            "autoscaler started"
        );

        self.tick();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.policy.tick_interval) => {}
                _ = self.wake.notified() => {
                    debug!("autoscaler woken by backlog");
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
            self.tick();
        }
    }

    /// Ask the control loop to tick now.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    // ── Request-path scale-up ──────────────────────────────────────

    /// Make sure a worker for `capability` is on its way: join one that is
    /// already starting, or launch one if the pool has room.
    pub fn ensure_capacity(&self, capability: Option<&str>) -> PoolResult<Capacity> {
        let template = self.template_for(capability)?;
        let reservation =
            self.registry
                .reserve_unless_starting(capability, template, self.policy.max_nodes);
        let capacity = match reservation {
            Reservation::InFlight(id) => Capacity::Joined(id),
            Reservation::Reserved(worker) => {
                let id = worker.id;
                self.spawn_provision(worker, template.clone());
                Capacity::Launched(id)
            }
            Reservation::AtCapacity => Capacity::AtCapacity,
        };
        debug!(capability = ?capability, ?capacity, "capacity ensured");
        Ok(capacity)
    }

    /// Backlog trigger: launch one more worker for `capability` even though
    /// one is already starting, then wake the loop.
    pub fn scale_up_for_backlog(&self, capability: Option<&str>) -> Option<WorkerId> {
        let launched = self
            .template_for(capability)
            .ok()
            .and_then(|template| self.launch(template, LaunchReason::Backlog));
        self.wake();
        launched
    }

    // ── Provisioning ───────────────────────────────────────────────

    fn launch(&self, template: &WorkerTemplate, reason: LaunchReason) -> Option<WorkerId> {
        let worker = self.registry.reserve_starting(template, self.policy.max_nodes)?;
        let id = worker.id;
        debug!(worker_id = %id, ?reason, capability = %template.capability, "launching worker");
        self.spawn_provision(worker, template.clone());
        Some(id)
    }

    fn spawn_provision(&self, worker: Worker, template: WorkerTemplate) {
        let this = self.clone();
        tokio::spawn(async move { this.provision(worker.id, template).await });
    }

    async fn provision(&self, id: WorkerId, template: WorkerTemplate) {
        let timeout = self.policy.cold_start_timeout;
        let created =
            tokio::time::timeout(timeout, self.backend.create(id, &template, timeout)).await;

        match created {
            Ok(Ok(provisioned)) => {
                if self
                    .registry
                    .mark_warm(id, &provisioned.endpoint, provisioned.attestation_id)
                {
                    let assigned = self.queue.drain(&self.registry);
                    debug!(worker_id = %id, assigned, "queue drained after cold start");
                } else {
                    warn!(worker_id = %id, "worker finished provisioning after removal, destroying");
                    self.registry.remove(id);
                    if let Err(e) = self.backend.destroy(id).await {
                        warn!(worker_id = %id, error = %e, "orphan teardown failed");
                    }
                }
            }
            Ok(Err(e)) => self.fail_attempt(id, &e),
            Err(_elapsed) => {
                self.fail_attempt(id, &ProvisionError::Timeout(timeout));
                // The backend may have left something running.
                if let Err(e) = self.backend.destroy(id).await {
                    debug!(worker_id = %id, error = %e, "teardown after cold start timeout");
                }
            }
        }
    }

    fn fail_attempt(&self, id: WorkerId, error: &ProvisionError) {
        let reason = if error.is_health_check() {
            PoolError::HealthCheckFailure {
                worker_id: id,
                reason: error.to_string(),
            }
            .to_string()
        } else {
            error.to_string()
        };
        warn!(worker_id = %id, %reason, "worker provisioning failed");

        self.registry.mark_error(id);
        self.registry.remove(id);
        let rejected = self.queue.reject_dependents(
            id,
            &PoolError::ProvisioningFailure {
                worker_id: id,
                reason,
            },
        );
        if rejected > 0 {
            info!(worker_id = %id, rejected, "rejected requests waiting on failed worker");
            // The rejected head may have been blocking requests a serving
            // worker can take.
            self.drain_queue();
        }
    }

    /// Assign whatever queued requests the serving workers can take.
    pub fn drain_queue(&self) -> usize {
        let assigned = self.queue.drain(&self.registry);
        if assigned > 0 {
            debug!(assigned, "queued requests assigned");
        }
        assigned
    }

    // ── Teardown ───────────────────────────────────────────────────

    /// Destroy a `draining` worker on a spawned task.
    fn retire(&self, id: WorkerId) {
        let this = self.clone();
        tokio::spawn(async move { this.destroy_worker(id).await });
    }

    /// Destroy a `draining` worker, then mark it stopped and remove it.
    ///
    /// A failed teardown is logged; the record is removed regardless.
    pub async fn destroy_worker(&self, id: WorkerId) {
        if let Err(e) = self.backend.destroy(id).await {
            warn!(worker_id = %id, error = %e, "backend teardown failed");
        }
        self.registry.mark_stopped(id);
        self.registry.remove(id);
    }

    /// Take every worker out of the pool: serving ones are drained and
    /// destroyed, starting ones are discarded (their creations are
    /// destroyed as orphans when they finish). Returns the number
    /// destroyed.
    pub async fn drain_all(&self) -> usize {
        let mut teardown = JoinSet::new();
        for worker in self.registry.snapshot() {
            match worker.status {
                WorkerStatus::Warm | WorkerStatus::Hot => {
                    if self.registry.mark_draining(worker.id) {
                        let this = self.clone();
                        teardown.spawn(async move { this.destroy_worker(worker.id).await });
                    }
                }
                WorkerStatus::Starting => {
                    self.registry.mark_error(worker.id);
                    self.registry.remove(worker.id);
                }
                _ => {}
            }
        }

        let mut destroyed = 0;
        while let Some(joined) = teardown.join_next().await {
            match joined {
                Ok(()) => destroyed += 1,
                Err(e) => warn!(error = %e, "teardown task failed"),
            }
        }
        destroyed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use teepool_provision::testing::MockBackend;

    fn policy() -> PoolPolicy {
        PoolPolicy {
            min_warm_nodes: 1,
            max_nodes: 3,
            cold_start_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_millis(1000),
            scale_up_queue_threshold: 1,
            scale_down_idle_threshold: Duration::from_secs(60),
            tick_interval: Duration::from_secs(10),
            ..PoolPolicy::default()
        }
    }

    fn template() -> WorkerTemplate {
        WorkerTemplate::new("default", "worker:test")
    }

    fn setup(policy: PoolPolicy, delay: Duration) -> (Autoscaler, Arc<MockBackend>) {
        let backend = Arc::new(MockBackend::new(delay));
        let scaler = Autoscaler::new(
            Arc::new(NodePoolRegistry::new()),
            AdmissionQueue::new(),
            backend.clone(),
            policy,
            vec![template()],
        );
        (scaler, backend)
    }

    fn warm(registry: &NodePoolRegistry) -> WorkerId {
        let w = registry.insert_starting(&template());
        registry.mark_warm(w.id, "http://w:1", None);
        w.id
    }

    /// Let spawned tasks run.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn far() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    // ── Plan ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn plan_empty_pool_fills_floor() {
        let plan = TickPlan::evaluate(&[], 0, &policy(), Instant::now());
        assert_eq!(plan.launch, Some(LaunchReason::WarmFloor));
    }

    #[tokio::test(start_paused = true)]
    async fn plan_counts_starting_toward_floor() {
        let registry = NodePoolRegistry::new();
        registry.insert_starting(&template());
        let plan = TickPlan::evaluate(&registry.snapshot(), 0, &policy(), Instant::now());
        assert_eq!(plan.launch, None);
    }

    #[tokio::test(start_paused = true)]
    async fn plan_backlog_waits_for_starting_worker() {
        let registry = NodePoolRegistry::new();
        warm(&registry);
        registry.insert_starting(&template());
        let plan = TickPlan::evaluate(&registry.snapshot(), 5, &policy(), Instant::now());
        assert_eq!(plan.launch, None);

        let registry = NodePoolRegistry::new();
        warm(&registry);
        let plan = TickPlan::evaluate(&registry.snapshot(), 5, &policy(), Instant::now());
        assert_eq!(plan.launch, Some(LaunchReason::Backlog));
    }

    #[tokio::test(start_paused = true)]
    async fn plan_never_launches_at_max_nodes() {
        let registry = NodePoolRegistry::new();
        let policy = PoolPolicy {
            min_warm_nodes: 5,
            max_nodes: 2,
            ..policy()
        };
        warm(&registry);
        warm(&registry);
        let plan = TickPlan::evaluate(&registry.snapshot(), 10, &policy, Instant::now());
        assert_eq!(plan.launch, None);
    }

    #[tokio::test(start_paused = true)]
    async fn plan_demotes_idle_hot_workers() {
        let registry = NodePoolRegistry::new();
        let id = warm(&registry);
        registry.assign(id);
        tokio::time::advance(Duration::from_millis(400)).await;

        let plan = TickPlan::evaluate(&registry.snapshot(), 0, &policy(), Instant::now());
        assert_eq!(plan.demote, vec![id]);
        assert!(plan.drain.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn plan_scale_down_keeps_minimum_and_prefers_longest_idle() {
        let registry = NodePoolRegistry::new();
        let older = warm(&registry);
        tokio::time::advance(Duration::from_secs(5)).await;
        let newer = warm(&registry);
        let third = warm(&registry);
        registry.assign(third);
        tokio::time::advance(Duration::from_secs(61)).await;
        registry.record_outcome(third, true);

        let plan = TickPlan::evaluate(&registry.snapshot(), 0, &policy(), Instant::now());
        assert_eq!(plan.drain, vec![older, newer]);
        assert_eq!(plan.launch, None);
    }

    #[tokio::test(start_paused = true)]
    async fn plan_eviction_is_opt_in() {
        let registry = NodePoolRegistry::new();
        let id = warm(&registry);
        for _ in 0..10 {
            registry.record_outcome(id, false);
        }

        let plan = TickPlan::evaluate(&registry.snapshot(), 0, &policy(), Instant::now());
        assert!(plan.evict.is_empty());

        let zero = PoolPolicy {
            error_eviction_threshold: Some(0),
            ..policy()
        };
        let plan = TickPlan::evaluate(&registry.snapshot(), 0, &zero, Instant::now());
        assert!(plan.evict.is_empty());

        let evicting = PoolPolicy {
            error_eviction_threshold: Some(10),
            ..policy()
        };
        let plan = TickPlan::evaluate(&registry.snapshot(), 0, &evicting, Instant::now());
        assert_eq!(plan.evict, vec![id]);
        // The evicted worker leaves a deficit.
        assert_eq!(plan.launch, Some(LaunchReason::WarmFloor));
    }

    // ── Tick ───────────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn no_stampede_one_creation_in_flight() {
        let (scaler, backend) = setup(
            PoolPolicy {
                min_warm_nodes: 3,
                max_nodes: 5,
                ..policy()
            },
            Duration::from_secs(600),
        );

        assert!(scaler.tick().launched.is_some());
        settle().await;
        for _ in 0..3 {
            assert_eq!(scaler.tick().launched, None);
            settle().await;
            assert_eq!(scaler.registry.counts().starting, 1);
        }
        assert_eq!(backend.creates(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn floor_fills_one_creation_at_a_time() {
        let (scaler, backend) = setup(
            PoolPolicy {
                min_warm_nodes: 3,
                max_nodes: 5,
                ..policy()
            },
            Duration::from_secs(5),
        );

        for expected in 1..=3 {
            assert!(scaler.tick().launched.is_some());
            settle().await;
            assert_eq!(backend.creates(), expected);
            assert_eq!(scaler.registry.counts().starting, 1);

            tokio::time::sleep(Duration::from_secs(6)).await;
            assert_eq!(scaler.registry.counts().starting, 0);
            assert_eq!(scaler.registry.counts().serving(), expected);
        }
        assert_eq!(scaler.tick().launched, None);
        assert_eq!(backend.creates(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn tick_drains_queue_after_demotion() {
        let (scaler, _backend) = setup(policy(), Duration::from_secs(1));
        let id = warm(&scaler.registry);
        scaler.registry.assign(id);
        tokio::time::advance(Duration::from_millis(400)).await;

        // Queued without a drain, as if it arrived while the worker was busy.
        let admission = scaler.queue.enqueue(Some("default".to_string()), far(), None);
        let report = scaler.tick();
        assert_eq!(report.demoted, 1);
        assert_eq!(scaler.queue.depth(), 0);
        assert_eq!(admission.wait().await.unwrap().worker_id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn scenario_b_scale_down_respects_minimum() {
        let (scaler, backend) = setup(policy(), Duration::from_millis(100));
        warm(&scaler.registry);
        warm(&scaler.registry);
        tokio::time::advance(Duration::from_secs(61)).await;

        let report = scaler.tick();
        assert_eq!(report.drained, 1);
        settle().await;

        assert_eq!(backend.destroyed().len(), 1);
        assert_eq!(scaler.registry.counts().serving(), 1);
        assert_eq!(scaler.registry.len(), 1);

        // A second tick leaves the last warm worker alone.
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(scaler.tick().drained, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_provision_drains_queue() {
        let (scaler, _backend) = setup(policy(), Duration::from_secs(2));
        let capacity = scaler.ensure_capacity(None).unwrap();
        let Capacity::Launched(id) = capacity else {
            panic!("expected a launch, got {capacity:?}");
        };
        let admission = scaler.queue.enqueue(None, far(), capacity.attempt());

        let assignment = admission.wait().await.unwrap();
        assert_eq!(assignment.worker_id, id);
        assert_eq!(assignment.endpoint, MockBackend::endpoint_for(id));

        let worker = scaler.registry.get(id).unwrap();
        assert_eq!(worker.status, WorkerStatus::Hot);
        assert_eq!(worker.cold_start_duration_ms, Some(2000));
        assert_eq!(worker.tee.attestation_id.as_deref(), Some("mock-att-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn ensure_capacity_joins_starting_worker() {
        let (scaler, backend) = setup(policy(), Duration::from_secs(2));
        let first = scaler.ensure_capacity(Some("default")).unwrap();
        let second = scaler.ensure_capacity(Some("default")).unwrap();

        assert!(matches!(first, Capacity::Launched(_)));
        assert_eq!(second, Capacity::Joined(first.attempt().unwrap()));
        settle().await;
        assert_eq!(backend.creates(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_capability_is_rejected() {
        let (scaler, _backend) = setup(policy(), Duration::from_secs(2));
        assert_eq!(
            scaler.ensure_capacity(Some("gpu")).unwrap_err(),
            PoolError::UnknownCapability("gpu".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_provision_rejects_only_dependents() {
        let (scaler, backend) = setup(policy(), Duration::from_secs(2));
        backend.set_fail_create(true);

        let capacity = scaler.ensure_capacity(None).unwrap();
        let id = capacity.attempt().unwrap();
        let dependent = scaler.queue.enqueue(None, far(), Some(id));
        let bystander = scaler.queue.enqueue(None, far(), None);

        let err = dependent.wait().await.unwrap_err();
        assert!(matches!(err, PoolError::ProvisioningFailure { worker_id, .. } if worker_id == id));
        assert!(scaler.registry.get(id).is_none());
        assert_eq!(scaler.queue.depth(), 1);
        drop(bystander);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_head_unblocks_request_for_serving_worker() {
        let backend = Arc::new(MockBackend::new(Duration::from_secs(2)));
        let scaler = Autoscaler::new(
            Arc::new(NodePoolRegistry::new()),
            AdmissionQueue::new(),
            backend.clone(),
            policy(),
            vec![WorkerTemplate::new("a", "worker:a"), WorkerTemplate::new("b", "worker:b")],
        );

        let a = scaler.ensure_capacity(Some("a")).unwrap();
        let first = scaler.queue.enqueue(Some("a".to_string()), far(), a.attempt());
        settle().await;

        backend.set_delay(Duration::from_secs(1));
        let b = scaler.ensure_capacity(Some("b")).unwrap();
        let second = scaler.queue.enqueue(Some("b".to_string()), far(), b.attempt());

        // `b` turns warm at 1s but sits behind the `a` request.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(scaler.queue.depth(), 2);
        backend.set_fail_create(true);

        assert!(matches!(
            first.wait().await,
            Err(PoolError::ProvisioningFailure { .. })
        ));
        let assignment = second.wait().await.unwrap();
        assert_eq!(Some(assignment.worker_id), b.attempt());
        assert_eq!(scaler.queue.depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cold_start_timeout_fails_attempt_and_tears_down() {
        let (scaler, backend) = setup(
            PoolPolicy {
                cold_start_timeout: Duration::from_secs(5),
                ..policy()
            },
            Duration::from_secs(60),
        );

        let id = scaler.ensure_capacity(None).unwrap().attempt().unwrap();
        let dependent = scaler.queue.enqueue(None, far(), Some(id));

        let err = dependent.wait().await.unwrap_err();
        match err {
            PoolError::ProvisioningFailure { worker_id, reason } => {
                assert_eq!(worker_id, id);
                assert!(reason.contains("did not finish"), "reason: {reason}");
            }
            other => panic!("unexpected error {other:?}"),
        }
        settle().await;
        assert!(scaler.registry.is_empty());
        assert_eq!(backend.destroyed(), vec![id]);
    }

    #[tokio::test(start_paused = true)]
    async fn backlog_trigger_launches_past_starting_worker() {
        let (scaler, backend) = setup(policy(), Duration::from_secs(30));
        scaler.ensure_capacity(None).unwrap();
        let extra = scaler.scale_up_for_backlog(None);

        assert!(extra.is_some());
        settle().await;
        assert_eq!(backend.creates(), 2);
        assert_eq!(scaler.registry.counts().starting, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn backlog_trigger_is_bounded_by_max_nodes() {
        let (scaler, _backend) = setup(
            PoolPolicy {
                max_nodes: 1,
                ..policy()
            },
            Duration::from_secs(30),
        );
        scaler.ensure_capacity(None).unwrap();
        assert_eq!(scaler.scale_up_for_backlog(None), None);
        assert_eq!(scaler.registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_creation_after_removal_is_destroyed() {
        let (scaler, backend) = setup(policy(), Duration::from_secs(10));
        let id = scaler.ensure_capacity(None).unwrap().attempt().unwrap();
        settle().await;

        // Discard the starting record, as shutdown does.
        assert_eq!(scaler.drain_all().await, 0);
        assert!(scaler.registry.is_empty());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(backend.destroyed(), vec![id]);
        assert_eq!(backend.live(), 0);
        assert!(scaler.registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_all_destroys_serving_workers() {
        let (scaler, backend) = setup(policy(), Duration::from_secs(1));
        let a = warm(&scaler.registry);
        let b = warm(&scaler.registry);
        scaler.registry.assign(b);

        assert_eq!(scaler.drain_all().await, 2);
        assert!(scaler.registry.is_empty());
        let mut destroyed = backend.destroyed();
        destroyed.sort();
        assert_eq!(destroyed, vec![a, b]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_teardown_still_removes_worker() {
        let (scaler, backend) = setup(policy(), Duration::from_secs(1));
        backend.set_fail_destroy(true);
        warm(&scaler.registry);
        warm(&scaler.registry);
        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(scaler.tick().drained, 1);
        settle().await;
        assert_eq!(scaler.registry.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn run_fills_floor_and_stops_on_shutdown() {
        let (scaler, backend) = setup(policy(), Duration::from_secs(2));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scaler.clone().run(rx));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(backend.creates(), 1);
        assert_eq!(scaler.registry.counts().serving(), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}

//! NodePoolRegistry — the canonical table of workers.
//!
//! Workers live in a `BTreeMap` keyed by a monotonically increasing id, so
//! iteration order is creation order and "first available" is stable.
//! Every method takes the table lock once, does its read-then-write
//! atomically, and returns copies.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::time::Instant;
use tracing::{debug, error, info};

use teepool_core::{WorkerId, WorkerTemplate};

use crate::types::{Worker, WorkerStatus};

/// Worker counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub cold: usize,
    pub starting: usize,
    pub warm: usize,
    pub hot: usize,
    pub draining: usize,
    pub stopped: usize,
    pub error: usize,
}

impl StatusCounts {
    pub fn from_workers<'a>(workers: impl IntoIterator<Item = &'a Worker>) -> Self {
        let mut counts = Self::default();
        for w in workers {
            match w.status {
                WorkerStatus::Cold => counts.cold += 1,
                WorkerStatus::Starting => counts.starting += 1,
                WorkerStatus::Warm => counts.warm += 1,
                WorkerStatus::Hot => counts.hot += 1,
                WorkerStatus::Draining => counts.draining += 1,
                WorkerStatus::Stopped => counts.stopped += 1,
                WorkerStatus::Error => counts.error += 1,
            }
        }
        counts
    }

    /// Workers able to take traffic right now.
    pub fn serving(&self) -> usize {
        self.warm + self.hot
    }

    pub fn total(&self) -> usize {
        self.cold + self.starting + self.warm + self.hot + self.draining + self.stopped + self.error
    }
}

/// The lock-protected table. Only reachable through the registry, and
/// from the admission queue's drain, which needs claim and pop under
/// both locks.
pub(crate) struct RegistryTable {
    workers: BTreeMap<WorkerId, Worker>,
    next_id: u64,
    /// Assignments over the registry's lifetime, including removed workers.
    total_assigned: u64,
}

impl RegistryTable {
    fn find_available(&self, capability: Option<&str>) -> Option<WorkerId> {
        let mut candidates = self
            .workers
            .values()
            .filter(|w| w.status.is_serving() && w.matches(capability));
        // Idle workers first, then busy ones; creation order within each.
        let first = candidates.next()?;
        if first.status == WorkerStatus::Warm {
            return Some(first.id);
        }
        candidates
            .find(|w| w.status == WorkerStatus::Warm)
            .map(|w| w.id)
            .or(Some(first.id))
    }

    fn assign(&mut self, id: WorkerId, now: Instant) -> bool {
        let Some(worker) = self.workers.get_mut(&id) else {
            debug!(worker_id = %id, "assign: worker no longer exists");
            return false;
        };
        if !worker.status.is_serving() {
            debug!(worker_id = %id, status = worker.status.as_str(), "assign: worker not serving");
            return false;
        }
        worker.status = WorkerStatus::Hot;
        worker.last_activity_at = now;
        worker.requests_served += 1;
        self.total_assigned += 1;
        true
    }

    /// Find a serving worker and assign it in one step.
    pub(crate) fn claim(&mut self, capability: Option<&str>, now: Instant) -> Option<Worker> {
        let id = self.find_available(capability)?;
        self.assign(id, now);
        self.workers.get(&id).cloned()
    }

    fn transition(&mut self, id: WorkerId, to: WorkerStatus) -> Option<&mut Worker> {
        let Some(worker) = self.workers.get_mut(&id) else {
            debug!(worker_id = %id, to = to.as_str(), "transition: worker no longer exists");
            return None;
        };
        if !worker.status.can_transition_to(to) {
            error!(
                worker_id = %id,
                from = worker.status.as_str(),
                to = to.as_str(),
                "illegal worker transition ignored"
            );
            return None;
        }
        worker.status = to;
        Some(worker)
    }
}

/// Outcome of [`NodePoolRegistry::reserve_unless_starting`].
#[derive(Debug, Clone)]
pub enum Reservation {
    /// A matching worker is already starting; wait on it.
    InFlight(WorkerId),
    /// A new `starting` record was inserted; the caller must launch it.
    Reserved(Worker),
    /// The pool is at `max_nodes`.
    AtCapacity,
}

/// Thread-safe registry of every worker the orchestrator knows about.
pub struct NodePoolRegistry {
    table: Mutex<RegistryTable>,
}

impl NodePoolRegistry {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(RegistryTable {
                workers: BTreeMap::new(),
                next_id: 1,
                total_assigned: 0,
            }),
        }
    }

    pub(crate) fn lock_table(&self) -> MutexGuard<'_, RegistryTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Routing ────────────────────────────────────────────────────

    /// First serving worker for `capability`, idle ones preferred. Read only.
    pub fn find_available(&self, capability: Option<&str>) -> Option<Worker> {
        let table = self.lock_table();
        let id = table.find_available(capability)?;
        table.workers.get(&id).cloned()
    }

    /// Mark a worker `hot`, refresh its activity, and count the request.
    ///
    /// Returns false if the worker is gone or no longer serving; the
    /// caller must search again.
    pub fn assign(&self, id: WorkerId) -> bool {
        self.lock_table().assign(id, Instant::now())
    }

    /// Atomic `find_available` + `assign`, so two callers can never act on
    /// a stale lookup.
    pub fn claim(&self, capability: Option<&str>) -> Option<Worker> {
        self.lock_table().claim(capability, Instant::now())
    }

    /// Record the outcome of a request served by a worker.
    ///
    /// Failures bump `error_count`; the worker stays in the pool either way.
    pub fn record_outcome(&self, id: WorkerId, success: bool) -> bool {
        let mut table = self.lock_table();
        let Some(worker) = table.workers.get_mut(&id) else {
            return false;
        };
        worker.last_activity_at = Instant::now();
        if !success {
            worker.error_count += 1;
        }
        true
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Create a `starting` record for a worker launched from `template`.
    pub fn insert_starting(&self, template: &WorkerTemplate) -> Worker {
        let mut table = self.lock_table();
        Self::insert_locked(&mut table, template)
    }

    /// Like [`insert_starting`](Self::insert_starting), but only while the
    /// pool holds fewer than `max_nodes` workers. The check and the insert
    /// share one lock acquisition.
    pub fn reserve_starting(&self, template: &WorkerTemplate, max_nodes: usize) -> Option<Worker> {
        let mut table = self.lock_table();
        if table.workers.len() >= max_nodes {
            debug!(max_nodes, "pool at capacity, no slot reserved");
            return None;
        }
        Some(Self::insert_locked(&mut table, template))
    }

    /// Join a `starting` worker matching `capability`, or reserve a new
    /// one from `template` if none is in flight and the pool has room.
    ///
    /// Two concurrent callers never both reserve for the same capability.
    pub fn reserve_unless_starting(
        &self,
        capability: Option<&str>,
        template: &WorkerTemplate,
        max_nodes: usize,
    ) -> Reservation {
        let mut table = self.lock_table();
        if let Some(w) = table
            .workers
            .values()
            .find(|w| w.status == WorkerStatus::Starting && w.matches(capability))
        {
            return Reservation::InFlight(w.id);
        }
        if table.workers.len() >= max_nodes {
            return Reservation::AtCapacity;
        }
        Reservation::Reserved(Self::insert_locked(&mut table, template))
    }

    fn insert_locked(table: &mut RegistryTable, template: &WorkerTemplate) -> Worker {
        let id = WorkerId::new(table.next_id);
        table.next_id += 1;
        let now = Instant::now();
        let worker = Worker {
            id,
            capability: template.capability.clone(),
            endpoint: None,
            status: WorkerStatus::Starting,
            tee: template.tee_descriptor(),
            created_at_ms: epoch_millis(),
            started_at: now,
            last_activity_at: now,
            cold_start_duration_ms: None,
            requests_served: 0,
            error_count: 0,
        };
        table.workers.insert(id, worker.clone());
        info!(worker_id = %id, capability = %template.capability, "worker starting");
        worker
    }

    /// `starting → warm`: record the endpoint, attestation id, and cold start time.
    pub fn mark_warm(&self, id: WorkerId, endpoint: &str, attestation_id: Option<String>) -> bool {
        let now = Instant::now();
        let mut table = self.lock_table();
        let Some(worker) = table.transition(id, WorkerStatus::Warm) else {
            return false;
        };
        let cold_start = now.saturating_duration_since(worker.started_at);
        worker.endpoint = Some(endpoint.to_string());
        worker.cold_start_duration_ms = Some(cold_start.as_millis() as u64);
        worker.last_activity_at = now;
        if attestation_id.is_some() {
            worker.tee.attestation_id = attestation_id;
        }
        info!(
            worker_id = %id,
            %endpoint,
            cold_start_ms = cold_start.as_millis() as u64,
            "worker warm"
        );
        true
    }

    /// `starting → error`.
    pub fn mark_error(&self, id: WorkerId) -> bool {
        let applied = self.lock_table().transition(id, WorkerStatus::Error).is_some();
        if applied {
            info!(worker_id = %id, "worker failed to start");
        }
        applied
    }

    /// `warm|hot → draining`.
    pub fn mark_draining(&self, id: WorkerId) -> bool {
        let applied = self.lock_table().transition(id, WorkerStatus::Draining).is_some();
        if applied {
            info!(worker_id = %id, "worker draining");
        }
        applied
    }

    /// `draining → stopped`, once the backend confirmed teardown.
    pub fn mark_stopped(&self, id: WorkerId) -> bool {
        self.lock_table().transition(id, WorkerStatus::Stopped).is_some()
    }

    /// Drop a `stopped` or `error` worker from the table.
    pub fn remove(&self, id: WorkerId) -> bool {
        let mut table = self.lock_table();
        match table.workers.get(&id).map(|w| w.status) {
            None => false,
            Some(WorkerStatus::Stopped | WorkerStatus::Error) => {
                table.workers.remove(&id);
                debug!(worker_id = %id, "worker removed");
                true
            }
            Some(status) => {
                error!(worker_id = %id, status = status.as_str(), "refusing to remove live worker");
                false
            }
        }
    }

    /// `hot → warm` if the worker has still been idle for at least `min_idle`.
    ///
    /// An assignment that landed after the caller's snapshot wins.
    pub fn demote_if_idle(&self, id: WorkerId, min_idle: Duration) -> bool {
        let now = Instant::now();
        let mut table = self.lock_table();
        match table.workers.get(&id) {
            Some(w) if w.status == WorkerStatus::Hot && w.idle_for(now) > min_idle => {}
            _ => return false,
        }
        let applied = table.transition(id, WorkerStatus::Warm).is_some();
        if applied {
            debug!(worker_id = %id, "idle worker demoted to warm");
        }
        applied
    }

    /// `warm → draining` if the worker is still warm and idle for at least
    /// `min_idle`.
    pub fn drain_if_idle(&self, id: WorkerId, min_idle: Duration) -> bool {
        let now = Instant::now();
        let mut table = self.lock_table();
        match table.workers.get(&id) {
            Some(w) if w.status == WorkerStatus::Warm && w.idle_for(now) > min_idle => {}
            _ => return false,
        }
        let applied = table.transition(id, WorkerStatus::Draining).is_some();
        if applied {
            info!(worker_id = %id, "idle worker selected for scale-down");
        }
        applied
    }

    // ── Reads ──────────────────────────────────────────────────────

    pub fn get(&self, id: WorkerId) -> Option<Worker> {
        self.lock_table().workers.get(&id).cloned()
    }

    /// Copies of every worker, in creation order.
    pub fn snapshot(&self) -> Vec<Worker> {
        self.lock_table().workers.values().cloned().collect()
    }

    pub fn counts(&self) -> StatusCounts {
        StatusCounts::from_workers(self.lock_table().workers.values())
    }

    /// Number of tracked workers in any status.
    pub fn len(&self) -> usize {
        self.lock_table().workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Requests assigned over the registry's lifetime.
    pub fn total_requests(&self) -> u64 {
        self.lock_table().total_assigned
    }
}

impl Default for NodePoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

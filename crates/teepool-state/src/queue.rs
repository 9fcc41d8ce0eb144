//! AdmissionQueue — requests waiting for a warm worker.
//!
//! Each entry owns the sending half of a oneshot channel. Whoever removes
//! the entry from the queue (drain, deadline timer, rejection) is the only
//! party that can resolve it, so resolution happens at most once without
//! any extra bookkeeping.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::debug;

use teepool_core::{Capability, PoolError, PoolResult, RequestId, WorkerId};

use crate::registry::NodePoolRegistry;

/// A successful admission: the worker a request was routed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub request_id: RequestId,
    pub worker_id: WorkerId,
    pub endpoint: String,
    /// Time spent in the queue.
    pub waited: Duration,
}

type Resolution = PoolResult<Assignment>;

struct PendingRequest {
    id: RequestId,
    capability: Option<Capability>,
    enqueued_at: Instant,
    /// The creation attempt this request is waiting on, if any.
    attempt: Option<WorkerId>,
    tx: oneshot::Sender<Resolution>,
    timer: Option<AbortHandle>,
}

impl PendingRequest {
    fn resolve(self, result: Resolution) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        if self.tx.send(result).is_err() {
            debug!(request_id = %self.id, "caller went away before resolution");
        }
    }
}

struct QueueState {
    entries: VecDeque<PendingRequest>,
    next_id: u64,
}

impl QueueState {
    fn take(&mut self, id: RequestId) -> Option<PendingRequest> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        self.entries.remove(pos)
    }
}

/// Handle returned by [`AdmissionQueue::enqueue`]; resolves exactly once.
#[derive(Debug)]
pub struct Admission {
    id: RequestId,
    rx: oneshot::Receiver<Resolution>,
}

impl Admission {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the request to be assigned, rejected, or timed out.
    pub async fn wait(self) -> PoolResult<Assignment> {
        self.rx.await.unwrap_or(Err(PoolError::Shutdown))
    }
}

/// FIFO of requests waiting for capacity. Cheap to clone.
#[derive(Clone)]
pub struct AdmissionQueue {
    state: Arc<Mutex<QueueState>>,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(QueueState {
                entries: VecDeque::new(),
                next_id: 1,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a request to the tail of the queue.
    ///
    /// A timer removes the entry and resolves it with [`PoolError::Timeout`]
    /// at `deadline`; resolving it first cancels the timer. Must be called
    /// from within a tokio runtime.
    pub fn enqueue(
        &self,
        capability: Option<Capability>,
        deadline: Instant,
        attempt: Option<WorkerId>,
    ) -> Admission {
        let (tx, rx) = oneshot::channel();
        let id = {
            let mut state = self.lock();
            let id = RequestId(state.next_id);
            state.next_id += 1;
            state.entries.push_back(PendingRequest {
                id,
                capability,
                enqueued_at: Instant::now(),
                attempt,
                tx,
                timer: None,
            });
            id
        };

        let queue = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            queue.expire(id);
        });

        // The entry may already be gone if a drain ran in between.
        match self.lock().entries.iter_mut().find(|e| e.id == id) {
            Some(entry) => entry.timer = Some(timer.abort_handle()),
            None => timer.abort(),
        }

        debug!(request_id = %id, attempt = ?attempt, "request queued");
        Admission { id, rx }
    }

    /// Resolve `id` with a timeout if it is still queued.
    fn expire(&self, id: RequestId) -> bool {
        let Some(entry) = self.lock().take(id) else {
            return false;
        };
        let waited = entry.enqueued_at.elapsed();
        debug!(request_id = %id, waited_ms = waited.as_millis() as u64, "queued request timed out");
        let worker_id = entry.attempt;
        entry.resolve(Err(PoolError::Timeout {
            waited_ms: waited.as_millis() as u64,
            worker_id,
        }));
        true
    }

    /// Assign queued requests to serving workers, strictly in arrival order.
    ///
    /// Stops at the first request no worker can take. Each pop re-checks the
    /// registry under its lock, so a worker drained since the caller's
    /// notification is never handed out. Returns the number assigned.
    pub fn drain(&self, registry: &NodePoolRegistry) -> usize {
        let now = Instant::now();
        let mut assigned = 0;

        let mut table = registry.lock_table();
        let mut state = self.lock();
        while let Some(head) = state.entries.front() {
            if head.tx.is_closed() {
                if let Some(abandoned) = state.entries.pop_front() {
                    debug!(request_id = %abandoned.id, "dropping abandoned request");
                    abandoned.resolve(Err(PoolError::Shutdown));
                }
                continue;
            }
            let Some(worker) = table.claim(head.capability.as_deref(), now) else {
                break;
            };
            let Some(entry) = state.entries.pop_front() else {
                break;
            };
            let assignment = Assignment {
                request_id: entry.id,
                worker_id: worker.id,
                endpoint: worker.endpoint.clone().unwrap_or_default(),
                waited: now.saturating_duration_since(entry.enqueued_at),
            };
            debug!(
                request_id = %entry.id,
                worker_id = %worker.id,
                waited_ms = assignment.waited.as_millis() as u64,
                "queued request assigned"
            );
            // Resolved under the lock so resolution order follows queue order.
            entry.resolve(Ok(assignment));
            assigned += 1;
        }
        assigned
    }

    /// Reject every request waiting on the creation attempt `attempt`.
    pub fn reject_dependents(&self, attempt: WorkerId, error: &PoolError) -> usize {
        let rejected = {
            let mut state = self.lock();
            let (dependents, rest): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut state.entries)
                .into_iter()
                .partition(|e| e.attempt == Some(attempt));
            state.entries = rest;
            dependents
        };
        let count = rejected.len();
        for entry in rejected {
            entry.resolve(Err(error.clone()));
        }
        if count > 0 {
            debug!(worker_id = %attempt, count, "rejected requests of failed attempt");
        }
        count
    }

    /// Reject everything still queued (shutdown).
    pub fn reject_all(&self, error: &PoolError) -> usize {
        let entries = std::mem::take(&mut self.lock().entries);
        let count = entries.len();
        for entry in entries {
            entry.resolve(Err(error.clone()));
        }
        count
    }

    /// Current queue length.
    pub fn depth(&self) -> usize {
        self.lock().entries.len()
    }

    /// Capability requested by the oldest queued request.
    pub fn head_capability(&self) -> Option<Option<Capability>> {
        self.lock().entries.front().map(|e| e.capability.clone())
    }
}

impl Default for AdmissionQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use teepool_core::WorkerTemplate;

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    fn add_warm(registry: &NodePoolRegistry, capability: &str, endpoint: &str) -> WorkerId {
        let w = registry.insert_starting(&WorkerTemplate::new(capability, "img"));
        registry.mark_warm(w.id, endpoint, None);
        w.id
    }

    #[tokio::test]
    async fn drain_with_no_workers_leaves_queue_intact() {
        let registry = NodePoolRegistry::new();
        let queue = AdmissionQueue::new();
        let _a = queue.enqueue(None, far_deadline(), None);
        assert_eq!(queue.drain(&registry), 0);
        assert_eq!(queue.depth(), 1);
    }

    #[tokio::test]
    async fn drain_resolves_in_fifo_order() {
        let registry = NodePoolRegistry::new();
        let queue = AdmissionQueue::new();
        let first = queue.enqueue(None, far_deadline(), None);
        let second = queue.enqueue(None, far_deadline(), None);
        let (first_id, second_id) = (first.id(), second.id());

        let w = add_warm(&registry, "default", "10.0.0.1:8080");
        assert_eq!(queue.drain(&registry), 2);
        assert_eq!(queue.depth(), 0);

        let a = first.wait().await.unwrap();
        let b = second.wait().await.unwrap();
        assert_eq!(a.request_id, first_id);
        assert_eq!(b.request_id, second_id);
        assert_eq!(a.worker_id, w);
        assert_eq!(a.endpoint, "10.0.0.1:8080");
        assert_eq!(registry.get(w).unwrap().requests_served, 2);
    }

    #[tokio::test]
    async fn drain_stops_at_unmatched_head() {
        let registry = NodePoolRegistry::new();
        let queue = AdmissionQueue::new();
        let _vision = queue.enqueue(Some("vision".into()), far_deadline(), None);
        let llm = queue.enqueue(Some("llm".into()), far_deadline(), None);
        add_warm(&registry, "llm", "10.0.0.2:8080");

        // Strict FIFO: the llm request waits behind the vision one.
        assert_eq!(queue.drain(&registry), 0);
        assert_eq!(queue.depth(), 2);
        drop(llm);
    }

    #[tokio::test]
    async fn drain_rechecks_worker_status() {
        let registry = NodePoolRegistry::new();
        let queue = AdmissionQueue::new();
        let pending = queue.enqueue(None, Instant::now() + Duration::from_millis(50), None);

        let id = add_warm(&registry, "default", "10.0.0.3:8080");
        // Scale-down wins the race before the drain runs.
        registry.mark_draining(id);
        assert_eq!(queue.drain(&registry), 0);

        assert!(matches!(pending.wait().await, Err(PoolError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_resolves_with_timeout() {
        let queue = AdmissionQueue::new();
        let attempt = WorkerId::new(4);
        let pending = queue.enqueue(None, Instant::now() + Duration::from_secs(2), Some(attempt));

        match pending.wait().await {
            Err(PoolError::Timeout { waited_ms, worker_id }) => {
                assert!(waited_ms >= 2000);
                assert_eq!(worker_id, Some(attempt));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn resolution_cancels_the_timer() {
        let registry = NodePoolRegistry::new();
        let queue = AdmissionQueue::new();
        let pending = queue.enqueue(None, Instant::now() + Duration::from_secs(1), None);
        add_warm(&registry, "default", "10.0.0.4:8080");
        assert_eq!(queue.drain(&registry), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        // Still the assignment, not a late timeout.
        assert!(pending.wait().await.is_ok());
        assert!(!queue.expire(RequestId(1)));
    }

    #[tokio::test]
    async fn reject_dependents_only_hits_that_attempt() {
        let queue = AdmissionQueue::new();
        let a = queue.enqueue(None, far_deadline(), Some(WorkerId::new(1)));
        let b = queue.enqueue(None, far_deadline(), Some(WorkerId::new(2)));
        let c = queue.enqueue(None, far_deadline(), None);

        let err = PoolError::ProvisioningFailure {
            worker_id: WorkerId::new(1),
            reason: "boom".into(),
        };
        assert_eq!(queue.reject_dependents(WorkerId::new(1), &err), 1);
        assert_eq!(a.wait().await.unwrap_err(), err);
        assert_eq!(queue.depth(), 2);
        drop((b, c));
    }

    #[tokio::test]
    async fn reject_all_resolves_everything() {
        let queue = AdmissionQueue::new();
        let a = queue.enqueue(None, far_deadline(), None);
        let b = queue.enqueue(Some("llm".into()), far_deadline(), None);
        assert_eq!(queue.reject_all(&PoolError::Shutdown), 2);
        assert_eq!(a.wait().await.unwrap_err(), PoolError::Shutdown);
        assert_eq!(b.wait().await.unwrap_err(), PoolError::Shutdown);
        assert_eq!(queue.depth(), 0);
    }

    #[tokio::test]
    async fn abandoned_requests_are_skipped() {
        let registry = NodePoolRegistry::new();
        let queue = AdmissionQueue::new();
        drop(queue.enqueue(None, far_deadline(), None));
        let live = queue.enqueue(None, far_deadline(), None);
        let w = add_warm(&registry, "default", "10.0.0.5:8080");

        assert_eq!(queue.drain(&registry), 1);
        assert_eq!(live.wait().await.unwrap().worker_id, w);
        // The abandoned request did not consume an assignment.
        assert_eq!(registry.get(w).unwrap().requests_served, 1);
    }

    #[tokio::test]
    async fn head_capability_reports_oldest() {
        let queue = AdmissionQueue::new();
        assert_eq!(queue.head_capability(), None);
        let _a = queue.enqueue(Some("llm".into()), far_deadline(), None);
        let _b = queue.enqueue(None, far_deadline(), None);
        assert_eq!(queue.head_capability(), Some(Some("llm".to_string())));
    }
}

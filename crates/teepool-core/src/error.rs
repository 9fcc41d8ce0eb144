//! User-visible failure taxonomy.

use std::time::Duration;

use thiserror::Error;

use crate::types::WorkerId;

/// Result type alias for orchestrator operations.
pub type PoolResult<T> = Result<T, PoolError>;

/// Failures surfaced to callers of the orchestrator.
///
/// Registry and queue internals never produce these for "not found";
/// they report `bool`/`Option` outcomes instead.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    /// A backend create call failed or the worker never became healthy.
    #[error("provisioning failed for worker {worker_id}: {reason}")]
    ProvisioningFailure { worker_id: WorkerId, reason: String },

    /// The pool is at `max_nodes` and the queue is at its bound.
    #[error("capacity exceeded: {nodes}/{max_nodes} nodes busy, {queue_depth} requests queued")]
    CapacityExceeded {
        nodes: usize,
        max_nodes: usize,
        queue_depth: usize,
    },

    /// A queued request's deadline elapsed before it was assigned.
    #[error("timed out after {waited_ms}ms waiting for a worker")]
    Timeout {
        waited_ms: u64,
        /// The creation attempt the request was waiting on, if any.
        worker_id: Option<WorkerId>,
    },

    /// Startup probes kept failing past the cold start timeout.
    #[error("health check failed for worker {worker_id}: {reason}")]
    HealthCheckFailure { worker_id: WorkerId, reason: String },

    #[error("orchestrator is shutting down")]
    Shutdown,

    #[error("no worker template for capability: {0}")]
    UnknownCapability(String),
}

impl PoolError {
    /// Suggested delay before the caller retries, if retrying makes sense.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PoolError::Timeout { .. } => Some(Duration::from_secs(5)),
            PoolError::CapacityExceeded { .. } => Some(Duration::from_secs(10)),
            PoolError::ProvisioningFailure { .. } | PoolError::HealthCheckFailure { .. } => {
                Some(Duration::from_secs(30))
            }
            PoolError::Shutdown | PoolError::UnknownCapability(_) => None,
        }
    }

    /// Short machine-readable kind, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            PoolError::ProvisioningFailure { .. } => "provisioning_failure",
            PoolError::CapacityExceeded { .. } => "capacity_exceeded",
            PoolError::Timeout { .. } => "timeout",
            PoolError::HealthCheckFailure { .. } => "health_check_failure",
            PoolError::Shutdown => "shutdown",
            PoolError::UnknownCapability(_) => "unknown_capability",
        }
    }
}

//! The provisioning strategy interface.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

use teepool_core::{WorkerId, WorkerTemplate};

/// Boxed future returned by backend operations.
pub type ProvisionFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProvisionError>> + Send + 'a>>;

/// A worker that finished provisioning and passed its readiness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provisioned {
    pub endpoint: String,
    /// Opaque attestation id reported by the worker or fleet, if any.
    pub attestation_id: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProvisionError {
    #[error("failed to launch worker: {0}")]
    Launch(String),

    #[error("worker at {address} never passed {path} after {attempts} probes ({waited_ms}ms)")]
    HealthCheck {
        address: String,
        path: String,
        attempts: u32,
        waited_ms: u64,
    },

    #[error("remote deployment {deployment_id} failed: {reason}")]
    RemoteFailed {
        deployment_id: String,
        reason: String,
    },

    #[error("fleet api error: {0}")]
    Api(String),

    #[error("provisioning did not finish within {0:?}")]
    Timeout(Duration),

    #[error("no deployment tracked for worker {0}")]
    NotFound(WorkerId),

    #[error("teardown failed: {0}")]
    Teardown(String),
}

impl ProvisionError {
    /// Startup-phase health failure, as opposed to a launch or API error.
    pub fn is_health_check(&self) -> bool {
        matches!(self, ProvisionError::HealthCheck { .. })
    }
}

/// Strategy that materializes and destroys workers.
///
/// `create` may take tens of seconds; it returns only once the worker is
/// ready to serve, and must give up within `timeout`. Implementations
/// track their own handle per `worker_id` so `destroy` needs nothing else.
pub trait ProvisioningBackend: Send + Sync {
    /// Short name for logs (`local`, `remote`, ...).
    fn name(&self) -> &'static str;

    fn create<'a>(
        &'a self,
        worker_id: WorkerId,
        template: &'a WorkerTemplate,
        timeout: Duration,
    ) -> ProvisionFuture<'a, Provisioned>;

    fn destroy(&self, worker_id: WorkerId) -> ProvisionFuture<'_, ()>;
}

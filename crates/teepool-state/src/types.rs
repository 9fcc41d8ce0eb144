//! Worker records held by the registry.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use teepool_core::{Capability, TeeDescriptor, WorkerId};

/// Lifecycle status of a worker.
///
/// Legal edges: `starting → warm ⇄ hot → draining → stopped`, any of
/// `warm`/`hot` may drain, and `starting → error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Cold,
    Starting,
    Warm,
    Hot,
    Draining,
    Stopped,
    Error,
}

impl WorkerStatus {
    pub fn can_transition_to(self, next: WorkerStatus) -> bool {
        use WorkerStatus::*;
        matches!(
            (self, next),
            (Cold, Starting)
                | (Starting, Warm)
                | (Starting, Error)
                | (Warm, Hot)
                | (Hot, Warm)
                | (Warm, Draining)
                | (Hot, Draining)
                | (Draining, Stopped)
        )
    }

    /// Whether a worker in this status can take traffic.
    pub fn is_serving(self) -> bool {
        matches!(self, WorkerStatus::Warm | WorkerStatus::Hot)
    }

    /// Routing classification derived from the status.
    pub fn warmth(self) -> Warmth {
        match self {
            WorkerStatus::Hot => Warmth::Hot,
            WorkerStatus::Warm => Warmth::Warm,
            _ => Warmth::Cold,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerStatus::Cold => "cold",
            WorkerStatus::Starting => "starting",
            WorkerStatus::Warm => "warm",
            WorkerStatus::Hot => "hot",
            WorkerStatus::Draining => "draining",
            WorkerStatus::Stopped => "stopped",
            WorkerStatus::Error => "error",
        }
    }
}

/// Routing priority: `warm` (idle, ready) before `hot` (busy); `cold` never.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Warmth {
    Cold,
    Warm,
    Hot,
}

/// One compute node. Callers only ever see copies.
#[derive(Debug, Clone)]
pub struct Worker {
    pub id: WorkerId,
    pub capability: Capability,
    /// Network address; `None` until provisioning completes.
    pub endpoint: Option<String>,
    pub status: WorkerStatus,
    pub tee: TeeDescriptor,
    /// Unix timestamp (milliseconds) of creation.
    pub created_at_ms: u64,
    pub started_at: Instant,
    pub last_activity_at: Instant,
    /// Set once, on `starting → warm`.
    pub cold_start_duration_ms: Option<u64>,
    pub requests_served: u64,
    pub error_count: u64,
}

impl Worker {
    pub fn warmth(&self) -> Warmth {
        self.status.warmth()
    }

    /// How long the worker has gone without activity, as of `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity_at)
    }

    /// Whether this worker can serve a request for `capability`
    /// (`None` matches any capability).
    pub fn matches(&self, capability: Option<&str>) -> bool {
        capability.is_none_or(|c| c == self.capability)
    }
}

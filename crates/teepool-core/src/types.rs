//! Identifiers, policy, and launch templates shared across teepool crates.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Workload class a request asks for and a worker was launched to serve.
pub type Capability = String;

// ── Identifiers ───────────────────────────────────────────────────

/// Opaque identifier of a worker, generated by the registry.
///
/// Rendered as `tee-<n>`; ids are never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tee-{}", self.0)
    }
}

impl FromStr for WorkerId {
    type Err = String;

    /// Accepts both `tee-7` and a bare `7`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.strip_prefix("tee-").unwrap_or(s);
        digits
            .parse::<u64>()
            .map(WorkerId)
            .map_err(|_| format!("invalid worker id: {s}"))
    }
}

impl Serialize for WorkerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for WorkerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifier of a queued request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

// ── TEE ───────────────────────────────────────────────────────────

/// Trusted-execution description of a worker.
///
/// The attestation id is whatever the worker or fleet reported; it is
/// stored and echoed, never verified.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TeeDescriptor {
    pub provider: String,
    pub hardware: String,
    pub attestation_id: Option<String>,
}

// ── Templates ─────────────────────────────────────────────────────

/// Resources requested for each worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Resources {
    pub vcpu: u32,
    pub memory_mb: u64,
    pub disk_gb: u64,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            vcpu: 2,
            memory_mb: 4096,
            disk_gb: 20,
        }
    }
}

/// What a provisioning backend launches to serve one capability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerTemplate {
    pub capability: Capability,
    /// Container image (local container mode, remote) or informational label.
    pub image: String,
    /// Port the worker listens on inside its container or process.
    #[serde(default = "default_worker_port")]
    pub port: u16,
    /// HTTP path probed for readiness.
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub resources: Resources,
    #[serde(default = "default_tee_provider")]
    pub tee_provider: String,
    #[serde(default = "default_tee_hardware")]
    pub tee_hardware: String,
}

impl WorkerTemplate {
    /// A template with defaults for everything but capability and image.
    pub fn new(capability: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            image: image.into(),
            port: default_worker_port(),
            health_path: default_health_path(),
            env: HashMap::new(),
            resources: Resources::default(),
            tee_provider: default_tee_provider(),
            tee_hardware: default_tee_hardware(),
        }
    }

    /// The descriptor a worker launched from this template starts with.
    pub fn tee_descriptor(&self) -> TeeDescriptor {
        TeeDescriptor {
            provider: self.tee_provider.clone(),
            hardware: self.tee_hardware.clone(),
            attestation_id: None,
        }
    }
}

fn default_worker_port() -> u16 {
    8080
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_tee_provider() -> String {
    "local".to_string()
}

fn default_tee_hardware() -> String {
    "tdx".to_string()
}

// ── Policy ────────────────────────────────────────────────────────

/// Immutable scaling policy evaluated by the autoscaler on every tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolPolicy {
    /// Workers kept in `warm`/`hot` whenever capacity allows.
    pub min_warm_nodes: usize,
    /// Hard ceiling on tracked workers in any status.
    pub max_nodes: usize,
    /// Upper bound on a single provisioning attempt.
    pub cold_start_timeout: Duration,
    /// A `hot` worker idle for a third of this is demoted to `warm`.
    pub idle_timeout: Duration,
    /// Queue depth that forces a scale-up.
    pub scale_up_queue_threshold: usize,
    /// Idle time after which a `warm` worker may be drained.
    pub scale_down_idle_threshold: Duration,
    /// Queue length past which new requests are refused at full capacity.
    pub max_queue_depth: usize,
    /// Control loop period.
    pub tick_interval: Duration,
    /// How long a queued request waits before timing out.
    pub request_deadline: Duration,
    /// Drain workers whose error count reaches this. `None` never evicts.
    pub error_eviction_threshold: Option<u64>,
}

impl PoolPolicy {
    /// The number of warm workers the pool can actually promise.
    pub fn warm_floor(&self) -> usize {
        self.min_warm_nodes.min(self.max_nodes)
    }

    /// Idle time after which a `hot` worker is demoted to `warm`.
    pub fn demotion_idle(&self) -> Duration {
        self.idle_timeout / 3
    }
}

impl Default for PoolPolicy {
    fn default() -> Self {
        Self {
            min_warm_nodes: 1,
            max_nodes: 3,
            cold_start_timeout: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(300),
            scale_up_queue_threshold: 1,
            scale_down_idle_threshold: Duration::from_secs(600),
            max_queue_depth: 256,
            tick_interval: Duration::from_secs(10),
            request_deadline: Duration::from_secs(120),
            error_eviction_threshold: None,
        }
    }
}

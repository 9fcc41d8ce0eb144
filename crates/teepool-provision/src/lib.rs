//! teepool-provision — bringing workers online and tearing them down.
//!
//! The autoscaler only ever sees the [`ProvisioningBackend`] trait. Two
//! implementations are selected at construction time:
//!
//! ```text
//! ProvisioningBackend
//!   ├── LocalProcessBackend   container runtime or child process on a free port,
//!   │                         readiness via HTTP health probe
//!   └── RemoteBackend         fleet-management API: create → poll → delete,
//!       └── FleetApi          (HttpFleetApi over reqwest, mockable)
//! ```
//!
//! Startup probing uses a fixed interval: transient failures while a
//! worker boots are expected and only surface as
//! [`ProvisionError::HealthCheck`] once the startup window is exhausted.

pub mod backend;
pub mod local;
pub mod probe;
pub mod remote;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::{ProvisionError, ProvisionFuture, Provisioned, ProvisioningBackend};
pub use local::LocalProcessBackend;
pub use probe::{ProbeResult, http_probe, wait_until_healthy};
pub use remote::{DeploymentRequest, DeploymentState, DeploymentStatus, FleetApi, HttpFleetApi, RemoteBackend};

//! teepool-core — shared vocabulary for the teepool orchestrator.
//!
//! Every other crate in the workspace speaks in these types:
//!
//! - [`WorkerId`] / [`RequestId`]: opaque generated identifiers
//! - [`PoolPolicy`]: the immutable scaling policy the autoscaler evaluates
//! - [`WorkerTemplate`]: what a provisioning backend should launch for a capability
//! - [`PoolError`]: the user-visible failure taxonomy
//! - [`TeepoolConfig`]: the `teepool.toml` file plus environment overrides

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    BackendConfig, ConfigError, LocalBackendConfig, LocalLauncher, PolicyConfig,
    RemoteBackendConfig, TeepoolConfig,
};
pub use error::{PoolError, PoolResult};
pub use types::*;

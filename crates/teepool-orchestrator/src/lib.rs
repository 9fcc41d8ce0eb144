//! teepool-orchestrator — the entry point the transport layer talks to.
//!
//! ```text
//! route(capability)
//!   ├─ claim a warm/hot worker ─────────────────────────→ endpoint
//!   └─ none serving
//!        ├─ pool full and queue full ───────────────────→ CapacityExceeded
//!        ├─ join the starting worker, or launch one
//!        ├─ enqueue (deadline) → drain once
//!        ├─ backlog crossing → launch an extra worker, wake loop
//!        └─ wait ── assigned ───────────────────────────→ endpoint
//!                └─ timeout / provisioning failure ─────→ fallback or error
//! ```
//!
//! The orchestrator is constructed with an explicit
//! [`ProvisioningBackend`](teepool_provision::ProvisioningBackend); it
//! never picks one itself.

pub mod orchestrator;

pub use orchestrator::{Orchestrator, RouteOutcome, ShutdownReport};

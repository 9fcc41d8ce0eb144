//! teepool-state — the two shared structures of the orchestrator.
//!
//! - [`NodePoolRegistry`]: canonical table of every known worker, keyed by
//!   generated [`WorkerId`](teepool_core::WorkerId). All status changes go
//!   through its transition methods, which validate the edge against
//!   [`WorkerStatus::can_transition_to`].
//! - [`AdmissionQueue`]: FIFO of requests waiting for a warm worker. Each
//!   entry resolves exactly once through a oneshot channel: assigned,
//!   rejected, or timed out.
//!
//! # Locking
//!
//! Each structure has its own mutex and neither is held across an
//! `.await`. The only nesting is registry-then-queue, inside
//! [`AdmissionQueue::drain`].

pub mod queue;
pub mod registry;
pub mod types;

pub use queue::{Admission, AdmissionQueue, Assignment};
pub use registry::{NodePoolRegistry, Reservation, StatusCounts};
pub use types::*;

//! teepool-autoscale — keeps the warm pool sized to demand.
//!
//! The [`Autoscaler`] owns no pool state of its own. It runs a tick on a
//! fixed interval (and whenever a backlog trigger wakes it), reads a
//! registry snapshot plus the queue depth, and applies:
//!
//! ```text
//! 1. count      warm = |warm ∪ hot|, starting = |starting|
//! 2. demote     hot idle > idle_timeout / 3           → warm
//! 3. evict      serving with errors ≥ threshold       → draining → destroy   (opt-in)
//! 4. scale down warm idle > scale_down_idle_threshold → draining → destroy
//!               while warm > min_warm_nodes, longest-idle first
//! 5. backlog    queue ≥ threshold, nothing starting   → launch one
//! 6. floor      warm + starting < min(min_warm, max)  → launch one
//! ```
//!
//! At most one launch per tick. Launches reserve a `starting` slot under
//! the registry lock, then run the backend call on a spawned task; the
//! task commits `warm` (and drains the queue) or `error` (and rejects the
//! requests that were waiting on that attempt).

pub mod scaler;

pub use scaler::{Autoscaler, Capacity, LaunchReason, TickPlan, TickReport};

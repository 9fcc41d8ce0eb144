//! teepool-metrics — operational numbers derived from the pool.
//!
//! [`StatsCollector`] holds no state of its own: every call takes a fresh
//! registry snapshot and the current queue depth and folds them into a
//! [`PoolStats`]. [`render_prometheus`] turns the same numbers into the
//! Prometheus text exposition format.

pub mod prometheus;
pub mod stats;

pub use prometheus::render_prometheus;
pub use stats::{PoolStats, StatsCollector};

//! StatsCollector — pure aggregation over a registry snapshot.

use std::sync::Arc;

use serde::Serialize;

use teepool_state::{AdmissionQueue, NodePoolRegistry, StatusCounts, Worker, WorkerStatus};

/// Point-in-time pool metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Requests assigned over the orchestrator's lifetime.
    pub total_requests: u64,
    pub queued_requests: usize,
    /// Mean cold start across workers that completed one, in milliseconds.
    pub average_cold_start_ms: f64,
    /// Workers able to serve (`warm` + `hot`).
    pub nodes_warm: usize,
    pub nodes_hot: usize,
    /// Workers that are neither serving nor starting.
    pub nodes_cold: usize,
    pub nodes_starting: usize,
    pub nodes_draining: usize,
    pub nodes_total: usize,
    pub errors_total: u64,
}

impl PoolStats {
    /// Fold a snapshot into stats. No side effects.
    pub fn from_snapshot(workers: &[Worker], queue_depth: usize, total_requests: u64) -> Self {
        let counts = StatusCounts::from_workers(workers);
        Self {
            total_requests,
            queued_requests: queue_depth,
            average_cold_start_ms: average_cold_start(workers),
            nodes_warm: counts.serving(),
            nodes_hot: counts.hot,
            nodes_cold: counts.total() - counts.serving() - counts.starting,
            nodes_starting: counts.starting,
            nodes_draining: counts.draining,
            nodes_total: counts.total(),
            errors_total: workers.iter().map(|w| w.error_count).sum(),
        }
    }
}

/// Incremental mean: each completed cold start weighs `1 / count so far`.
fn average_cold_start(workers: &[Worker]) -> f64 {
    let mut mean = 0.0;
    let mut count = 0u32;
    for sample in workers.iter().filter_map(|w| w.cold_start_duration_ms) {
        count += 1;
        mean += (sample as f64 - mean) / count as f64;
    }
    mean
}

/// Reads the registry and queue on demand. Safe to share across tasks.
#[derive(Clone)]
pub struct StatsCollector {
    registry: Arc<NodePoolRegistry>,
    queue: AdmissionQueue,
}

impl StatsCollector {
    pub fn new(registry: Arc<NodePoolRegistry>, queue: AdmissionQueue) -> Self {
        Self { registry, queue }
    }

    pub fn collect(&self) -> PoolStats {
        let workers = self.registry.snapshot();
        PoolStats::from_snapshot(&workers, self.queue.depth(), self.registry.total_requests())
    }

    /// Number of workers currently in `status`.
    pub fn count(&self, status: WorkerStatus) -> usize {
        self.registry
            .snapshot()
            .iter()
            .filter(|w| w.status == status)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use teepool_core::WorkerTemplate;

    fn template() -> WorkerTemplate {
        WorkerTemplate::new("default", "img")
    }

    #[test]
    fn empty_pool() {
        let stats = PoolStats::from_snapshot(&[], 0, 0);
        assert_eq!(stats.nodes_total, 0);
        assert_eq!(stats.average_cold_start_ms, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn counts_and_cold_start_mean() {
        let registry = Arc::new(NodePoolRegistry::new());
        let queue = AdmissionQueue::new();

        let a = registry.insert_starting(&template());
        tokio::time::advance(Duration::from_millis(1000)).await;
        registry.mark_warm(a.id, "h:1", None);

        let b = registry.insert_starting(&template());
        tokio::time::advance(Duration::from_millis(3000)).await;
        registry.mark_warm(b.id, "h:2", None);
        registry.assign(b.id);

        registry.insert_starting(&template());

        let c = registry.insert_starting(&template());
        registry.mark_error(c.id);

        let collector = StatsCollector::new(registry.clone(), queue);
        let stats = collector.collect();

        assert_eq!(stats.nodes_warm, 2);
        assert_eq!(stats.nodes_hot, 1);
        assert_eq!(stats.nodes_starting, 1);
        assert_eq!(stats.nodes_cold, 1);
        assert_eq!(stats.nodes_total, 4);
        assert_eq!(stats.total_requests, 1);
        assert!((stats.average_cold_start_ms - 2000.0).abs() < f64::EPSILON);
        assert_eq!(collector.count(WorkerStatus::Starting), 1);
    }

    #[tokio::test]
    async fn queue_depth_is_reported() {
        let registry = Arc::new(NodePoolRegistry::new());
        let queue = AdmissionQueue::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        let _a = queue.enqueue(None, deadline, None);
        let _b = queue.enqueue(None, deadline, None);

        let stats = StatsCollector::new(registry, queue).collect();
        assert_eq!(stats.queued_requests, 2);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(PoolStats::from_snapshot(&[], 3, 7)).unwrap();
        assert_eq!(json["queuedRequests"], 3);
        assert_eq!(json["totalRequests"], 7);
        assert!(json.get("averageColdStartMs").is_some());
        assert!(json.get("nodesStarting").is_some());
    }
}

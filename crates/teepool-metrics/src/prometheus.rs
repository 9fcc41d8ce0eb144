//! Prometheus text exposition format.
//!
//! Renders [`PoolStats`] for scraping by a Prometheus server or a
//! compatible agent.

use std::fmt::Write;

use crate::stats::PoolStats;

fn metric(out: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}

/// Render pool stats into Prometheus text format.
pub fn render_prometheus(stats: &PoolStats) -> String {
    let mut out = String::new();

    metric(
        &mut out,
        "teepool_requests_total",
        "counter",
        "Requests assigned to a worker.",
        stats.total_requests,
    );
    metric(
        &mut out,
        "teepool_errors_total",
        "counter",
        "Request failures reported against live workers.",
        stats.errors_total,
    );
    metric(
        &mut out,
        "teepool_queue_depth",
        "gauge",
        "Requests waiting for a worker.",
        stats.queued_requests,
    );
    metric(
        &mut out,
        "teepool_cold_start_ms_avg",
        "gauge",
        "Mean cold start duration in milliseconds.",
        format!("{:.2}", stats.average_cold_start_ms),
    );

    let _ = writeln!(out, "# HELP teepool_nodes Workers by lifecycle state.");
    let _ = writeln!(out, "# TYPE teepool_nodes gauge");
    for (state, value) in [
        ("serving", stats.nodes_warm),
        ("hot", stats.nodes_hot),
        ("starting", stats.nodes_starting),
        ("draining", stats.nodes_draining),
        ("cold", stats.nodes_cold),
    ] {
        let _ = writeln!(out, "teepool_nodes{{state=\"{state}\"}} {value}");
    }

    out
}
